use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use chrono::{Duration, Local, NaiveDate, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use crate::models::Table;

/// The on-device database: one table per entity, the pending-mutation log,
/// and sync metadata.
pub struct Database {
    pub(crate) conn: Connection,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })?;
        let db = Database { conn };
        db.migrate()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Database { conn };
        db.migrate()?;
        Ok(db)
    }

    // Safe to run on every launch: each step is guarded by user_version and
    // every statement is IF NOT EXISTS.
    fn migrate(&self) -> Result<()> {
        let version: i64 = self
            .conn
            .pragma_query_value(None, "user_version", |row| row.get(0))?;

        if version < 1 {
            for table in Table::ALL {
                self.conn.execute_batch(&format!(
                    "CREATE TABLE IF NOT EXISTS {table} (
                        key TEXT PRIMARY KEY NOT NULL,
                        data TEXT NOT NULL,
                        date TEXT,
                        synced INTEGER NOT NULL DEFAULT 0 CHECK (synced IN (0, 1)),
                        updated_at TEXT NOT NULL
                    );
                    CREATE INDEX IF NOT EXISTS idx_{table}_synced_date ON {table}(synced, date);"
                ))?;
            }

            self.conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS pending_mutations (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    method TEXT NOT NULL,
                    endpoint TEXT NOT NULL,
                    body TEXT,
                    temp_id TEXT,
                    entity_table TEXT,
                    entity_key TEXT,
                    created_at TEXT NOT NULL,
                    retries INTEGER NOT NULL DEFAULT 0,
                    status TEXT NOT NULL DEFAULT 'pending'
                        CHECK (status IN ('pending', 'in_flight', 'failed'))
                );
                CREATE INDEX IF NOT EXISTS idx_pending_mutations_status ON pending_mutations(status);

                CREATE TABLE IF NOT EXISTS sync_meta (
                    key TEXT PRIMARY KEY NOT NULL,
                    value TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                PRAGMA user_version = 1;",
            )?;
        }

        Ok(())
    }

    /// Delete every row in every entity table, the mutation queue, and sync
    /// metadata. Used on sign-out.
    pub fn clear_all(&self) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        for table in Table::ALL {
            tx.execute(&format!("DELETE FROM {table}"), [])?;
        }
        tx.execute("DELETE FROM pending_mutations", [])?;
        tx.execute("DELETE FROM sync_meta", [])?;
        tx.commit()?;
        Ok(())
    }

    /// Delete confirmed history rows dated before `today - retention_days`.
    /// Unconfirmed rows are kept regardless of age.
    pub fn prune(&self, retention_days: i64, today: NaiveDate) -> Result<usize> {
        let cutoff = (today - Duration::days(retention_days))
            .format("%Y-%m-%d")
            .to_string();
        let tx = self.conn.unchecked_transaction()?;
        let mut removed = 0;
        for table in Table::ALL.into_iter().filter(|t| t.is_history()) {
            removed += tx.execute(
                &format!("DELETE FROM {table} WHERE synced = 1 AND date IS NOT NULL AND date < ?1"),
                params![cutoff],
            )?;
        }
        tx.commit()?;
        Ok(removed)
    }

    // --- Sync metadata ---

    pub fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO sync_meta (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn get_meta(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .conn
            .query_row(
                "SELECT value FROM sync_meta WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn delete_meta(&self, key: &str) -> Result<bool> {
        let rows = self
            .conn
            .execute("DELETE FROM sync_meta WHERE key = ?1", params![key])?;
        Ok(rows > 0)
    }
}

/// Shared handle to the device store.
///
/// Opened explicitly at session start and handed to every component that
/// needs it. [`Store::sign_out`] wipes it; [`Store::close`] releases the
/// connection. Locks are held only for the duration of one synchronous
/// database call, never across an `.await`.
#[derive(Clone)]
pub struct Store {
    db: Arc<Mutex<Database>>,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::from_database(Database::open(path)?))
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::from_database(Database::open_in_memory()?))
    }

    #[must_use]
    pub fn from_database(db: Database) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
        }
    }

    /// Run `f` with exclusive access to the database.
    pub fn with<R>(&self, f: impl FnOnce(&Database) -> Result<R>) -> Result<R> {
        let db = self.db.lock().unwrap_or_else(PoisonError::into_inner);
        f(&db)
    }

    pub fn sign_out(&self) -> Result<()> {
        self.with(Database::clear_all)
            .context("Failed to clear local data on sign-out")
    }

    pub fn prune(&self, retention_days: i64) -> Result<usize> {
        let today = Local::now().date_naive();
        self.with(|db| db.prune(retention_days, today))
    }

    /// Release the connection. Other clones of this handle keep it open
    /// until they are dropped too.
    pub fn close(self) -> Result<()> {
        self.with(|db| {
            db.conn.execute_batch("PRAGMA optimize;")?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Method, NewMutation, WeightEntry};

    fn weight(date: &str, kg: f64) -> WeightEntry {
        WeightEntry {
            date: NaiveDate::parse_from_str(date, "%Y-%m-%d").unwrap(),
            weight: kg,
            note: None,
        }
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        db.migrate().unwrap();
        db.migrate().unwrap();
        let version: i64 = db
            .conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap();
        assert_eq!(version, 1);
    }

    #[test]
    fn test_reopen_file_keeps_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stride.db");
        {
            let db = Database::open(&path).unwrap();
            db.upsert(&weight("2024-06-01", 72.5), true).unwrap();
        }
        let db = Database::open(&path).unwrap();
        let cached = db.get_one::<WeightEntry>("2024-06-01").unwrap().unwrap();
        assert!(cached.synced);
        assert!((cached.item.weight - 72.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_clear_all() {
        let db = Database::open_in_memory().unwrap();
        db.upsert(&weight("2024-06-01", 72.5), false).unwrap();
        db.enqueue(&NewMutation::new(Method::Post, "/weight"))
            .unwrap();
        db.set_meta("last_drain_at", "now").unwrap();

        db.clear_all().unwrap();

        assert!(db.get_one::<WeightEntry>("2024-06-01").unwrap().is_none());
        assert_eq!(db.get_pending_count().unwrap(), 0);
        assert!(db.get_meta("last_drain_at").unwrap().is_none());
    }

    #[test]
    fn test_prune_only_removes_old_confirmed_rows() {
        let db = Database::open_in_memory().unwrap();
        db.upsert(&weight("2024-01-01", 80.0), true).unwrap();
        db.upsert(&weight("2024-01-02", 79.5), false).unwrap();
        db.upsert(&weight("2024-06-01", 72.5), true).unwrap();

        let today = NaiveDate::from_ymd_opt(2024, 6, 10).unwrap();
        let removed = db.prune(30, today).unwrap();
        assert_eq!(removed, 1);

        assert!(db.get_one::<WeightEntry>("2024-01-01").unwrap().is_none());
        // Unconfirmed survives regardless of age
        assert!(db.get_one::<WeightEntry>("2024-01-02").unwrap().is_some());
        assert!(db.get_one::<WeightEntry>("2024-06-01").unwrap().is_some());
    }

    #[test]
    fn test_sync_meta_set_get_delete() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.get_meta("cursor").unwrap().is_none());
        db.set_meta("cursor", "a").unwrap();
        db.set_meta("cursor", "b").unwrap();
        assert_eq!(db.get_meta("cursor").unwrap().as_deref(), Some("b"));
        assert!(db.delete_meta("cursor").unwrap());
        assert!(!db.delete_meta("cursor").unwrap());
    }

    #[test]
    fn test_store_sign_out_clears() {
        let store = Store::open_in_memory().unwrap();
        store
            .with(|db| db.upsert(&weight("2024-06-01", 72.5), true))
            .unwrap();
        store.sign_out().unwrap();
        let row = store
            .with(|db| db.get_one::<WeightEntry>("2024-06-01"))
            .unwrap();
        assert!(row.is_none());
        store.close().unwrap();
    }
}
