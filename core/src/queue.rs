use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{OptionalExtension, params};

use crate::db::Database;
use crate::models::{Method, MutationStatus, NewMutation, PendingMutation, Table};

const MUTATION_COLUMNS: &str =
    "id, method, endpoint, body, temp_id, entity_table, entity_key, created_at, retries, status";

fn conversion_error(idx: usize, err: anyhow::Error) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, err.into())
}

impl Database {
    fn mutation_from_row(row: &rusqlite::Row) -> rusqlite::Result<PendingMutation> {
        let method: String = row.get(1)?;
        let body: Option<String> = row.get(3)?;
        let entity_table: Option<String> = row.get(5)?;
        let status: String = row.get(9)?;
        Ok(PendingMutation {
            id: row.get(0)?,
            method: Method::parse(&method).map_err(|e| conversion_error(1, e))?,
            endpoint: row.get(2)?,
            body: body
                .map(|b| serde_json::from_str(&b))
                .transpose()
                .map_err(|e| conversion_error(3, e.into()))?,
            temp_id: row.get(4)?,
            entity_table: entity_table.as_deref().and_then(Table::from_name),
            entity_key: row.get(6)?,
            created_at: row.get(7)?,
            retries: row.get(8)?,
            status: MutationStatus::parse(&status).map_err(|e| conversion_error(9, e))?,
        })
    }

    fn set_status(&self, id: i64, status: MutationStatus) -> Result<()> {
        self.conn.execute(
            "UPDATE pending_mutations SET status = ?1 WHERE id = ?2",
            params![status.as_str(), id],
        )?;
        Ok(())
    }

    // --- Queue operations ---

    /// Append a mutation with status `pending`. Nothing is rejected here: the
    /// caller only enqueues writes whose live attempt already failed offline.
    pub fn enqueue(&self, mutation: &NewMutation) -> Result<i64> {
        let body = mutation
            .body
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        self.conn.execute(
            "INSERT INTO pending_mutations
                (method, endpoint, body, temp_id, entity_table, entity_key, created_at, retries, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, 'pending')",
            params![
                mutation.method.as_str(),
                mutation.endpoint,
                body,
                mutation.temp_id,
                mutation.entity_table.map(Table::as_str),
                mutation.entity_key,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn dequeue(&self, id: i64) -> Result<()> {
        self.conn
            .execute("DELETE FROM pending_mutations WHERE id = ?1", params![id])?;
        Ok(())
    }

    pub fn find_mutation(&self, id: i64) -> Result<Option<PendingMutation>> {
        let mutation = self
            .conn
            .query_row(
                &format!("SELECT {MUTATION_COLUMNS} FROM pending_mutations WHERE id = ?1"),
                params![id],
                Self::mutation_from_row,
            )
            .optional()?;
        Ok(mutation)
    }

    pub fn get_mutation(&self, id: i64) -> Result<PendingMutation> {
        self.find_mutation(id)?.context("Mutation not found")
    }

    /// Replay order: every `pending` or `failed` entry, oldest first.
    pub fn get_queue(&self) -> Result<Vec<PendingMutation>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {MUTATION_COLUMNS} FROM pending_mutations
             WHERE status IN ('pending', 'failed') ORDER BY id ASC"
        ))?;
        let queue = stmt
            .query_map([], Self::mutation_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(queue)
    }

    pub fn mark_in_flight(&self, id: i64) -> Result<()> {
        self.set_status(id, MutationStatus::InFlight)
    }

    pub fn mark_pending(&self, id: i64) -> Result<()> {
        self.set_status(id, MutationStatus::Pending)
    }

    pub fn mark_failed(&self, id: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE pending_mutations SET status = 'failed', retries = retries + 1 WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    /// Entries in `pending`, `failed` or `in_flight`.
    pub fn get_pending_count(&self) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM pending_mutations
             WHERE status IN ('pending', 'failed', 'in_flight')",
            [],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    /// Whether a queued entry still targets this row. New writes to the same
    /// row must wait behind it.
    pub fn has_queued_for(&self, table: Table, key: &str) -> Result<bool> {
        let queued: bool = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM pending_mutations
             WHERE entity_table = ?1 AND entity_key = ?2
               AND status IN ('pending', 'failed', 'in_flight'))",
            params![table.as_str(), key],
            |row| row.get(0),
        )?;
        Ok(queued)
    }

    /// Entries parked after exceeding the retry ceiling.
    pub fn get_failed_mutations(&self, max_retries: u32) -> Result<Vec<PendingMutation>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {MUTATION_COLUMNS} FROM pending_mutations
             WHERE status = 'failed' AND retries > ?1 ORDER BY id ASC"
        ))?;
        let failed = stmt
            .query_map(params![max_retries], Self::mutation_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(failed)
    }

    /// Purge parked entries. Only ever called on explicit user action.
    pub fn clear_failed(&self, max_retries: u32) -> Result<usize> {
        let rows = self.conn.execute(
            "DELETE FROM pending_mutations WHERE status = 'failed' AND retries > ?1",
            params![max_retries],
        )?;
        Ok(rows)
    }

    /// Give a parked entry a fresh set of attempts.
    pub fn requeue(&self, id: i64) -> Result<()> {
        let rows = self.conn.execute(
            "UPDATE pending_mutations SET status = 'pending', retries = 0 WHERE id = ?1",
            params![id],
        )?;
        if rows == 0 {
            anyhow::bail!("Mutation {id} not found");
        }
        Ok(())
    }

    /// Reset entries stranded `in_flight` by an interrupted drain.
    pub fn recover_in_flight(&self) -> Result<usize> {
        let rows = self.conn.execute(
            "UPDATE pending_mutations SET status = 'pending' WHERE status = 'in_flight'",
            [],
        )?;
        Ok(rows)
    }

    /// Point queued entries created against a temp id at the server's id.
    pub fn rewrite_temp_id(&self, temp_id: &str, real_id: &str) -> Result<usize> {
        let rows = self.conn.execute(
            "UPDATE pending_mutations
             SET endpoint = replace(endpoint, ?1, ?2),
                 body = replace(body, ?1, ?2),
                 entity_key = replace(entity_key, ?1, ?2)
             WHERE status != 'in_flight'
               AND (instr(endpoint, ?1) > 0 OR instr(body, ?1) > 0 OR instr(entity_key, ?1) > 0)",
            params![temp_id, real_id],
        )?;
        Ok(rows)
    }
}
