use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{OptionalExtension, params, params_from_iter};
use serde_json::Value;

use crate::db::Database;
use crate::models::{Cached, Entity, Table, TypedRow, typed_row};

/// Constraints for reading (or scoping a bulk replace of) cached rows.
///
/// Date bounds apply to the row's date column; `equals` compares a top-level
/// field of the stored payload. Everything is bound as a parameter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheQuery {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    pub equals: Vec<(String, Value)>,
}

impl CacheQuery {
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn between(from: NaiveDate, to: NaiveDate) -> Self {
        Self {
            from: Some(from),
            to: Some(to),
            equals: Vec::new(),
        }
    }

    #[must_use]
    pub fn field(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.equals.push((name.to_string(), value.into()));
        self
    }

    /// The same constraints as list-endpoint query parameters.
    #[must_use]
    pub fn to_params(&self) -> Vec<(String, String)> {
        let mut params = Vec::new();
        if let Some(from) = self.from {
            params.push(("from".to_string(), from.format("%Y-%m-%d").to_string()));
        }
        if let Some(to) = self.to {
            params.push(("to".to_string(), to.format("%Y-%m-%d").to_string()));
        }
        for (field, value) in &self.equals {
            let value = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            params.push((field.clone(), value));
        }
        params
    }

    fn where_clause(&self, params: &mut Vec<SqlValue>) -> String {
        let mut clauses = Vec::new();
        if let Some(from) = self.from {
            params.push(SqlValue::Text(from.format("%Y-%m-%d").to_string()));
            clauses.push(format!("date >= ?{}", params.len()));
        }
        if let Some(to) = self.to {
            params.push(SqlValue::Text(to.format("%Y-%m-%d").to_string()));
            clauses.push(format!("date <= ?{}", params.len()));
        }
        for (field, value) in &self.equals {
            params.push(SqlValue::Text(format!("$.{field}")));
            let path_idx = params.len();
            params.push(json_to_sql(value));
            clauses.push(format!("json_extract(data, ?{path_idx}) IS ?{}", params.len()));
        }
        if clauses.is_empty() {
            "1 = 1".to_string()
        } else {
            clauses.join(" AND ")
        }
    }
}

// json_extract yields 1/0 for booleans and NULL for missing or null fields.
fn json_to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => n
            .as_i64()
            .map_or_else(|| SqlValue::Real(n.as_f64().unwrap_or_default()), SqlValue::Integer),
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn decode<T: Entity>(data: &str, synced: i64) -> Result<Cached<T>> {
    let item: T = serde_json::from_str(data)
        .with_context(|| format!("Corrupt cached row in {}", T::TABLE))?;
    Ok(Cached {
        item,
        synced: synced == 1,
    })
}

impl Database {
    fn write_row(&self, table: Table, row: &TypedRow, synced: bool) -> Result<()> {
        self.conn.execute(
            &format!(
                "INSERT INTO {table} (key, data, date, synced, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(key) DO UPDATE SET
                    data = excluded.data,
                    date = excluded.date,
                    synced = excluded.synced,
                    updated_at = excluded.updated_at"
            ),
            params![
                row.key,
                row.data,
                row.date,
                i64::from(synced),
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }

    // --- Typed accessors ---

    /// Replace the confirmed rows matched by `scope` with `items`, inserted as
    /// confirmed. A confirmed row outside `scope` with the same key is
    /// overwritten. Unconfirmed rows are never touched and keep precedence
    /// when the server list contains the same key.
    pub fn replace_confirmed<T: Entity>(&self, scope: &CacheQuery, items: &[T]) -> Result<()> {
        let table = T::TABLE;
        let tx = self.conn.unchecked_transaction()?;
        {
            let mut values = Vec::new();
            let clause = scope.where_clause(&mut values);
            tx.execute(
                &format!("DELETE FROM {table} WHERE synced = 1 AND {clause}"),
                params_from_iter(values),
            )?;

            let mut stmt = tx.prepare(&format!(
                "INSERT INTO {table} (key, data, date, synced, updated_at)
                 VALUES (?1, ?2, ?3, 1, ?4)
                 ON CONFLICT(key) DO UPDATE SET
                    data = excluded.data,
                    date = excluded.date,
                    synced = 1,
                    updated_at = excluded.updated_at
                 WHERE {table}.synced = 1"
            ))?;
            let now = Utc::now().to_rfc3339();
            for item in items {
                let row = TypedRow::from_entity(item)?;
                stmt.execute(params![row.key, row.data, row.date, now])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn upsert<T: Entity>(&self, item: &T, synced: bool) -> Result<()> {
        self.write_row(T::TABLE, &TypedRow::from_entity(item)?, synced)
    }

    pub fn delete<T: Entity>(&self, key: &str) -> Result<bool> {
        self.delete_row(T::TABLE, key)
    }

    pub fn delete_row(&self, table: Table, key: &str) -> Result<bool> {
        let rows = self
            .conn
            .execute(&format!("DELETE FROM {table} WHERE key = ?1"), params![key])?;
        Ok(rows > 0)
    }

    pub fn get_one<T: Entity>(&self, key: &str) -> Result<Option<Cached<T>>> {
        let table = T::TABLE;
        let row: Option<(String, i64)> = self
            .conn
            .query_row(
                &format!("SELECT data, synced FROM {table} WHERE key = ?1"),
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        row.map(|(data, synced)| decode(&data, synced)).transpose()
    }

    /// Read cached rows matching `query`, oldest date first.
    pub fn get_cached<T: Entity>(&self, query: &CacheQuery) -> Result<Vec<Cached<T>>> {
        let table = T::TABLE;
        let mut values = Vec::new();
        let clause = query.where_clause(&mut values);
        let mut stmt = self.conn.prepare(&format!(
            "SELECT data, synced FROM {table} WHERE {clause} ORDER BY date, key"
        ))?;
        let rows = stmt
            .query_map(params_from_iter(values), |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows.iter()
            .map(|(data, synced)| decode(data, *synced))
            .collect()
    }

    pub fn count_unconfirmed(&self, table: Table) -> Result<i64> {
        let count = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM {table} WHERE synced = 0"),
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    // --- Untyped paths used while replaying the queue ---

    /// Mark a row confirmed. With `data`, the server's payload replaces the
    /// local one (it is validated against the table's record type first).
    pub fn confirm_row(&self, table: Table, key: &str, data: Option<&Value>) -> Result<()> {
        match data {
            Some(value) => {
                let row = typed_row(table, value)?;
                let tx = self.conn.unchecked_transaction()?;
                if row.key != key {
                    tx.execute(&format!("DELETE FROM {table} WHERE key = ?1"), params![key])?;
                }
                self.write_row(table, &row, true)?;
                tx.commit()?;
            }
            None => {
                self.conn.execute(
                    &format!("UPDATE {table} SET synced = 1, updated_at = ?1 WHERE key = ?2"),
                    params![Utc::now().to_rfc3339(), key],
                )?;
            }
        }
        Ok(())
    }

    /// Swap a temp-keyed row for the server's row in one transaction, so no
    /// reader sees both rows or neither. Queued mutations and dependent rows
    /// that still mention the temp id are rewritten in the same transaction.
    pub fn reconcile_temp_id(&self, table: Table, temp_id: &str, server: &Value) -> Result<String> {
        let row = typed_row(table, server)?;
        let real_id = row.key.clone();

        let tx = self.conn.unchecked_transaction()?;
        if real_id != temp_id {
            tx.execute(
                &format!("DELETE FROM {table} WHERE key = ?1"),
                params![temp_id],
            )?;
        }
        self.write_row(table, &row, true)?;

        if real_id != temp_id {
            for (child, field) in table.dependents() {
                let path = format!("$.{field}");
                tx.execute(
                    &format!(
                        "UPDATE OR REPLACE {child}
                         SET key = replace(key, ?1, ?2), data = json_set(data, ?3, ?2)
                         WHERE json_extract(data, ?3) = ?1"
                    ),
                    params![temp_id, real_id, path],
                )?;
            }
            self.rewrite_temp_id(temp_id, &real_id)?;
        }
        tx.commit()?;
        Ok(real_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Habit, HabitEntry, Todo, WeightEntry};
    use serde_json::json;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn weight(d: &str, kg: f64) -> WeightEntry {
        WeightEntry {
            date: date(d),
            weight: kg,
            note: None,
        }
    }

    fn todo(id: &str, title: &str, completed: bool) -> Todo {
        Todo {
            todo_id: id.to_string(),
            title: title.to_string(),
            notes: None,
            completed,
            due_date: None,
            category: Some("home".to_string()),
        }
    }

    fn habit(id: &str, name: &str) -> Habit {
        Habit {
            habit_id: id.to_string(),
            name: name.to_string(),
            color: None,
            frequency: None,
            archived: false,
        }
    }

    #[test]
    fn test_upsert_keeps_one_row_per_key() {
        let db = Database::open_in_memory().unwrap();
        db.upsert(&weight("2024-06-01", 72.5), false).unwrap();
        db.upsert(&weight("2024-06-01", 72.0), true).unwrap();

        let rows: Vec<Cached<WeightEntry>> = db.get_cached(&CacheQuery::all()).unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].synced);
        assert!((rows[0].item.weight - 72.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_replace_confirmed_preserves_unconfirmed() {
        let db = Database::open_in_memory().unwrap();
        db.upsert(&todo("t_1", "old", false), true).unwrap();
        db.upsert(&todo("temp_1_abc", "offline", false), false).unwrap();
        db.upsert(&todo("t_2", "local edit", true), false).unwrap();

        // Server knows t_2 with a stale title and t_3; t_1 is gone
        db.replace_confirmed(
            &CacheQuery::all(),
            &[todo("t_2", "server title", false), todo("t_3", "new", false)],
        )
        .unwrap();

        let rows: Vec<Cached<Todo>> = db.get_cached(&CacheQuery::all()).unwrap();
        let keys: Vec<&str> = rows.iter().map(|r| r.item.todo_id.as_str()).collect();
        assert_eq!(keys.len(), 3);
        assert!(!keys.contains(&"t_1"));

        let t2 = db.get_one::<Todo>("t_2").unwrap().unwrap();
        assert!(!t2.synced);
        assert_eq!(t2.item.title, "local edit");

        let temp = db.get_one::<Todo>("temp_1_abc").unwrap().unwrap();
        assert!(!temp.synced);
        assert!(db.get_one::<Todo>("t_3").unwrap().unwrap().synced);
    }

    #[test]
    fn test_replace_confirmed_scoped_to_range() {
        let db = Database::open_in_memory().unwrap();
        db.upsert(&weight("2024-05-01", 74.0), true).unwrap();
        db.upsert(&weight("2024-06-01", 72.5), true).unwrap();

        let june = CacheQuery::between(date("2024-06-01"), date("2024-06-30"));
        db.replace_confirmed(&june, &[weight("2024-06-02", 72.1)])
            .unwrap();

        assert!(db.get_one::<WeightEntry>("2024-05-01").unwrap().is_some());
        assert!(db.get_one::<WeightEntry>("2024-06-01").unwrap().is_none());
        assert!(db.get_one::<WeightEntry>("2024-06-02").unwrap().is_some());
    }

    #[test]
    fn test_replace_confirmed_overwrites_row_outside_scope() {
        let db = Database::open_in_memory().unwrap();
        db.upsert(&todo("t_1", "reopened elsewhere", true), true)
            .unwrap();
        db.upsert(&todo("t_2", "local", true), false).unwrap();

        let open = CacheQuery::all().field("completed", false);
        db.replace_confirmed(
            &open,
            &[
                todo("t_1", "reopened elsewhere", false),
                todo("t_2", "server", false),
            ],
        )
        .unwrap();

        let t1 = db.get_one::<Todo>("t_1").unwrap().unwrap();
        assert!(t1.synced);
        assert!(!t1.item.completed);
        let open_rows: Vec<Cached<Todo>> = db.get_cached(&open).unwrap();
        assert_eq!(open_rows.len(), 1);

        // Unconfirmed row outside the scope is still left alone
        let t2 = db.get_one::<Todo>("t_2").unwrap().unwrap();
        assert!(!t2.synced);
        assert_eq!(t2.item.title, "local");
    }

    #[test]
    fn test_get_cached_filters() {
        let db = Database::open_in_memory().unwrap();
        db.upsert(&todo("t_1", "a", true), true).unwrap();
        db.upsert(&todo("t_2", "b", false), true).unwrap();
        let mut other = todo("t_3", "c", false);
        other.category = Some("work".to_string());
        db.upsert(&other, true).unwrap();

        let open: Vec<Cached<Todo>> = db
            .get_cached(&CacheQuery::all().field("completed", false))
            .unwrap();
        assert_eq!(open.len(), 2);

        let home_open: Vec<Cached<Todo>> = db
            .get_cached(
                &CacheQuery::all()
                    .field("completed", false)
                    .field("category", "home"),
            )
            .unwrap();
        assert_eq!(home_open.len(), 1);
        assert_eq!(home_open[0].item.todo_id, "t_2");
    }

    #[test]
    fn test_filter_value_is_not_interpolated() {
        let db = Database::open_in_memory().unwrap();
        db.upsert(&todo("t_1", "a", false), true).unwrap();
        let rows: Vec<Cached<Todo>> = db
            .get_cached(&CacheQuery::all().field("title", "a' OR '1'='1"))
            .unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn test_query_params() {
        let query = CacheQuery::between(date("2024-03-01"), date("2024-03-31"))
            .field("completed", false)
            .field("category", "work");
        assert_eq!(
            query.to_params(),
            [
                ("from".to_string(), "2024-03-01".to_string()),
                ("to".to_string(), "2024-03-31".to_string()),
                ("completed".to_string(), "false".to_string()),
                ("category".to_string(), "work".to_string()),
            ]
        );
    }

    #[test]
    fn test_get_cached_date_range() {
        let db = Database::open_in_memory().unwrap();
        for (d, kg) in [("2024-05-31", 73.0), ("2024-06-01", 72.5), ("2024-06-15", 72.0)] {
            db.upsert(&weight(d, kg), true).unwrap();
        }
        let rows: Vec<Cached<WeightEntry>> = db
            .get_cached(&CacheQuery::between(date("2024-06-01"), date("2024-06-30")))
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].item.date, date("2024-06-01"));
    }

    #[test]
    fn test_delete() {
        let db = Database::open_in_memory().unwrap();
        db.upsert(&habit("h_1", "Read"), true).unwrap();
        assert!(db.delete::<Habit>("h_1").unwrap());
        assert!(!db.delete::<Habit>("h_1").unwrap());
    }

    #[test]
    fn test_confirm_row_without_data() {
        let db = Database::open_in_memory().unwrap();
        db.upsert(&weight("2024-06-01", 72.5), false).unwrap();
        db.confirm_row(Table::WeightEntries, "2024-06-01", None)
            .unwrap();
        assert!(db.get_one::<WeightEntry>("2024-06-01").unwrap().unwrap().synced);
        assert_eq!(db.count_unconfirmed(Table::WeightEntries).unwrap(), 0);
    }

    #[test]
    fn test_confirm_row_with_server_data() {
        let db = Database::open_in_memory().unwrap();
        db.upsert(&weight("2024-06-01", 72.5), false).unwrap();
        db.confirm_row(
            Table::WeightEntries,
            "2024-06-01",
            Some(&json!({ "date": "2024-06-01", "weight": 72.4, "note": "scale" })),
        )
        .unwrap();
        let row = db.get_one::<WeightEntry>("2024-06-01").unwrap().unwrap();
        assert!(row.synced);
        assert_eq!(row.item.note.as_deref(), Some("scale"));
    }

    #[test]
    fn test_reconcile_temp_id_swaps_rows() {
        let db = Database::open_in_memory().unwrap();
        db.upsert(&habit("temp_1_abc", "Read"), false).unwrap();

        let real = db
            .reconcile_temp_id(
                Table::Habits,
                "temp_1_abc",
                &json!({ "habitId": "h_42", "name": "Read" }),
            )
            .unwrap();
        assert_eq!(real, "h_42");

        let rows: Vec<Cached<Habit>> = db.get_cached(&CacheQuery::all()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].item.habit_id, "h_42");
        assert!(rows[0].synced);
    }

    #[test]
    fn test_reconcile_same_id_marks_confirmed() {
        let db = Database::open_in_memory().unwrap();
        db.upsert(&habit("h_7", "Run"), false).unwrap();
        db.reconcile_temp_id(
            Table::Habits,
            "h_7",
            &json!({ "habitId": "h_7", "name": "Run daily" }),
        )
        .unwrap();
        let row = db.get_one::<Habit>("h_7").unwrap().unwrap();
        assert!(row.synced);
        assert_eq!(row.item.name, "Run daily");
    }

    #[test]
    fn test_reconcile_rekeys_dependent_rows() {
        let db = Database::open_in_memory().unwrap();
        db.upsert(&habit("temp_1_abc", "Read"), false).unwrap();
        let entry = HabitEntry {
            habit_id: "temp_1_abc".to_string(),
            date: date("2024-06-01"),
            completed: true,
            value: None,
        };
        db.upsert(&entry, false).unwrap();

        db.reconcile_temp_id(
            Table::Habits,
            "temp_1_abc",
            &json!({ "habitId": "h_42", "name": "Read" }),
        )
        .unwrap();

        assert!(
            db.get_one::<HabitEntry>("temp_1_abc:2024-06-01")
                .unwrap()
                .is_none()
        );
        let moved = db.get_one::<HabitEntry>("h_42:2024-06-01").unwrap().unwrap();
        assert_eq!(moved.item.habit_id, "h_42");
        assert!(!moved.synced);
    }

    #[test]
    fn test_reconcile_rejects_payload_without_id() {
        let db = Database::open_in_memory().unwrap();
        db.upsert(&habit("temp_1_abc", "Read"), false).unwrap();
        assert!(
            db.reconcile_temp_id(Table::Habits, "temp_1_abc", &json!({ "name": "Read" }))
                .is_err()
        );
        // Nothing changed
        assert!(db.get_one::<Habit>("temp_1_abc").unwrap().is_some());
    }
}
