use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result, bail};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::api::{ApiRequest, Requester, entity_field};
use crate::cache::CacheQuery;
use crate::db::Store;
use crate::models::{Cached, Entity, Method, NewMutation, is_temp_id, new_temp_id};
use crate::writer::CacheWriter;

/// Where the records returned by a fetch came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Network,
    /// The network was unreachable; this is what the cache holds.
    Cache,
}

#[derive(Debug, Clone)]
pub struct Fetched<T> {
    pub records: Vec<Cached<T>>,
    pub source: Source,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Delivery {
    /// The server accepted the write.
    Sent,
    /// Deferred to the mutation queue.
    Queued,
}

#[derive(Debug, Clone)]
pub struct Saved<T> {
    pub item: T,
    pub delivery: Delivery,
}

enum Attempt {
    Accepted(Value),
    Queued,
}

/// A write can't reach the server while its path still names a temp id.
fn mentions_temp_id(endpoint: &str) -> bool {
    endpoint.split('/').any(is_temp_id)
}

/// Request body for a create or update. The server owns the id field.
fn request_body<T: Entity>(item: &T) -> Result<Value> {
    let mut body = serde_json::to_value(item)?;
    if let (Some(field), Some(obj)) = (T::TABLE.id_field(), body.as_object_mut()) {
        obj.remove(field);
    }
    Ok(body)
}

fn sort_records<T: Entity>(records: &mut [Cached<T>]) {
    records.sort_by_cached_key(|c| (c.item.date(), c.item.cache_key()));
}

/// Offline-first reads and writes for one entity type.
///
/// Holds the in-memory list a screen renders from. Reads go cache first,
/// then network; writes are applied optimistically, sent, and either
/// confirmed, queued when offline, or rolled back when the server rejects
/// them.
pub struct Resource<T, R> {
    store: Store,
    requester: Arc<R>,
    writer: Arc<CacheWriter>,
    state: Mutex<Vec<Cached<T>>>,
}

impl<T: Entity, R: Requester> Resource<T, R> {
    pub fn new(store: Store, requester: Arc<R>, writer: Arc<CacheWriter>) -> Self {
        Self {
            store,
            requester,
            writer,
            state: Mutex::new(Vec::new()),
        }
    }

    fn state(&self) -> MutexGuard<'_, Vec<Cached<T>>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, records: Vec<Cached<T>>) {
        *self.state() = records;
    }

    fn put_state(&self, replaces: &str, record: Cached<T>) {
        let key = record.item.cache_key();
        let mut state = self.state();
        state.retain(|c| {
            let k = c.item.cache_key();
            k != replaces && k != key
        });
        state.push(record);
        sort_records(&mut state);
    }

    fn remove_state(&self, key: &str) {
        self.state().retain(|c| c.item.cache_key() != key);
    }

    /// Snapshot of the in-memory list.
    #[must_use]
    pub fn items(&self) -> Vec<Cached<T>> {
        self.state().clone()
    }

    pub fn clear(&self) {
        self.state().clear();
    }

    /// One cached record by key.
    pub fn get(&self, key: &str) -> Result<Option<Cached<T>>> {
        self.store.with(|db| db.get_one::<T>(key))
    }

    /// Read the cache only and render from it.
    pub fn cached(&self, query: &CacheQuery) -> Result<Vec<Cached<T>>> {
        let records = self.store.with(|db| db.get_cached::<T>(query))?;
        self.set_state(records.clone());
        Ok(records)
    }

    /// Cache first, then network. An unreachable server is not an error:
    /// the cached records are returned with [`Source::Cache`].
    pub async fn fetch(&self, query: &CacheQuery) -> Result<Fetched<T>> {
        let cached = self.store.with(|db| db.get_cached::<T>(query))?;
        if !cached.is_empty() {
            self.set_state(cached.clone());
        }

        let request = ApiRequest::get(T::list_path()).with_query(query.to_params());
        let response = match self.requester.request(request).await {
            Ok(response) => response,
            Err(err) if err.is_offline() => {
                debug!(table = %T::TABLE, error = %err, "Offline, serving cached records");
                self.set_state(cached.clone());
                return Ok(Fetched {
                    records: cached,
                    source: Source::Cache,
                });
            }
            Err(err) => return Err(err.into()),
        };

        let field = T::TABLE.list_field();
        let list = response
            .get(field)
            .cloned()
            .with_context(|| format!("Response has no `{field}` list"))?;
        let items: Vec<T> = serde_json::from_value(list)
            .with_context(|| format!("Failed to parse `{field}` list"))?;

        // Unconfirmed local rows win over the server copy until replayed.
        let mut records: Vec<Cached<T>> = cached.into_iter().filter(|c| !c.synced).collect();
        let local: HashSet<String> = records.iter().map(|c| c.item.cache_key()).collect();
        records.extend(
            items
                .iter()
                .filter(|item| !local.contains(&item.cache_key()))
                .cloned()
                .map(Cached::confirmed),
        );
        sort_records(&mut records);
        self.set_state(records.clone());

        let scope = query.clone();
        self.writer
            .spawn("refresh", move |db| db.replace_confirmed(&scope, &items));

        Ok(Fetched {
            records,
            source: Source::Network,
        })
    }

    /// Send the write, or queue it when the device is offline, the path
    /// still depends on an unreconciled temp id, or an earlier write to the
    /// same row is still queued.
    async fn attempt(&self, mutation: NewMutation) -> Result<Attempt> {
        let behind_queue = match (mutation.entity_table, &mutation.entity_key) {
            (Some(table), Some(key)) => self.store.with(|db| db.has_queued_for(table, key))?,
            _ => false,
        };
        if !behind_queue && !mentions_temp_id(&mutation.endpoint) {
            let mut request = ApiRequest::new(mutation.method, mutation.endpoint.clone());
            request.body.clone_from(&mutation.body);
            match self.requester.request(request).await {
                Ok(response) => return Ok(Attempt::Accepted(response)),
                Err(err) if err.is_offline() => {
                    debug!(endpoint = %mutation.endpoint, error = %err, "Offline, queueing mutation");
                }
                Err(err) => return Err(err.into()),
            }
        }
        let id = self.store.with(|db| db.enqueue(&mutation))?;
        debug!(id, method = %mutation.method, endpoint = %mutation.endpoint, "Mutation queued");
        Ok(Attempt::Queued)
    }

    /// Take the server's copy as truth: in memory now, in the cache in the
    /// background.
    fn accept(&self, key: &str, temp_id: bool, local: T, response: &Value) -> T {
        let table = T::TABLE;
        let server = entity_field(response, table.response_field()).cloned();
        let parsed = server.as_ref().and_then(|value| {
            serde_json::from_value::<T>(value.clone())
                .map_err(|e| warn!(%table, error = %e, "Ignoring unparseable server entity"))
                .ok()
        });

        let key = key.to_string();
        match server {
            Some(server) if temp_id => {
                let temp = key.clone();
                self.writer.spawn("reconcile", move |db| {
                    db.reconcile_temp_id(table, &temp, &server).map(|_| ())
                });
            }
            server => {
                let confirmed = key.clone();
                self.writer.spawn("confirm", move |db| {
                    db.confirm_row(table, &confirmed, server.as_ref())
                });
            }
        }

        let item = parsed.unwrap_or(local);
        self.put_state(&key, Cached::confirmed(item.clone()));
        item
    }

    fn rollback(&self, key: &str, previous: Option<Cached<T>>) {
        let restored = self.store.with(|db| match &previous {
            Some(prev) => db.upsert(&prev.item, prev.synced),
            None => db.delete_row(T::TABLE, key).map(|_| ()),
        });
        if let Err(e) = restored {
            warn!(table = %T::TABLE, key, error = %e, "Failed to roll back optimistic write");
        }
        match previous {
            Some(prev) => self.put_state(key, prev),
            None => self.remove_state(key),
        }
    }

    /// Apply `item` locally as unconfirmed and return what it replaced.
    fn write_optimistic(&self, item: &T) -> Result<Option<Cached<T>>> {
        let key = item.cache_key();
        let previous = self.store.with(|db| {
            let previous = db.get_one::<T>(&key)?;
            db.upsert(item, false)?;
            Ok(previous)
        })?;
        self.put_state(&key, Cached::pending(item.clone()));
        Ok(previous)
    }

    pub async fn create(&self, mut draft: T) -> Result<Saved<T>> {
        let temp_id = match T::TABLE.id_field() {
            Some(_) if draft.cache_key().is_empty() => {
                let id = new_temp_id();
                draft.assign_id(&id);
                Some(id)
            }
            _ => None,
        };
        let key = draft.cache_key();
        if key.is_empty() {
            bail!("Cannot create {} without a key", T::TABLE);
        }
        let body = request_body(&draft)?;
        let previous = self.write_optimistic(&draft)?;

        let mut mutation = NewMutation::new(Method::Post, draft.create_path())
            .with_body(body)
            .for_entity(T::TABLE, &key);
        if let Some(temp_id) = &temp_id {
            mutation = mutation.with_temp_id(temp_id);
        }

        match self.attempt(mutation).await {
            Ok(Attempt::Queued) => Ok(Saved {
                item: draft,
                delivery: Delivery::Queued,
            }),
            Ok(Attempt::Accepted(response)) => Ok(Saved {
                item: self.accept(&key, temp_id.is_some(), draft, &response),
                delivery: Delivery::Sent,
            }),
            Err(e) => {
                self.rollback(&key, previous);
                Err(e)
            }
        }
    }

    pub async fn update(&self, item: T) -> Result<Saved<T>> {
        let key = item.cache_key();
        if key.is_empty() {
            bail!("Cannot update {} without a key", T::TABLE);
        }
        let body = request_body(&item)?;
        let previous = self.write_optimistic(&item)?;

        let mutation = NewMutation::new(Method::Patch, T::item_path(&key))
            .with_body(body)
            .for_entity(T::TABLE, &key);

        match self.attempt(mutation).await {
            Ok(Attempt::Queued) => Ok(Saved {
                item,
                delivery: Delivery::Queued,
            }),
            Ok(Attempt::Accepted(response)) => Ok(Saved {
                item: self.accept(&key, false, item, &response),
                delivery: Delivery::Sent,
            }),
            Err(e) => {
                self.rollback(&key, previous);
                Err(e)
            }
        }
    }

    /// Removed from memory immediately. A rejected delete is not rolled
    /// back; the cache keeps the row until the next refresh.
    pub async fn delete(&self, key: &str) -> Result<Delivery> {
        self.remove_state(key);
        let mutation = NewMutation::new(Method::Delete, T::item_path(key)).for_entity(T::TABLE, key);
        let table = T::TABLE;
        match self.attempt(mutation).await? {
            Attempt::Accepted(_) => {
                let key = key.to_string();
                self.writer
                    .spawn("delete", move |db| db.delete_row(table, &key).map(|_| ()));
                Ok(Delivery::Sent)
            }
            Attempt::Queued => {
                self.store.with(|db| db.delete_row(table, key))?;
                Ok(Delivery::Queued)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{RequestError, is_offline_error};
    use crate::models::{Habit, HabitEntry, Todo, WeightEntry};
    use crate::sync::{SyncEngine, SyncPolicy};
    use crate::testing::FakeApi;
    use chrono::NaiveDate;
    use serde_json::json;

    struct Fixture {
        store: Store,
        api: Arc<FakeApi>,
        writer: Arc<CacheWriter>,
    }

    impl Fixture {
        fn new(api: FakeApi) -> Self {
            let store = Store::open_in_memory().unwrap();
            let writer = Arc::new(CacheWriter::new(store.clone()));
            Self {
                store,
                api: Arc::new(api),
                writer,
            }
        }

        fn resource<T: Entity>(&self) -> Resource<T, FakeApi> {
            Resource::new(self.store.clone(), self.api.clone(), self.writer.clone())
        }

        fn queue(&self) -> Vec<crate::models::PendingMutation> {
            self.store.with(|db| db.get_queue()).unwrap()
        }
    }

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

    fn habit(name: &str) -> Habit {
        Habit {
            habit_id: String::new(),
            name: name.into(),
            color: None,
            frequency: None,
            archived: false,
        }
    }

    fn todo(id: &str, title: &str) -> Todo {
        Todo {
            todo_id: id.into(),
            title: title.into(),
            notes: None,
            completed: false,
            due_date: None,
            category: None,
        }
    }

    #[tokio::test]
    async fn test_offline_weight_log() {
        let fx = Fixture::new(FakeApi::offline());
        let weights = fx.resource::<WeightEntry>();

        let saved = weights.create(weight("2024-06-01", 72.5)).await.unwrap();
        assert_eq!(saved.delivery, Delivery::Queued);

        let rows = fx
            .store
            .with(|db| db.get_cached::<WeightEntry>(&CacheQuery::all()))
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert!(!rows[0].synced);
        let queue = fx.queue();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].method, Method::Post);
        assert_eq!(queue[0].endpoint, "/weight");
        assert_eq!(queue[0].entity_key.as_deref(), Some("2024-06-01"));
        assert!(queue[0].temp_id.is_none());
        assert_eq!(weights.items().len(), 1);
    }

    #[tokio::test]
    async fn test_offline_habit_gets_temp_id() {
        let fx = Fixture::new(FakeApi::offline());
        let habits = fx.resource::<Habit>();

        let saved = habits.create(habit("Read")).await.unwrap();
        assert!(is_temp_id(&saved.item.habit_id));

        let cached = fx
            .store
            .with(|db| db.get_one::<Habit>(&saved.item.habit_id))
            .unwrap()
            .unwrap();
        assert!(!cached.synced);
        let queue = fx.queue();
        assert_eq!(queue[0].temp_id.as_deref(), Some(saved.item.habit_id.as_str()));
        assert_eq!(queue[0].body, Some(json!({ "name": "Read", "archived": false })));
    }

    #[tokio::test]
    async fn test_online_create_reconciles() {
        let api = FakeApi::new();
        api.ok(json!({ "habit": { "habitId": "h_42", "name": "Read" } }));
        let fx = Fixture::new(api);
        let habits = fx.resource::<Habit>();

        let saved = habits.create(habit("Read")).await.unwrap();
        assert_eq!(saved.delivery, Delivery::Sent);
        assert_eq!(saved.item.habit_id, "h_42");
        fx.writer.flush().await;

        let rows = fx
            .store
            .with(|db| db.get_cached::<Habit>(&CacheQuery::all()))
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].item.habit_id, "h_42");
        assert!(rows[0].synced);
        assert!(fx.queue().is_empty());
        assert_eq!(habits.items(), rows);
    }

    #[tokio::test]
    async fn test_rejected_create_rolls_back() {
        let api = FakeApi::new();
        api.fail(422, "Weight must be between 20 and 500 kg");
        let fx = Fixture::new(api);
        let weights = fx.resource::<WeightEntry>();

        let err = weights.create(weight("2024-06-01", 900.0)).await.unwrap_err();
        assert_eq!(err.to_string(), "Weight must be between 20 and 500 kg");
        assert!(!is_offline_error(&err));
        assert!(weights.items().is_empty());
        assert!(fx.queue().is_empty());
        let rows = fx
            .store
            .with(|db| db.get_cached::<WeightEntry>(&CacheQuery::all()))
            .unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn test_rejected_update_restores_previous() {
        let api = FakeApi::new();
        api.fail(400, "Title is required");
        let fx = Fixture::new(api);
        fx.store
            .with(|db| db.upsert(&todo("t_1", "Buy milk"), true))
            .unwrap();
        let todos = fx.resource::<Todo>();
        todos.cached(&CacheQuery::all()).unwrap();

        let err = todos.update(todo("t_1", "")).await.unwrap_err();
        assert_eq!(err.to_string(), "Title is required");

        let row = fx
            .store
            .with(|db| db.get_one::<Todo>("t_1"))
            .unwrap()
            .unwrap();
        assert_eq!(row.item.title, "Buy milk");
        assert!(row.synced);
        assert_eq!(todos.items()[0].item.title, "Buy milk");
    }

    #[tokio::test]
    async fn test_offline_update_queues_patch() {
        let fx = Fixture::new(FakeApi::offline());
        fx.store
            .with(|db| db.upsert(&todo("t_1", "Buy milk"), true))
            .unwrap();
        let todos = fx.resource::<Todo>();

        let mut done = todo("t_1", "Buy milk");
        done.completed = true;
        let saved = todos.update(done).await.unwrap();
        assert_eq!(saved.delivery, Delivery::Queued);

        let queue = fx.queue();
        assert_eq!(queue[0].method, Method::Patch);
        assert_eq!(queue[0].endpoint, "/todos/t_1");
        let row = fx
            .store
            .with(|db| db.get_one::<Todo>("t_1"))
            .unwrap()
            .unwrap();
        assert!(row.item.completed);
        assert!(!row.synced);
    }

    #[tokio::test]
    async fn test_offline_delete_removes_and_queues() {
        let fx = Fixture::new(FakeApi::offline());
        fx.store
            .with(|db| db.upsert(&todo("t_1", "Buy milk"), true))
            .unwrap();
        let todos = fx.resource::<Todo>();
        todos.cached(&CacheQuery::all()).unwrap();

        assert_eq!(todos.delete("t_1").await.unwrap(), Delivery::Queued);
        assert!(todos.items().is_empty());
        assert!(fx.store.with(|db| db.get_one::<Todo>("t_1")).unwrap().is_none());
        assert_eq!(fx.queue()[0].method, Method::Delete);
    }

    #[tokio::test]
    async fn test_rejected_delete_not_rolled_back() {
        let api = FakeApi::new();
        api.fail(403, "Not allowed");
        let fx = Fixture::new(api);
        fx.store
            .with(|db| db.upsert(&todo("t_1", "Buy milk"), true))
            .unwrap();
        let todos = fx.resource::<Todo>();
        todos.cached(&CacheQuery::all()).unwrap();

        assert!(todos.delete("t_1").await.is_err());
        assert!(todos.items().is_empty());
        assert!(fx.store.with(|db| db.get_one::<Todo>("t_1")).unwrap().is_some());
        assert!(fx.queue().is_empty());
    }

    #[tokio::test]
    async fn test_write_waits_behind_queued_write_to_same_row() {
        let fx = Fixture::new(FakeApi::offline());
        let weights = fx.resource::<WeightEntry>();
        weights.create(weight("2024-06-01", 72.5)).await.unwrap();

        // Back online, but the POST for that date has not replayed yet
        fx.api.set_fallback(Ok(Value::Null));
        assert_eq!(weights.delete("2024-06-01").await.unwrap(), Delivery::Queued);
        assert_eq!(fx.api.calls().len(), 1);

        let queue = fx.queue();
        assert_eq!(queue.len(), 2);
        assert_eq!(queue[0].method, Method::Post);
        assert_eq!(queue[1].method, Method::Delete);

        // A different date is unaffected
        let saved = weights.create(weight("2024-06-02", 72.3)).await.unwrap();
        assert_eq!(saved.delivery, Delivery::Sent);
    }

    #[tokio::test]
    async fn test_fetch_merges_and_refreshes_cache() {
        let api = FakeApi::new();
        api.ok(json!({ "weightEntries": [
            { "date": "2024-03-01", "weight": 72.0 },
            { "date": "2024-03-02", "weight": 71.8 },
        ]}));
        let fx = Fixture::new(api);
        fx.store
            .with(|db| {
                db.upsert(&weight("2024-03-02", 71.5), false)?;
                db.upsert(&weight("2024-03-03", 71.0), true)
            })
            .unwrap();
        let weights = fx.resource::<WeightEntry>();

        let query = CacheQuery::between(date("2024-03-01"), date("2024-03-31"));
        let fetched = weights.fetch(&query).await.unwrap();
        assert_eq!(fetched.source, Source::Network);
        let got: Vec<(f64, bool)> = fetched
            .records
            .iter()
            .map(|c| (c.item.weight, c.synced))
            .collect();
        assert_eq!(got, [(72.0, true), (71.5, false)]);

        let calls = fx.api.calls();
        assert_eq!(calls[0].path, "/weight");
        assert_eq!(calls[0].query[0], ("from".to_string(), "2024-03-01".to_string()));

        fx.writer.flush().await;
        let rows = fx
            .store
            .with(|db| db.get_cached::<WeightEntry>(&CacheQuery::all()))
            .unwrap();
        assert_eq!(rows, fetched.records);
    }

    #[tokio::test]
    async fn test_fetch_offline_serves_cache() {
        let fx = Fixture::new(FakeApi::offline());
        fx.store
            .with(|db| db.upsert(&todo("t_1", "Buy milk"), true))
            .unwrap();
        let todos = fx.resource::<Todo>();

        let fetched = todos.fetch(&CacheQuery::all()).await.unwrap();
        assert_eq!(fetched.source, Source::Cache);
        assert_eq!(fetched.records.len(), 1);
        assert_eq!(todos.items().len(), 1);
    }

    #[tokio::test]
    async fn test_fetch_server_error_surfaces() {
        let api = FakeApi::new();
        api.reply(Err(RequestError::SessionExpired));
        let fx = Fixture::new(api);
        let todos = fx.resource::<Todo>();

        let err = todos.fetch(&CacheQuery::all()).await.unwrap_err();
        assert_eq!(
            err.downcast_ref::<RequestError>(),
            Some(&RequestError::SessionExpired)
        );
    }

    #[tokio::test]
    async fn test_offline_habit_and_entry_replayed() {
        let fx = Fixture::new(FakeApi::offline());
        let habits = fx.resource::<Habit>();
        let entries = fx.resource::<HabitEntry>();

        let temp = habits.create(habit("Read")).await.unwrap().item.habit_id;
        let entry = HabitEntry {
            habit_id: temp.clone(),
            date: date("2024-06-01"),
            completed: true,
            value: None,
        };
        assert_eq!(
            entries.create(entry).await.unwrap().delivery,
            Delivery::Queued
        );
        // Both writes were tried once at most; the entry never hit the network.
        assert_eq!(fx.api.calls().len(), 1);

        fx.api.set_fallback(Ok(Value::Null));
        fx.api
            .ok(json!({ "habit": { "habitId": "h_42", "name": "Read" } }))
            .ok(json!({ "habitEntry": { "habitId": "h_42", "date": "2024-06-01", "completed": true } }));
        let engine = SyncEngine::new(fx.store.clone(), fx.api.clone(), SyncPolicy::default()).unwrap();
        engine.drain().await.unwrap();

        assert_eq!(
            fx.api.paths()[1..],
            ["POST /habits", "POST /habits/h_42/entries"]
        );
        let cached_entries = fx
            .store
            .with(|db| db.get_cached::<HabitEntry>(&CacheQuery::all()))
            .unwrap();
        assert_eq!(cached_entries.len(), 1);
        assert_eq!(cached_entries[0].item.habit_id, "h_42");
        assert!(cached_entries[0].synced);
        assert_eq!(engine.pending_count().unwrap(), 0);
    }

    #[test]
    fn test_mentions_temp_id() {
        assert!(mentions_temp_id("/habits/temp_1700000000000_ab12cd34/entries"));
        assert!(!mentions_temp_id("/habits/h_42/entries"));
        assert!(!mentions_temp_id("/todos"));
    }
}
