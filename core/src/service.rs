use std::path::Path;
use std::sync::Arc;

use anyhow::Result;

use crate::api::Requester;
use crate::db::Store;
use crate::models::{
    CalendarEvent, Exercise, Friend, FriendRequest, Habit, HabitEntry, PendingMutation, Template,
    Todo, WeightEntry, WorkoutLog,
};
use crate::resource::Resource;
use crate::sync::{DrainOutcome, SyncEngine, SyncPolicy};
use crate::trigger::SyncTrigger;
use crate::writer::CacheWriter;

/// One signed-in session's data layer.
///
/// Owns the store handle, the sync engine and one [`Resource`] per entity
/// type. Hosts build one at sign-in with their own [`Requester`], call
/// [`StrideService::sign_out`] to wipe it, and [`StrideService::close`] on
/// shutdown.
pub struct StrideService<R> {
    store: Store,
    policy: SyncPolicy,
    writer: Arc<CacheWriter>,
    engine: Arc<SyncEngine<R>>,
    weights: Resource<WeightEntry, R>,
    habits: Resource<Habit, R>,
    habit_entries: Resource<HabitEntry, R>,
    todos: Resource<Todo, R>,
    events: Resource<CalendarEvent, R>,
    exercises: Resource<Exercise, R>,
    templates: Resource<Template, R>,
    workout_logs: Resource<WorkoutLog, R>,
    friends: Resource<Friend, R>,
    friend_requests: Resource<FriendRequest, R>,
}

impl<R: Requester> StrideService<R> {
    pub fn new(db_path: &Path, requester: R, policy: SyncPolicy) -> Result<Self> {
        Self::with_store(Store::open(db_path)?, requester, policy)
    }

    pub fn new_in_memory(requester: R) -> Result<Self> {
        Self::with_store(Store::open_in_memory()?, requester, SyncPolicy::default())
    }

    pub fn with_store(store: Store, requester: R, policy: SyncPolicy) -> Result<Self> {
        let requester = Arc::new(requester);
        let writer = Arc::new(CacheWriter::new(store.clone()));
        let engine = Arc::new(SyncEngine::new(store.clone(), requester.clone(), policy)?);
        macro_rules! resource {
            () => {
                Resource::new(store.clone(), requester.clone(), writer.clone())
            };
        }
        Ok(Self {
            weights: resource!(),
            habits: resource!(),
            habit_entries: resource!(),
            todos: resource!(),
            events: resource!(),
            exercises: resource!(),
            templates: resource!(),
            workout_logs: resource!(),
            friends: resource!(),
            friend_requests: resource!(),
            store,
            policy,
            writer,
            engine,
        })
    }

    // --- Resources ---

    pub fn weights(&self) -> &Resource<WeightEntry, R> {
        &self.weights
    }

    pub fn habits(&self) -> &Resource<Habit, R> {
        &self.habits
    }

    pub fn habit_entries(&self) -> &Resource<HabitEntry, R> {
        &self.habit_entries
    }

    pub fn todos(&self) -> &Resource<Todo, R> {
        &self.todos
    }

    pub fn events(&self) -> &Resource<CalendarEvent, R> {
        &self.events
    }

    pub fn exercises(&self) -> &Resource<Exercise, R> {
        &self.exercises
    }

    pub fn templates(&self) -> &Resource<Template, R> {
        &self.templates
    }

    pub fn workout_logs(&self) -> &Resource<WorkoutLog, R> {
        &self.workout_logs
    }

    pub fn friends(&self) -> &Resource<Friend, R> {
        &self.friends
    }

    pub fn friend_requests(&self) -> &Resource<FriendRequest, R> {
        &self.friend_requests
    }

    // --- Sync ---

    pub fn engine(&self) -> &Arc<SyncEngine<R>> {
        &self.engine
    }

    /// A trigger bound to this session's engine, for the host's signal loop.
    pub fn trigger(&self) -> SyncTrigger<R> {
        SyncTrigger::new(self.engine.clone())
    }

    /// Drain now. Background cache writes are flushed first so replay sees
    /// the latest local state.
    pub async fn sync(&self) -> Result<DrainOutcome> {
        self.writer.flush().await;
        self.engine.drain().await
    }

    pub fn pending_count(&self) -> Result<usize> {
        self.engine.pending_count()
    }

    /// Every queued entry, parked ones included, oldest first.
    pub fn queue(&self) -> Result<Vec<PendingMutation>> {
        self.store.with(|db| db.get_queue())
    }

    pub fn failed_mutations(&self) -> Result<Vec<PendingMutation>> {
        self.engine.failed_mutations()
    }

    pub fn clear_failed(&self) -> Result<usize> {
        self.engine.clear_failed()
    }

    pub fn requeue(&self, id: i64) -> Result<()> {
        self.engine.requeue(id)
    }

    pub fn last_sync_at(&self) -> Result<Option<String>> {
        self.engine.last_drain_at()
    }

    // --- Lifecycle ---

    pub fn prune(&self) -> Result<usize> {
        self.store.prune(self.policy.retention_days)
    }

    /// Wipe every cached row, the queue and sync metadata.
    pub async fn sign_out(&self) -> Result<()> {
        self.writer.flush().await;
        self.store.sign_out()?;
        self.weights.clear();
        self.habits.clear();
        self.habit_entries.clear();
        self.todos.clear();
        self.events.clear();
        self.exercises.clear();
        self.templates.clear();
        self.workout_logs.clear();
        self.friends.clear();
        self.friend_requests.clear();
        Ok(())
    }

    pub async fn close(self) -> Result<()> {
        self.writer.flush().await;
        self.store.close()
    }
}
