use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::api::{ApiRequest, Requester, entity_field};
use crate::db::{Database, Store};
use crate::models::{Method, PendingMutation};

pub const LAST_DRAIN_META_KEY: &str = "last_drain_at";

/// Tunables for replay and retention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncPolicy {
    /// Entries whose retry count exceeds this are parked: kept in the queue
    /// and skipped by every drain until the user requeues or purges them.
    pub max_retries: u32,
    /// Confirmed history rows older than this many days are pruned.
    pub retention_days: i64,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retention_days: 90,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub attempted: usize,
    pub succeeded: usize,
    /// DELETEs the server no longer knew about.
    pub discarded: usize,
    pub failed: usize,
    /// Parked entries left untouched.
    pub skipped: usize,
    /// The session expired mid-drain; later entries were not attempted.
    pub halted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DrainOutcome {
    /// Another drain held the guard; nothing was done.
    AlreadyRunning,
    Completed(DrainReport),
}

type PendingObserver = Arc<dyn Fn(usize) + Send + Sync>;

struct DrainGuard<'a>(&'a AtomicBool);

impl<'a> DrainGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Replays the mutation queue against the server in FIFO order.
pub struct SyncEngine<R> {
    store: Store,
    requester: Arc<R>,
    policy: SyncPolicy,
    draining: AtomicBool,
    observer: Mutex<Option<PendingObserver>>,
}

impl<R: Requester> SyncEngine<R> {
    /// Entries left `in_flight` by a previous process are reset to `pending`.
    pub fn new(store: Store, requester: Arc<R>, policy: SyncPolicy) -> Result<Self> {
        let recovered = store.with(Database::recover_in_flight)?;
        if recovered > 0 {
            warn!(recovered, "Reset mutations left in flight by an interrupted drain");
        }
        Ok(Self {
            store,
            requester,
            policy,
            draining: AtomicBool::new(false),
            observer: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn policy(&self) -> SyncPolicy {
        self.policy
    }

    #[must_use]
    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// Register a callback that receives the pending count whenever the
    /// queue changes during a drain.
    pub fn set_observer(&self, observer: impl Fn(usize) + Send + Sync + 'static) {
        *self.observer.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(observer));
    }

    fn notify(&self) {
        let observer = self
            .observer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(observer) = observer else {
            return;
        };
        match self.store.with(Database::get_pending_count) {
            Ok(count) => observer(count),
            Err(e) => warn!(error = %e, "Failed to count pending mutations"),
        }
    }

    pub fn pending_count(&self) -> Result<usize> {
        self.store.with(Database::get_pending_count)
    }

    pub fn failed_mutations(&self) -> Result<Vec<PendingMutation>> {
        self.store
            .with(|db| db.get_failed_mutations(self.policy.max_retries))
    }

    pub fn clear_failed(&self) -> Result<usize> {
        let removed = self
            .store
            .with(|db| db.clear_failed(self.policy.max_retries))?;
        self.notify();
        Ok(removed)
    }

    pub fn requeue(&self, id: i64) -> Result<()> {
        self.store.with(|db| db.requeue(id))?;
        self.notify();
        Ok(())
    }

    pub fn last_drain_at(&self) -> Result<Option<String>> {
        self.store.with(|db| db.get_meta(LAST_DRAIN_META_KEY))
    }

    /// Replay every eligible queued mutation once, oldest first.
    ///
    /// Returns [`DrainOutcome::AlreadyRunning`] without touching the queue if
    /// another drain is in progress. A 401 stops the drain after marking the
    /// current entry failed; any other failure marks the entry and moves on.
    pub async fn drain(&self) -> Result<DrainOutcome> {
        let Some(_guard) = DrainGuard::acquire(&self.draining) else {
            debug!("Drain already running");
            return Ok(DrainOutcome::AlreadyRunning);
        };

        // Only a drain marks entries in flight, and we hold the guard.
        self.store.with(Database::recover_in_flight)?;

        let queue = self.store.with(Database::get_queue)?;
        if queue.is_empty() {
            self.finish()?;
            return Ok(DrainOutcome::Completed(DrainReport::default()));
        }
        info!(queued = queue.len(), "Draining mutation queue");

        let mut report = DrainReport::default();
        for id in queue.iter().map(|m| m.id) {
            // Reload: reconciling an earlier entry may have rewritten this one.
            let Some(mutation) = self.store.with(|db| db.find_mutation(id))? else {
                continue;
            };
            if mutation.retries > self.policy.max_retries {
                report.skipped += 1;
                continue;
            }
            report.attempted += 1;
            self.store.with(|db| db.mark_in_flight(mutation.id))?;

            let mut request = ApiRequest::new(mutation.method, mutation.endpoint.clone());
            request.body.clone_from(&mutation.body);

            match self.requester.request(request).await {
                Ok(response) => {
                    if let Err(e) = self.apply_success(&mutation, &response) {
                        warn!(
                            id = mutation.id,
                            endpoint = %mutation.endpoint,
                            error = %e,
                            "Server accepted mutation but the cache could not be updated"
                        );
                    }
                    self.store.with(|db| db.dequeue(mutation.id))?;
                    report.succeeded += 1;
                }
                Err(err) if err.is_session_expired() => {
                    self.store.with(|db| db.mark_failed(mutation.id))?;
                    report.failed += 1;
                    report.halted = true;
                    warn!(id = mutation.id, "Session expired, stopping drain");
                    break;
                }
                // Deleted server-side: the delete is already applied and an
                // update has nothing left to change.
                Err(err)
                    if err.is_not_found()
                        && matches!(mutation.method, Method::Delete | Method::Patch) =>
                {
                    if let Err(e) = self.drop_target(&mutation) {
                        warn!(id = mutation.id, error = %e, "Failed to drop deleted row from cache");
                    }
                    self.store.with(|db| db.dequeue(mutation.id))?;
                    report.discarded += 1;
                    debug!(id = mutation.id, endpoint = %mutation.endpoint, "Target already gone");
                }
                Err(err) => {
                    self.store.with(|db| db.mark_failed(mutation.id))?;
                    report.failed += 1;
                    let retries = mutation.retries + 1;
                    if retries > self.policy.max_retries {
                        warn!(
                            id = mutation.id,
                            endpoint = %mutation.endpoint,
                            retries,
                            error = %err,
                            "Mutation exceeded retry ceiling and is parked"
                        );
                    } else {
                        warn!(
                            id = mutation.id,
                            endpoint = %mutation.endpoint,
                            retries,
                            error = %err,
                            "Mutation replay failed"
                        );
                    }
                }
            }
            self.notify();
        }

        self.finish()?;
        info!(
            succeeded = report.succeeded,
            failed = report.failed,
            discarded = report.discarded,
            skipped = report.skipped,
            "Drain complete"
        );
        Ok(DrainOutcome::Completed(report))
    }

    fn finish(&self) -> Result<()> {
        self.store
            .with(|db| db.set_meta(LAST_DRAIN_META_KEY, &Utc::now().to_rfc3339()))?;
        self.notify();
        Ok(())
    }

    fn drop_target(&self, mutation: &PendingMutation) -> Result<()> {
        if let (Some(table), Some(key)) = (mutation.entity_table, &mutation.entity_key) {
            self.store.with(|db| db.delete_row(table, key))?;
        }
        Ok(())
    }

    fn apply_success(&self, mutation: &PendingMutation, response: &Value) -> Result<()> {
        let Some(table) = mutation.entity_table else {
            return Ok(());
        };
        if mutation.method == Method::Delete {
            // The row is normally gone already; it comes back when a queued
            // creation was reconciled after the delete was queued.
            return self.drop_target(mutation);
        }
        let server = entity_field(response, table.response_field());

        self.store.with(|db| {
            match (&mutation.temp_id, server) {
                (Some(temp_id), Some(server)) => match db.reconcile_temp_id(table, temp_id, server) {
                    Ok(real_id) => debug!(%table, %temp_id, %real_id, "Reconciled temporary id"),
                    Err(e) => {
                        // Keep the row but stop treating it as local-only so
                        // the next refresh replaces it.
                        warn!(%table, %temp_id, error = %e, "Could not reconcile temporary id");
                        db.confirm_row(table, temp_id, None)?;
                    }
                },
                // No entity in the response: confirm what we have and let the
                // next refresh replace it with the server's copy.
                (Some(temp_id), None) => db.confirm_row(table, temp_id, None)?,
                (None, server) => {
                    if let Some(key) = &mutation.entity_key {
                        db.confirm_row(table, key, server)?;
                    }
                }
            }
            Ok(())
        })
    }
}
