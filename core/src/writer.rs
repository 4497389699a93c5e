use std::sync::{Mutex, PoisonError};

use anyhow::Result;
use tokio::task::JoinSet;
use tracing::warn;

use crate::db::{Database, Store};

/// Best-effort cache writes that run after the server already accepted a
/// change. A failure here never fails the user-facing operation; it is
/// logged and the next refresh repairs the cache.
pub struct CacheWriter {
    store: Store,
    tasks: Mutex<JoinSet<()>>,
}

impl CacheWriter {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    fn tasks(&self) -> std::sync::MutexGuard<'_, JoinSet<()>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `write` on the blocking pool. Must be called inside a tokio runtime.
    pub fn spawn<F>(&self, what: &'static str, write: F)
    where
        F: FnOnce(&Database) -> Result<()> + Send + 'static,
    {
        let store = self.store.clone();
        let mut tasks = self.tasks();
        while tasks.try_join_next().is_some() {}
        tasks.spawn_blocking(move || {
            if let Err(e) = store.with(write) {
                warn!(what, error = %e, "Background cache write failed");
            }
        });
    }

    /// Wait for every write spawned so far.
    pub async fn flush(&self) {
        let mut pending = std::mem::take(&mut *self.tasks());
        while let Some(joined) = pending.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "Background cache write panicked");
            }
        }
    }
}
