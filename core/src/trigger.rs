use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::api::Requester;
use crate::sync::{DrainOutcome, SyncEngine};

/// Host events that may warrant a drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncSignal {
    /// Network reachability as last observed.
    Connectivity(bool),
    Foreground,
    Background,
    /// The user asked for a sync.
    SyncNow,
}

/// Turns connectivity and lifecycle transitions into drains.
pub struct SyncTrigger<R> {
    engine: Arc<SyncEngine<R>>,
    online: Option<bool>,
}

impl<R: Requester> SyncTrigger<R> {
    pub fn new(engine: Arc<SyncEngine<R>>) -> Self {
        Self {
            engine,
            online: None,
        }
    }

    #[must_use]
    pub fn online(&self) -> Option<bool> {
        self.online
    }

    /// Record `signal` and decide whether it calls for a drain.
    ///
    /// Drains on: reachability becoming true after false or unknown,
    /// returning to the foreground while known online, and `SyncNow`.
    pub fn observe(&mut self, signal: SyncSignal) -> bool {
        match signal {
            SyncSignal::Connectivity(online) => {
                let was = self.online.replace(online);
                online && was != Some(true)
            }
            SyncSignal::Foreground => self.online == Some(true),
            SyncSignal::Background => false,
            SyncSignal::SyncNow => true,
        }
    }

    pub async fn handle(&mut self, signal: SyncSignal) -> Result<Option<DrainOutcome>> {
        if !self.observe(signal) {
            return Ok(None);
        }
        debug!(?signal, "Triggering drain");
        self.engine.drain().await.map(Some)
    }

    /// Consume signals until every sender is dropped.
    pub async fn run(mut self, mut signals: mpsc::Receiver<SyncSignal>) {
        while let Some(signal) = signals.recv().await {
            match self.handle(signal).await {
                Ok(Some(DrainOutcome::Completed(report))) if report.attempted > 0 => {
                    info!(
                        succeeded = report.succeeded,
                        failed = report.failed,
                        halted = report.halted,
                        "Sync finished"
                    );
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Sync failed"),
            }
        }
        debug!("Signal channel closed, trigger stopped");
    }
}
