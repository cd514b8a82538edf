use std::sync::Arc;

use datashare_common::{
    error::{DatashareError, Result},
    time::elapsed_since,
};
use tokio::{sync::watch, time::MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::{
    config::ResumeConfig,
    repository::BatchSearchRepository,
    types::{BatchSearch, StateChange},
};

/// Puts orphaned RUNNING batches back in the queue.
pub struct ResumeController {
    repository: Arc<dyn BatchSearchRepository>,
    config: ResumeConfig,
}

impl ResumeController {
    pub fn new(repository: Arc<dyn BatchSearchRepository>, config: ResumeConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { repository, config })
    }

    /// Must complete before this node's workers start: any claim carrying
    /// the node prefix belongs to a previous incarnation of the process.
    pub async fn resume_on_startup(&self) -> Result<Vec<String>> {
        let requeued = self
            .requeue_where(|batch| {
                batch
                    .worker
                    .as_deref()
                    .is_some_and(|worker| self.config.owns_worker(worker))
                    || self.is_orphaned(batch)
            })
            .await?;
        info!(
            node = %self.config.node_id,
            count = requeued.len(),
            "resumed batch searches on startup"
        );
        Ok(requeued)
    }

    /// Requeues unclaimed batches and claims whose heartbeat went stale.
    pub async fn sweep(&self) -> Result<Vec<String>> {
        let requeued = self.requeue_where(|batch| self.is_orphaned(batch)).await?;
        if !requeued.is_empty() {
            info!(count = requeued.len(), "requeued stale batch searches");
        }
        Ok(requeued)
    }

    pub async fn run_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.sweep().await {
                        warn!(error = %err, "batch search resume sweep failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    fn is_orphaned(&self, batch: &BatchSearch) -> bool {
        if batch.worker.is_none() {
            return true;
        }
        let last_seen = batch.heartbeat_at.as_ref().unwrap_or(&batch.updated_at);
        elapsed_since(last_seen) >= self.config.orphan_after
    }

    async fn requeue_where(&self, orphaned: impl Fn(&BatchSearch) -> bool) -> Result<Vec<String>> {
        let mut requeued = Vec::new();
        for batch in self.repository.get_running().await? {
            if !orphaned(&batch) {
                continue;
            }
            let change = StateChange::Requeue {
                worker: batch.worker.clone(),
            };
            match self.repository.set_state(&batch.id, change).await {
                Ok(_) => {
                    info!(
                        batch = %batch.id,
                        worker = batch.worker.as_deref().unwrap_or("-"),
                        run = batch.run,
                        "requeued orphaned batch search"
                    );
                    requeued.push(batch.id);
                }
                Err(DatashareError::InvalidTransition { .. } | DatashareError::NotFound(_)) => {
                    debug!(batch = %batch.id, "batch search changed before requeue, skipping");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(requeued)
    }
}
