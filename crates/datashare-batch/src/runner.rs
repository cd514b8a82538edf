use std::{sync::Arc, time::Duration};

use datashare_common::error::{DatashareError, Result};
use futures::future::join_all;
use tokio::{
    sync::{Notify, watch},
    task::JoinHandle,
    time::{Instant, Interval, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

use crate::{
    config::BatchConfig,
    index::SearchIndex,
    repository::BatchSearchRepository,
    throttle::Throttle,
    types::{BatchSearch, QueryFailure, StateChange},
};

/// Wakes idle workers when a batch is submitted in this process.
#[derive(Debug, Clone, Default)]
pub struct QueueSignal(Arc<Notify>);

impl QueueSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify(&self) {
        self.0.notify_one();
    }

    pub async fn notified(&self) {
        self.0.notified().await;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    Succeeded {
        id: String,
        results: usize,
        failed_queries: usize,
    },
    Failed {
        id: String,
        cause: String,
    },
    /// The batch was deleted while running; no terminal state is written.
    Cancelled { id: String },
    /// The batch was requeued and claimed by another worker; this worker
    /// stopped without writing to the new run.
    ClaimLost { id: String },
    /// Execution stopped on a storage error. The batch stays RUNNING until
    /// the resume sweep re-queues it.
    Abandoned { id: String, error: String },
}

pub struct BatchSearchRunner {
    repository: Arc<dyn BatchSearchRepository>,
    index: Arc<dyn SearchIndex>,
    throttle: Throttle,
    config: BatchConfig,
    signal: QueueSignal,
}

impl BatchSearchRunner {
    pub fn new(
        repository: Arc<dyn BatchSearchRepository>,
        index: Arc<dyn SearchIndex>,
        config: BatchConfig,
        signal: QueueSignal,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            repository,
            index,
            throttle: Throttle::new(&config.throttle),
            config,
            signal,
        })
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    pub fn spawn_workers(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        (0..self.config.workers)
            .map(|index| {
                let runner = Arc::clone(self);
                let shutdown = shutdown.clone();
                let worker = self.config.worker_id(index);
                tokio::spawn(async move { runner.run_worker(worker, shutdown).await })
            })
            .collect()
    }

    /// Runs every worker until `shutdown` flips to `true`. Workers finish the
    /// batch they are executing before returning.
    pub async fn run_until_shutdown(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        for joined in join_all(self.spawn_workers(shutdown)).await {
            if let Err(err) = joined {
                error!(error = %err, "batch search worker task failed");
            }
        }
    }

    pub async fn run_worker(&self, worker: String, mut shutdown: watch::Receiver<bool>) {
        info!(worker = %worker, "batch search worker started");
        let mut idle = self.config.poll_interval;

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.run_once(&worker).await {
                Ok(Some(_)) => {
                    idle = self.config.poll_interval;
                    continue;
                }
                Ok(None) => debug!(worker = %worker, "batch search queue is empty"),
                Err(err) if err.is_transient() => {
                    warn!(worker = %worker, error = %err, "batch search poll failed, retrying next cycle")
                }
                Err(err) => error!(worker = %worker, error = %err, "batch search poll failed"),
            }

            tokio::select! {
                _ = tokio::time::sleep(idle) => {}
                _ = self.signal.notified() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            idle = idle.saturating_mul(2).min(self.config.max_poll_interval);
        }

        info!(worker = %worker, "batch search worker stopped");
    }

    /// Claims the oldest queued batch that no other worker wins and executes it.
    pub async fn run_once(&self, worker: &str) -> Result<Option<BatchOutcome>> {
        let queued = self.repository.get_queued().await?;
        for candidate in queued {
            let claim = StateChange::Claim {
                worker: worker.to_string(),
            };
            match self.repository.set_state(&candidate.id, claim).await {
                Ok(claimed) => {
                    info!(
                        batch = %claimed.id,
                        worker = %worker,
                        run = claimed.run,
                        queries = claimed.queries.len(),
                        "claimed batch search"
                    );
                    return Ok(Some(self.execute(&claimed, worker).await));
                }
                Err(DatashareError::InvalidTransition { .. } | DatashareError::NotFound(_)) => {
                    debug!(batch = %candidate.id, worker = %worker, "batch search claimed elsewhere");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(None)
    }

    /// Executes a batch this worker has claimed. Every write carries
    /// `worker`, so execution stops as soon as the claim moves elsewhere.
    pub async fn execute(&self, batch: &BatchSearch, worker: &str) -> BatchOutcome {
        let deadline = Instant::now() + self.config.max_batch_duration;
        let throttle = self.throttle.for_batch();
        let mut heartbeat = tokio::time::interval_at(
            Instant::now() + self.config.heartbeat_interval,
            self.config.heartbeat_interval,
        );
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut results = 0_usize;
        let mut failed_queries = 0_usize;

        for (query_index, query) in batch.queries.iter().enumerate() {
            match self.repository.exists(&batch.id).await {
                Ok(true) => {}
                Ok(false) => return self.cancelled(batch),
                Err(err) => return self.abandoned(batch, err),
            }

            let Some(remaining) = remaining_until(deadline) else {
                return self.timed_out(batch, worker).await;
            };
            let bounded = tokio::time::timeout(remaining, async {
                throttle.acquire().await;
                self.index.search(&batch.project, query).await
            });
            let searched = match self.keep_alive(batch, worker, &mut heartbeat, bounded).await {
                Ok(searched) => searched,
                Err(err) => return self.interrupted(batch, worker, err),
            };
            let matches = match searched {
                Err(_) => return self.timed_out(batch, worker).await,
                Ok(Ok(matches)) => matches,
                Ok(Err(err)) => {
                    failed_queries += 1;
                    if self.config.failure_policy.is_fatal(&err, failed_queries) {
                        return self.fail(batch, worker, err.to_string()).await;
                    }
                    warn!(
                        batch = %batch.id,
                        query_index,
                        query = %query,
                        error = %err,
                        "batch search query failed, continuing"
                    );
                    let failure = QueryFailure {
                        query_index,
                        query: query.clone(),
                        cause: err.to_string(),
                    };
                    if let Err(err) = self
                        .repository
                        .record_query_failure(&batch.id, worker, failure)
                        .await
                    {
                        return self.interrupted(batch, worker, err);
                    }
                    continue;
                }
            };

            match self
                .repository
                .append_results(&batch.id, worker, query_index, query, matches)
                .await
            {
                Ok(count) => results += count,
                Err(err) => return self.interrupted(batch, worker, err),
            }
        }

        let change = StateChange::Succeed {
            worker: worker.to_string(),
        };
        match self.repository.set_state(&batch.id, change).await {
            Ok(_) => {
                info!(
                    batch = %batch.id,
                    results,
                    failed_queries,
                    "batch search succeeded"
                );
                BatchOutcome::Succeeded {
                    id: batch.id.clone(),
                    results,
                    failed_queries,
                }
            }
            Err(err) => self.interrupted(batch, worker, err),
        }
    }

    /// Drives `work` to completion while refreshing the claim heartbeat on
    /// every `heartbeat` tick. A failed heartbeat drops `work`.
    async fn keep_alive<F: Future>(
        &self,
        batch: &BatchSearch,
        worker: &str,
        heartbeat: &mut Interval,
        work: F,
    ) -> Result<F::Output> {
        tokio::pin!(work);
        loop {
            tokio::select! {
                output = &mut work => return Ok(output),
                _ = heartbeat.tick() => {
                    self.repository.heartbeat(&batch.id, worker).await?;
                    debug!(batch = %batch.id, worker = %worker, "batch search heartbeat");
                }
            }
        }
    }

    async fn timed_out(&self, batch: &BatchSearch, worker: &str) -> BatchOutcome {
        let cause = format!(
            "batch search timed out after {}",
            format_duration(self.config.max_batch_duration)
        );
        self.fail(batch, worker, cause).await
    }

    async fn fail(&self, batch: &BatchSearch, worker: &str, cause: String) -> BatchOutcome {
        let change = StateChange::Fail {
            worker: worker.to_string(),
            cause: cause.clone(),
        };
        match self.repository.set_state(&batch.id, change).await {
            Ok(_) => {
                warn!(batch = %batch.id, cause = %cause, "batch search failed");
                BatchOutcome::Failed {
                    id: batch.id.clone(),
                    cause,
                }
            }
            Err(err) => self.interrupted(batch, worker, err),
        }
    }

    fn interrupted(&self, batch: &BatchSearch, worker: &str, err: DatashareError) -> BatchOutcome {
        match err {
            DatashareError::NotFound(_) => self.cancelled(batch),
            DatashareError::InvalidTransition { .. } => {
                warn!(
                    batch = %batch.id,
                    worker = %worker,
                    "batch search claimed by another worker, stopping"
                );
                BatchOutcome::ClaimLost {
                    id: batch.id.clone(),
                }
            }
            err => self.abandoned(batch, err),
        }
    }

    fn cancelled(&self, batch: &BatchSearch) -> BatchOutcome {
        info!(batch = %batch.id, "batch search deleted while running, stopping");
        BatchOutcome::Cancelled {
            id: batch.id.clone(),
        }
    }

    fn abandoned(&self, batch: &BatchSearch, err: DatashareError) -> BatchOutcome {
        error!(
            batch = %batch.id,
            error = %err,
            "batch search execution interrupted, leaving it to recovery"
        );
        BatchOutcome::Abandoned {
            id: batch.id.clone(),
            error: err.to_string(),
        }
    }
}

fn remaining_until(deadline: Instant) -> Option<Duration> {
    Some(deadline.saturating_duration_since(Instant::now())).filter(|left| !left.is_zero())
}

fn format_duration(duration: Duration) -> String {
    if duration.subsec_millis() == 0 {
        format!("{}s", duration.as_secs())
    } else {
        format!("{}ms", duration.as_millis())
    }
}
