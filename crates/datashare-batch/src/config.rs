use std::{sync::OnceLock, time::Duration};

use datashare_common::error::{DatashareError, Result};
use uuid::Uuid;

use crate::{index::IndexErrorKind, throttle::RateSpec};

pub const DEFAULT_WORKERS: usize = 1;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_POLL_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_BATCH_DURATION: Duration = Duration::from_secs(100_000);
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_ORPHAN_AFTER: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Node id of this process when none is configured. Claims are tagged with
/// it, so two processes sharing storage must never default to the same id.
pub fn default_node_id() -> &'static str {
    static NODE_ID: OnceLock<String> = OnceLock::new();
    NODE_ID.get_or_init(generate_node_id)
}

/// `<host>-<random suffix>`, the host part read from `HOSTNAME` when set.
pub fn generate_node_id() -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .filter(|host| !host.is_empty() && !host.contains('/'))
        .unwrap_or_else(|| "datashare".to_string());
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{host}-{}", &suffix[..8])
}

/// Decides which query errors abort the whole batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailurePolicy {
    pub fatal: Vec<IndexErrorKind>,
    /// Recoverable failures tolerated per run before the batch is aborted.
    pub max_query_failures: Option<usize>,
}

impl Default for FailurePolicy {
    fn default() -> Self {
        Self {
            fatal: vec![IndexErrorKind::Unavailable],
            max_query_failures: None,
        }
    }
}

impl FailurePolicy {
    pub fn all_fatal() -> Self {
        Self {
            fatal: vec![IndexErrorKind::Unavailable, IndexErrorKind::Query],
            max_query_failures: None,
        }
    }

    /// `failures` counts the failures of the current run, this one included.
    pub fn is_fatal(&self, error: &DatashareError, failures: usize) -> bool {
        self.fatal.contains(&IndexErrorKind::of(error))
            || self.max_query_failures.is_some_and(|max| failures > max)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThrottleConfig {
    pub per_batch: Option<RateSpec>,
    pub global: Option<RateSpec>,
}

impl ThrottleConfig {
    pub fn validate(&self) -> Result<()> {
        for spec in self.per_batch.iter().chain(self.global.iter()) {
            spec.validate()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub node_id: String,
    pub workers: usize,
    pub poll_interval: Duration,
    pub max_poll_interval: Duration,
    pub max_batch_duration: Duration,
    pub heartbeat_interval: Duration,
    pub throttle: ThrottleConfig,
    pub failure_policy: FailurePolicy,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id().to_string(),
            workers: DEFAULT_WORKERS,
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_poll_interval: DEFAULT_MAX_POLL_INTERVAL,
            max_batch_duration: DEFAULT_MAX_BATCH_DURATION,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            throttle: ThrottleConfig::default(),
            failure_policy: FailurePolicy::default(),
        }
    }
}

impl BatchConfig {
    pub fn validate(&self) -> Result<()> {
        validate_node_id(&self.node_id)?;
        if self.workers == 0 {
            return Err(DatashareError::InvalidArgument(
                "batch search workers must be at least 1".to_string(),
            ));
        }
        if self.poll_interval.is_zero() || self.max_poll_interval < self.poll_interval {
            return Err(DatashareError::InvalidArgument(
                "batch search poll interval must be positive and not exceed the max poll interval"
                    .to_string(),
            ));
        }
        if self.max_batch_duration.is_zero() {
            return Err(DatashareError::InvalidArgument(
                "batch search max duration must be positive".to_string(),
            ));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(DatashareError::InvalidArgument(
                "batch search heartbeat interval must be positive".to_string(),
            ));
        }
        self.throttle.validate()
    }

    pub fn worker_id(&self, index: usize) -> String {
        format!("{}/worker-{index}", self.node_id)
    }
}

#[derive(Debug, Clone)]
pub struct ResumeConfig {
    pub node_id: String,
    pub orphan_after: Duration,
    pub sweep_interval: Duration,
}

impl Default for ResumeConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id().to_string(),
            orphan_after: DEFAULT_ORPHAN_AFTER,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

impl ResumeConfig {
    pub fn validate(&self) -> Result<()> {
        validate_node_id(&self.node_id)?;
        if self.orphan_after.is_zero() || self.sweep_interval.is_zero() {
            return Err(DatashareError::InvalidArgument(
                "resume orphan threshold and sweep interval must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// A live worker refreshes its heartbeat every `heartbeat_interval`; a
    /// threshold at or below it would requeue batches that are still running.
    pub fn ensure_outlives_heartbeat(&self, heartbeat_interval: Duration) -> Result<()> {
        if self.orphan_after <= heartbeat_interval {
            return Err(DatashareError::InvalidArgument(format!(
                "orphan threshold ({}ms) must exceed the heartbeat interval ({}ms)",
                self.orphan_after.as_millis(),
                heartbeat_interval.as_millis()
            )));
        }
        Ok(())
    }

    /// Worker ids of this node share the `<node_id>/` prefix.
    pub fn owns_worker(&self, worker: &str) -> bool {
        worker
            .strip_prefix(self.node_id.as_str())
            .is_some_and(|rest| rest.starts_with('/'))
    }
}

fn validate_node_id(node_id: &str) -> Result<()> {
    if node_id.is_empty() || node_id.contains('/') {
        return Err(DatashareError::InvalidArgument(
            "node id must be non-empty and must not contain '/'".to_string(),
        ));
    }
    Ok(())
}
