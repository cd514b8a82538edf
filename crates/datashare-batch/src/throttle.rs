use std::{sync::Arc, time::Duration};

use datashare_common::error::{DatashareError, Result};
use tokio::{sync::Mutex, time::Instant};

use crate::config::ThrottleConfig;

/// `queries` per `interval`, with bursts of up to `queries`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateSpec {
    pub queries: u32,
    pub interval: Duration,
}

impl RateSpec {
    pub fn new(queries: u32, interval: Duration) -> Self {
        Self { queries, interval }
    }

    /// One query per `interval`.
    pub fn spacing(interval: Duration) -> Self {
        Self::new(1, interval)
    }

    pub fn validate(&self) -> Result<()> {
        if self.queries == 0 || self.interval.is_zero() {
            return Err(DatashareError::InvalidArgument(
                "throttle rate must allow at least one query per non-zero interval".to_string(),
            ));
        }
        Ok(())
    }

    fn emission_interval(&self) -> Duration {
        self.interval / self.queries
    }
}

/// Generic cell rate limiter: `acquire` waits until the theoretical arrival
/// time of the next query falls within the burst window.
#[derive(Debug)]
pub struct RateLimiter {
    spec: RateSpec,
    theoretical_arrival: Mutex<Instant>,
}

impl RateLimiter {
    pub fn new(spec: RateSpec) -> Self {
        Self {
            spec,
            theoretical_arrival: Mutex::new(Instant::now()),
        }
    }

    pub fn spec(&self) -> RateSpec {
        self.spec
    }

    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut arrival = self.theoretical_arrival.lock().await;
                let now = Instant::now();
                let ready_at = (*arrival).max(now) + self.spec.emission_interval();
                let wait = ready_at.saturating_duration_since(now + self.spec.interval);
                if wait.is_zero() {
                    *arrival = ready_at;
                    return;
                }
                wait
            };
            tokio::time::sleep(wait).await;
        }
    }
}

/// Bounds query issue rate. Each batch execution gets its own per-batch
/// limiter; the global limiter is shared by every worker of the process.
#[derive(Debug, Clone, Default)]
pub struct Throttle {
    per_batch: Option<RateSpec>,
    global: Option<Arc<RateLimiter>>,
}

impl Throttle {
    pub fn new(config: &ThrottleConfig) -> Self {
        Self {
            per_batch: config.per_batch,
            global: config.global.map(|spec| Arc::new(RateLimiter::new(spec))),
        }
    }

    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn for_batch(&self) -> BatchThrottle {
        BatchThrottle {
            local: self.per_batch.map(RateLimiter::new),
            global: self.global.clone(),
        }
    }
}

#[derive(Debug)]
pub struct BatchThrottle {
    local: Option<RateLimiter>,
    global: Option<Arc<RateLimiter>>,
}

impl BatchThrottle {
    pub async fn acquire(&self) {
        if let Some(local) = &self.local {
            local.acquire().await;
        }
        if let Some(global) = &self.global {
            global.acquire().await;
        }
    }
}
