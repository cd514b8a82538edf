use std::{path::PathBuf, time::Duration};

use clap::{Parser, ValueEnum};
use datashare_batch::{
    BatchConfig, FailurePolicy, RateSpec, ResumeConfig, ThrottleConfig, config::default_node_id,
};
use datashare_common::error::Result;
use datashare_index::IndexConfig;
use datashare_web::{AuthMode, WebConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum AuthArg {
    Local,
    Basic,
}

#[derive(Debug, Parser)]
#[command(name = "datashare", about = "Datashare batch search server")]
pub struct Cli {
    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,

    #[arg(long, default_value = "8080")]
    pub port: u16,

    #[arg(long, default_value = "./data")]
    pub data_dir: PathBuf,

    #[arg(
        long,
        env = "DATASHARE_ELASTICSEARCH_ADDRESS",
        default_value = datashare_index::DEFAULT_ADDRESS
    )]
    pub elasticsearch_address: String,

    /// Hits kept per query.
    #[arg(long, default_value_t = datashare_index::DEFAULT_PAGE_SIZE)]
    pub index_page_size: usize,

    #[arg(long, default_value = "local")]
    pub default_user: String,

    #[arg(long)]
    pub default_project: Option<String>,

    /// `*` or an origin allowed to call the API from a browser.
    #[arg(long)]
    pub cors: Option<String>,

    #[arg(long, value_enum, default_value = "local")]
    pub auth: AuthArg,

    /// JSON array of user records seeded into the session store.
    #[arg(long, env = "DATASHARE_USERS_FILE")]
    pub users_file: Option<PathBuf>,

    #[arg(long, default_value_t = 1)]
    pub session_ttl_seconds: u64,

    #[arg(long, default_value_t = 1)]
    pub batch_workers: usize,

    #[arg(long, default_value_t = 1000)]
    pub batch_poll_interval_ms: u64,

    #[arg(long, default_value_t = 30_000)]
    pub batch_max_poll_interval_ms: u64,

    /// Minimum delay between two queries of one batch, 0 disables it.
    #[arg(long, default_value_t = 0)]
    pub batch_throttle_ms: u64,

    /// Queries per second across all workers of this process.
    #[arg(long)]
    pub global_query_rate: Option<u32>,

    #[arg(long, default_value_t = 100_000)]
    pub batch_search_max_time_seconds: u64,

    #[arg(long, default_value_t = 10)]
    pub heartbeat_interval_seconds: u64,

    #[arg(long, default_value_t = 300)]
    pub orphan_after_seconds: u64,

    #[arg(long, default_value_t = 60)]
    pub resume_sweep_interval_seconds: u64,

    /// Prefix of this process's worker ids. Set a stable id to resume this
    /// node's batches right after a restart; the generated default is unique
    /// per process.
    #[arg(long, env = "DATASHARE_NODE_ID", default_value = default_node_id())]
    pub node_id: String,

    /// Abort a batch on its first rejected query.
    #[arg(long, default_value_t = false)]
    pub fatal_query_errors: bool,

    #[arg(long)]
    pub max_query_failures: Option<usize>,

    #[arg(long, default_value_t = false)]
    pub log_json: bool,
}

impl Cli {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn batch_config(&self) -> BatchConfig {
        let failure_policy = if self.fatal_query_errors {
            FailurePolicy::all_fatal()
        } else {
            FailurePolicy::default()
        };
        BatchConfig {
            node_id: self.node_id.clone(),
            workers: self.batch_workers,
            poll_interval: Duration::from_millis(self.batch_poll_interval_ms),
            max_poll_interval: Duration::from_millis(self.batch_max_poll_interval_ms),
            max_batch_duration: Duration::from_secs(self.batch_search_max_time_seconds),
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_seconds),
            throttle: ThrottleConfig {
                per_batch: (self.batch_throttle_ms > 0)
                    .then(|| RateSpec::spacing(Duration::from_millis(self.batch_throttle_ms))),
                global: self
                    .global_query_rate
                    .map(|rate| RateSpec::new(rate, Duration::from_secs(1))),
            },
            failure_policy: FailurePolicy {
                max_query_failures: self.max_query_failures,
                ..failure_policy
            },
        }
    }

    pub fn resume_config(&self) -> ResumeConfig {
        ResumeConfig {
            node_id: self.node_id.clone(),
            orphan_after: Duration::from_secs(self.orphan_after_seconds),
            sweep_interval: Duration::from_secs(self.resume_sweep_interval_seconds),
        }
    }

    pub fn index_config(&self) -> IndexConfig {
        IndexConfig {
            address: self.elasticsearch_address.clone(),
            page_size: self.index_page_size,
            ..IndexConfig::default()
        }
    }

    pub fn web_config(&self) -> WebConfig {
        WebConfig {
            auth: match self.auth {
                AuthArg::Local => AuthMode::Local,
                AuthArg::Basic => AuthMode::Basic,
            },
            default_user: self.default_user.clone(),
            default_project: self.default_project.clone(),
            cors_allow_origin: self.cors.clone(),
        }
    }

    /// Checks the batch and resume settings together.
    pub fn validate(&self) -> Result<()> {
        let batch = self.batch_config();
        batch.validate()?;
        let resume = self.resume_config();
        resume.validate()?;
        resume.ensure_outlives_heartbeat(batch.heartbeat_interval)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_seconds)
    }
}
