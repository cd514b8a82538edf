pub mod config;
pub mod index;
pub mod repository;
pub mod resume;
pub mod runner;
pub mod throttle;
pub mod types;

pub use config::{BatchConfig, FailurePolicy, ResumeConfig, ThrottleConfig};
pub use index::{DocumentMatch, IndexErrorKind, SearchIndex};
pub use repository::{
    BatchSearchRepository, fs::FsBatchSearchRepository, memory::MemoryBatchSearchRepository,
};
pub use resume::ResumeController;
pub use runner::{BatchOutcome, BatchSearchRunner, QueueSignal};
pub use throttle::{BatchThrottle, RateLimiter, RateSpec, Throttle};
pub use types::{BatchSearch, BatchSearchResult, BatchState, QueryFailure, StateChange};
