pub mod cache;
pub mod engine;
pub mod error;
pub mod events;
pub mod job;
pub mod jobs;
pub mod loader;
pub mod logging;
pub mod metrics;
pub mod pipeline;
pub mod replay;
pub mod search;
pub mod store;
pub mod wallclock;

pub use cache::{CacheStats, CandleCache, DEFAULT_CACHE_BYTES};
pub use engine::{BacktestEngine, BacktestReport, BacktestSpec, CandleSet, ExecutionConfig, StepOutcome};
pub use error::{ErrorCode, JobError};
pub use events::JobEvent;
pub use job::{
    JobConfig, JobFailure, JobKind, JobOutput, JobPhase, JobProgress, JobRecord, JobStatus, JobSummary,
    RunId, StatusResponse,
};
pub use jobs::{Orchestrator, OrchestratorConfig, RecoveryReport};
pub use loader::{CandleSource, FileCandleSource, LoadError, LoadReport, MemoryCandleSource, Timeframe};
pub use pipeline::{Evaluation, StepBudget};
pub use search::{GridSearchReport, Objective, ParameterGrid, WalkForwardConfig, WalkForwardReport};
pub use store::{open_store, JobStore, MemoryJobStore, SqliteJobStore, StoreError};
pub use wallclock::{ManualTimeSource, SystemTimeSource, TimeSource};
