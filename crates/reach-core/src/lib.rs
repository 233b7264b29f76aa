pub mod checkpoint;
pub mod error;
pub mod governor;
pub mod models;
pub mod orchestrator;
pub mod retry;
pub mod traits;

#[cfg(test)]
pub(crate) mod testutil;

pub use checkpoint::{CheckpointRecord, CheckpointStore, Progress};
pub use error::AppError;
pub use governor::{GovernorConfig, GovernorStats, MemoryReport, ResourceGovernor};
pub use models::{ContactInfo, Row, RowResult, RowStatus, RunResult, RunSummary, SOCIAL_PLATFORMS};
pub use orchestrator::{
    Orchestrator, OrchestratorConfig, RunEvent, RunReporter, TracingRunReporter,
};
pub use retry::{ErrorContext, ErrorSummary, ErrorTracker, RetryPolicy};
pub use traits::{Extractor, Session, SessionFactory};
