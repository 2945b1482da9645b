pub mod checkpoint;
pub mod chess;
pub mod config;
pub mod deferred;
pub mod error;
pub mod models;
pub mod range;
pub mod resource;
pub mod retry;
pub mod runner;
pub mod source;
pub mod throttle;
pub mod traits;

#[cfg(test)]
pub mod testutil;

pub use checkpoint::{CheckpointPolicy, CheckpointStore, FileCheckpointBackend, MemoryCheckpointBackend};
pub use config::EngineConfig;
pub use deferred::{DeferredEngine, TaskHandle, TaskState};
pub use error::AppError;
pub use models::{CheckpointSummary, Record, ResourceMeta, ResourceStats, WriteDisposition, compute_hash};
pub use resource::{ExtractContext, Resource};
pub use retry::{RetryPolicy, RetryingUpstream};
pub use runner::{PipelineRunner, RunEvent, RunReport, RunReporter, TracingRunReporter};
pub use source::Source;
pub use throttle::{ThrottleConfig, ThrottledUpstream};
pub use traits::{CheckpointBackend, NullSink, RecordSink, Upstream};
