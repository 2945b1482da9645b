use std::collections::HashSet;
use std::future::Future;

use crate::error::AppError;
use crate::models::{CheckpointSummary, Record, ResourceMeta};

/// Performs one GET round trip against the upstream API and decodes the JSON body.
///
/// Implementations make a single attempt; retrying is layered on top by
/// [`RetryingUpstream`](crate::retry::RetryingUpstream).
pub trait Upstream: Send + Sync + Clone + 'static {
    fn fetch(
        &self,
        url: &str,
    ) -> impl Future<Output = Result<serde_json::Value, AppError>> + Send;
}

/// Durable storage for checkpoint sets, keyed by `(pipeline, resource)`.
pub trait CheckpointBackend: Send + Sync + Clone {
    /// Load every unit id recorded for the scope.
    fn load(
        &self,
        pipeline: &str,
        resource: &str,
    ) -> impl Future<Output = Result<HashSet<String>, AppError>> + Send;

    /// Persist `ids` into the scope in a single atomic write.
    ///
    /// Ids already present are ignored.
    fn save(
        &self,
        pipeline: &str,
        resource: &str,
        ids: &[String],
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Drop the whole scope. Returns the number of removed entries.
    fn reset(
        &self,
        pipeline: &str,
        resource: &str,
    ) -> impl Future<Output = Result<u64, AppError>> + Send;

    /// List the scopes recorded for a pipeline.
    fn scopes(
        &self,
        pipeline: &str,
    ) -> impl Future<Output = Result<Vec<CheckpointSummary>, AppError>> + Send;
}

/// Receives the record stream of each resource invocation.
///
/// The sink owns persistence, schema and batching; the engine only promises
/// that batches of one resource arrive in discovery order. Records accepted by
/// `write` may be buffered; `flush` makes them durable and is awaited before
/// the checkpoints covering them are persisted.
pub trait RecordSink: Send {
    /// Called once before the first batch of a resource invocation.
    fn begin(&mut self, resource: &ResourceMeta) -> impl Future<Output = Result<(), AppError>> + Send;

    fn write(
        &mut self,
        resource: &ResourceMeta,
        records: Vec<Record>,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Called once when a resource invocation ends, whatever its outcome.
    fn flush(&mut self, resource: &ResourceMeta) -> impl Future<Output = Result<(), AppError>> + Send;
}

/// A sink that discards everything.
#[derive(Debug, Clone, Default)]
pub struct NullSink;

impl RecordSink for NullSink {
    async fn begin(&mut self, _resource: &ResourceMeta) -> Result<(), AppError> {
        Ok(())
    }

    async fn write(&mut self, _resource: &ResourceMeta, _records: Vec<Record>) -> Result<(), AppError> {
        Ok(())
    }

    async fn flush(&mut self, _resource: &ResourceMeta) -> Result<(), AppError> {
        Ok(())
    }
}
