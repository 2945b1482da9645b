use std::future::Future;

use tokio_util::sync::CancellationToken;

use crate::checkpoint::CheckpointStore;
use crate::error::AppError;
use crate::models::{Record, ResourceMeta, ResourceStats};
use crate::runner::{RunEvent, RunReporter};
use crate::traits::{CheckpointBackend, RecordSink, Upstream};

/// Everything a resource needs while it runs.
///
/// Lent by the runner for the duration of one resource invocation. The
/// checkpoint store is borrowed mutably so only the driving task can mark
/// or commit entries.
pub struct ExtractContext<'a, U, B> {
    pub upstream: &'a U,
    pub checkpoints: &'a mut CheckpointStore<B>,
    /// Maximum deferred fetches in flight.
    pub concurrency: usize,
    pub cancel: &'a CancellationToken,
    pub reporter: &'a dyn RunReporter,
}

impl<U, B> ExtractContext<'_, U, B>
where
    U: Upstream,
    B: CheckpointBackend,
{
    /// Fail with [`AppError::Cancelled`] if the run was cancelled.
    pub fn ensure_active(&self) -> Result<(), AppError> {
        if self.cancel.is_cancelled() {
            Err(AppError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Hand a batch to the sink and account for it.
    pub async fn emit<S: RecordSink>(
        &self,
        meta: &ResourceMeta,
        sink: &mut S,
        records: Vec<Record>,
        stats: &mut ResourceStats,
    ) -> Result<(), AppError> {
        let count = records.len();
        sink.write(meta, records).await?;
        stats.records_emitted += count;
        self.reporter.report(RunEvent::BatchEmitted {
            resource: &meta.name,
            records: count,
        });
        Ok(())
    }
}

/// A named unit of extraction producing a record stream.
pub trait Resource: Send + Sync {
    fn meta(&self) -> &ResourceMeta;

    fn name(&self) -> &str {
        &self.meta().name
    }

    /// Run one invocation, streaming records into `sink` in discovery order.
    fn extract<U, B, S>(
        &self,
        ctx: &mut ExtractContext<'_, U, B>,
        sink: &mut S,
    ) -> impl Future<Output = Result<ResourceStats, AppError>> + Send
    where
        U: Upstream,
        B: CheckpointBackend,
        S: RecordSink;
}
