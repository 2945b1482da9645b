use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::checkpoint::{CheckpointPolicy, CheckpointStore};
use crate::config::EngineConfig;
use crate::error::AppError;
use crate::models::{ResourceMeta, ResourceStats};
use crate::resource::{ExtractContext, Resource};
use crate::retry::RetryingUpstream;
use crate::source::Source;
use crate::traits::{CheckpointBackend, RecordSink, Upstream};

/// Events emitted during a run for monitoring/logging.
#[derive(Debug, Clone)]
pub enum RunEvent<'a> {
    RunStarted {
        run_id: Uuid,
        source: &'a str,
        resources: usize,
    },
    ResourceStarted {
        meta: &'a ResourceMeta,
    },
    CheckpointsLoaded {
        resource: &'a str,
        entries: usize,
    },
    ItemFiltered {
        resource: &'a str,
        item: &'a str,
    },
    ItemSkipped {
        resource: &'a str,
        item: &'a str,
    },
    TaskSubmitted {
        resource: &'a str,
        item: &'a str,
    },
    BatchEmitted {
        resource: &'a str,
        records: usize,
    },
    CheckpointsFlushed {
        resource: &'a str,
        entries: usize,
    },
    ResourceCompleted {
        stats: &'a ResourceStats,
    },
    ResourceFailed {
        resource: &'a str,
        error: &'a AppError,
    },
    RunCompleted {
        run_id: Uuid,
        resources: usize,
        records: usize,
    },
}

/// Trait for receiving run events (decoupled logging).
pub trait RunReporter: Send + Sync {
    fn report(&self, event: RunEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingRunReporter;

impl RunReporter for TracingRunReporter {
    fn report(&self, event: RunEvent<'_>) {
        match event {
            RunEvent::RunStarted {
                run_id,
                source,
                resources,
            } => {
                tracing::info!(%run_id, %source, %resources, "Run started");
            }
            RunEvent::ResourceStarted { meta } => {
                tracing::info!(
                    resource = %meta.name,
                    write_disposition = %meta.write_disposition,
                    "Resource started"
                );
            }
            RunEvent::CheckpointsLoaded { resource, entries } => {
                tracing::debug!(%resource, %entries, "Checkpoints loaded");
            }
            RunEvent::ItemFiltered { resource, item } => {
                tracing::debug!(%resource, %item, "Outside range, skipped");
            }
            RunEvent::ItemSkipped { resource, item } => {
                tracing::debug!(%resource, %item, "Already processed, skipped");
            }
            RunEvent::TaskSubmitted { resource, item } => {
                tracing::debug!(%resource, %item, "Fetch task submitted");
            }
            RunEvent::BatchEmitted { resource, records } => {
                tracing::debug!(%resource, %records, "Batch emitted");
            }
            RunEvent::CheckpointsFlushed { resource, entries } => {
                tracing::info!(%resource, %entries, "Checkpoints flushed");
            }
            RunEvent::ResourceCompleted { stats } => {
                tracing::info!(
                    resource = %stats.name,
                    candidates = %stats.candidates,
                    skipped = %stats.skipped,
                    tasks = %stats.tasks_submitted,
                    records = %stats.records_emitted,
                    "Resource completed"
                );
            }
            RunEvent::ResourceFailed { resource, error } => {
                tracing::error!(%resource, %error, "Resource failed");
            }
            RunEvent::RunCompleted {
                run_id,
                resources,
                records,
            } => {
                tracing::info!(%run_id, %resources, %records, "Run completed");
            }
        }
    }
}

/// Outcome of a successful run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub source: String,
    pub resources: Vec<ResourceStats>,
}

impl RunReport {
    pub fn records_emitted(&self) -> usize {
        self.resources.iter().map(|r| r.records_emitted).sum()
    }

    pub fn tasks_submitted(&self) -> usize {
        self.resources.iter().map(|r| r.tasks_submitted).sum()
    }
}

/// Drives the resources of a source one after the other.
///
/// The upstream is wrapped in the configured retry policy; resources only
/// ever see the retrying handle.
pub struct PipelineRunner<U, B>
where
    U: Upstream,
    B: CheckpointBackend,
{
    upstream: RetryingUpstream<U>,
    checkpoints: CheckpointStore<B>,
    config: EngineConfig,
}

impl<U, B> PipelineRunner<U, B>
where
    U: Upstream,
    B: CheckpointBackend,
{
    pub fn new(upstream: U, backend: B, pipeline: impl Into<String>, config: EngineConfig) -> Self {
        let checkpoints = CheckpointStore::new(backend, pipeline, config.checkpoint_policy);
        Self {
            upstream: RetryingUpstream::new(upstream, config.retry.clone()),
            checkpoints,
            config,
        }
    }

    pub fn checkpoints(&self) -> &CheckpointStore<B> {
        &self.checkpoints
    }

    /// Run every resource of `source` in order, stopping at the first failure.
    ///
    /// Each resource's checkpoint scope is flushed when it ends, including on
    /// failure, so work committed before the failure is kept.
    pub async fn run<R, S, WR>(
        &mut self,
        source: &Source<R>,
        sink: &mut S,
        cancel: &CancellationToken,
        reporter: &WR,
    ) -> Result<RunReport, AppError>
    where
        R: Resource,
        S: RecordSink,
        WR: RunReporter,
    {
        self.config.validate()?;

        let run_id = Uuid::new_v4();
        reporter.report(RunEvent::RunStarted {
            run_id,
            source: source.name(),
            resources: source.len(),
        });

        let mut report = RunReport {
            run_id,
            source: source.name().to_string(),
            resources: Vec::with_capacity(source.len()),
        };

        for resource in source.resources() {
            if cancel.is_cancelled() {
                return Err(AppError::Cancelled);
            }
            let stats = self.run_resource(resource, sink, cancel, reporter).await?;
            report.resources.push(stats);
        }

        reporter.report(RunEvent::RunCompleted {
            run_id,
            resources: report.resources.len(),
            records: report.records_emitted(),
        });

        Ok(report)
    }

    async fn run_resource<R, S, WR>(
        &mut self,
        resource: &R,
        sink: &mut S,
        cancel: &CancellationToken,
        reporter: &WR,
    ) -> Result<ResourceStats, AppError>
    where
        R: Resource,
        S: RecordSink,
        WR: RunReporter,
    {
        let meta = resource.meta();
        reporter.report(RunEvent::ResourceStarted { meta });

        let entries = self.checkpoints.load(&meta.name).await?;
        reporter.report(RunEvent::CheckpointsLoaded {
            resource: &meta.name,
            entries,
        });

        let result = match sink.begin(meta).await {
            Ok(()) => {
                let mut ctx = ExtractContext {
                    upstream: &self.upstream,
                    checkpoints: &mut self.checkpoints,
                    concurrency: self.config.concurrency,
                    cancel,
                    reporter,
                };
                resource.extract(&mut ctx, sink).await
            }
            Err(e) => Err(e),
        };

        // Records first: a checkpoint may only outlive the records it covers.
        let result = match (result, sink.flush(meta).await) {
            (result, Ok(())) => result,
            (Ok(_), Err(e)) => {
                self.forget_uncovered(&meta.name);
                Err(e)
            }
            (Err(e), Err(sink_err)) => {
                tracing::error!(resource = %meta.name, error = %sink_err, "Failed to flush sink after failure");
                self.forget_uncovered(&meta.name);
                Err(e)
            }
        };

        // Flush regardless of outcome: committed entries must survive a failure.
        let flushed = self.checkpoints.flush(&meta.name).await;

        match (result, flushed) {
            (Ok(stats), Ok(entries)) => {
                reporter.report(RunEvent::CheckpointsFlushed {
                    resource: &meta.name,
                    entries,
                });
                reporter.report(RunEvent::ResourceCompleted { stats: &stats });
                Ok(stats)
            }
            (Err(e), flushed) => {
                if let Err(flush_err) = flushed {
                    tracing::error!(resource = %meta.name, error = %flush_err, "Failed to flush checkpoints after failure");
                }
                reporter.report(RunEvent::ResourceFailed {
                    resource: &meta.name,
                    error: &e,
                });
                Err(e)
            }
            (Ok(_), Err(e)) => {
                reporter.report(RunEvent::ResourceFailed {
                    resource: &meta.name,
                    error: &e,
                });
                Err(e)
            }
        }
    }

    /// Drop marks whose records may not have reached the sink's storage.
    ///
    /// Under `MarkOnSubmit` marks are durable regardless of delivery.
    fn forget_uncovered(&mut self, resource: &str) {
        if self.checkpoints.policy() == CheckpointPolicy::CommitOnYield {
            let dropped = self.checkpoints.discard(resource);
            tracing::warn!(%resource, dropped, "Sink flush failed, checkpoints not persisted");
        }
    }
}
