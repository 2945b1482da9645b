//! Test utilities: mock implementations of the core traits.
//!
//! Handwritten mocks for dependency injection in unit tests.
//! All mocks use `Arc<Mutex<_>>` for interior mutability, allowing
//! test assertions on recorded calls.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::AppError;
use crate::models::{Record, ResourceMeta, WriteDisposition};
use crate::runner::{RunEvent, RunReporter};
use crate::traits::{RecordSink, Upstream};

pub fn transient_error(url: &str) -> AppError {
    AppError::TransientUpstream {
        url: url.to_string(),
        status_code: Some(503),
        message: "HTTP 503".to_string(),
    }
}

pub fn permanent_error(url: &str) -> AppError {
    AppError::PermanentUpstream {
        url: url.to_string(),
        status_code: Some(404),
        message: "HTTP 404".to_string(),
    }
}

// ---------------------------------------------------------------------------
// MockUpstream
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
struct Route {
    body: serde_json::Value,
    /// Transient failures returned before the body is served.
    failures: u32,
    latency: Duration,
}

#[derive(Default)]
struct UpstreamState {
    routes: HashMap<String, Route>,
    calls: Vec<String>,
    active: usize,
    peak: usize,
}

/// Mock upstream serving JSON bodies per URL.
///
/// Unknown URLs fail with a permanent 404.
#[derive(Clone, Default)]
pub struct MockUpstream {
    state: Arc<Mutex<UpstreamState>>,
}

impl MockUpstream {
    pub fn new() -> Self {
        Self::default()
    }

    fn route(self, url: &str, update: impl FnOnce(&mut Route)) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            update(state.routes.entry(url.to_string()).or_default());
        }
        self
    }

    pub fn with_json(self, url: &str, body: serde_json::Value) -> Self {
        self.route(url, |r| r.body = body)
    }

    /// Fail the next `count` calls to `url` with a transient error.
    pub fn with_failures(self, url: &str, count: u32) -> Self {
        self.route(url, |r| r.failures = count)
    }

    pub fn with_latency(self, url: &str, latency: Duration) -> Self {
        self.route(url, |r| r.latency = latency)
    }

    /// Every URL requested so far, in call order.
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn call_count(&self, url: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|c| c.as_str() == url)
            .count()
    }

    /// Highest number of calls observed in flight at once.
    pub fn peak_concurrency(&self) -> usize {
        self.state.lock().unwrap().peak
    }
}

impl Upstream for MockUpstream {
    async fn fetch(&self, url: &str) -> Result<serde_json::Value, AppError> {
        let (route, fail) = {
            let mut state = self.state.lock().unwrap();
            state.calls.push(url.to_string());
            state.active += 1;
            state.peak = state.peak.max(state.active);
            match state.routes.get_mut(url) {
                Some(route) => {
                    let fail = route.failures > 0;
                    if fail {
                        route.failures -= 1;
                    }
                    (Some(route.clone()), fail)
                }
                None => (None, false),
            }
        };

        if let Some(route) = &route
            && !route.latency.is_zero()
        {
            tokio::time::sleep(route.latency).await;
        }

        self.state.lock().unwrap().active -= 1;

        match route {
            None => Err(permanent_error(url)),
            Some(_) if fail => Err(transient_error(url)),
            Some(route) => Ok(route.body),
        }
    }
}

// ---------------------------------------------------------------------------
// MockSink
// ---------------------------------------------------------------------------

/// One batch received by [`MockSink`].
#[derive(Debug, Clone)]
pub struct SinkBatch {
    pub resource: String,
    pub write_disposition: WriteDisposition,
    pub records: Vec<Record>,
}

/// Mock sink that buffers batches until `flush`, like a file-backed sink.
///
/// Only flushed batches count as delivered.
#[derive(Clone, Default)]
pub struct MockSink {
    pub begun: Arc<Mutex<Vec<String>>>,
    pub batches: Arc<Mutex<Vec<SinkBatch>>>,
    pending: Arc<Mutex<Vec<SinkBatch>>>,
    fail_resource: Option<String>,
    fail_flush: bool,
}

impl MockSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sink that rejects every write for `resource`.
    pub fn failing_for(resource: &str) -> Self {
        Self {
            fail_resource: Some(resource.to_string()),
            ..Self::default()
        }
    }

    /// Sink that accepts writes but never manages to flush them.
    pub fn failing_flush() -> Self {
        Self {
            fail_flush: true,
            ..Self::default()
        }
    }

    /// All delivered records for `resource`, in arrival order.
    pub fn records(&self, resource: &str) -> Vec<Record> {
        self.batches
            .lock()
            .unwrap()
            .iter()
            .filter(|b| b.resource == resource)
            .flat_map(|b| b.records.clone())
            .collect()
    }

    /// Values of `field` across the delivered records of `resource`.
    pub fn field(&self, resource: &str, field: &str) -> Vec<serde_json::Value> {
        self.records(resource)
            .into_iter()
            .filter_map(|r| r.get(field).cloned())
            .collect()
    }

    /// Records written but not yet flushed.
    pub fn buffered(&self) -> usize {
        self.pending
            .lock()
            .unwrap()
            .iter()
            .map(|b| b.records.len())
            .sum()
    }
}

impl RecordSink for MockSink {
    async fn begin(&mut self, resource: &ResourceMeta) -> Result<(), AppError> {
        self.begun.lock().unwrap().push(resource.name.clone());
        Ok(())
    }

    async fn write(&mut self, resource: &ResourceMeta, records: Vec<Record>) -> Result<(), AppError> {
        if self.fail_resource.as_deref() == Some(resource.name.as_str()) {
            return Err(AppError::Generic(format!(
                "sink rejected batch for {}",
                resource.name
            )));
        }
        self.pending.lock().unwrap().push(SinkBatch {
            resource: resource.name.clone(),
            write_disposition: resource.write_disposition,
            records,
        });
        Ok(())
    }

    async fn flush(&mut self, resource: &ResourceMeta) -> Result<(), AppError> {
        if self.fail_flush {
            return Err(AppError::Generic(format!(
                "sink could not flush {}",
                resource.name
            )));
        }
        let mut pending = self.pending.lock().unwrap();
        self.batches.lock().unwrap().append(&mut pending);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MockReporter
// ---------------------------------------------------------------------------

/// Mock run reporter that records event labels.
#[derive(Default)]
pub struct MockReporter {
    pub events: Arc<Mutex<Vec<String>>>,
}

impl MockReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, label: &str) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.as_str() == label)
            .count()
    }
}

impl RunReporter for MockReporter {
    fn report(&self, event: RunEvent<'_>) {
        let label = match &event {
            RunEvent::RunStarted { .. } => "RunStarted",
            RunEvent::ResourceStarted { .. } => "ResourceStarted",
            RunEvent::CheckpointsLoaded { .. } => "CheckpointsLoaded",
            RunEvent::ItemFiltered { .. } => "ItemFiltered",
            RunEvent::ItemSkipped { .. } => "ItemSkipped",
            RunEvent::TaskSubmitted { .. } => "TaskSubmitted",
            RunEvent::BatchEmitted { .. } => "BatchEmitted",
            RunEvent::CheckpointsFlushed { .. } => "CheckpointsFlushed",
            RunEvent::ResourceCompleted { .. } => "ResourceCompleted",
            RunEvent::ResourceFailed { .. } => "ResourceFailed",
            RunEvent::RunCompleted { .. } => "RunCompleted",
        };
        self.events.lock().unwrap().push(label.to_string());
    }
}
