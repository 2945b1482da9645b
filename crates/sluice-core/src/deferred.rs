//! Bounded-concurrency task engine with in-order result delivery.
//!
//! ```text
//! submit() --> QUEUED --[slot free]--> RUNNING --> SUCCEEDED
//!                                         |
//!                                         +------> FAILED_RETRYABLE / FAILED_TERMINAL
//! ```
//!
//! At most `limit` tasks run at any time. Results come out of
//! [`DeferredEngine::next`] in submission order: a task that finishes early
//! moves to a reorder buffer, freeing its slot, and stays there until every
//! earlier task has been surfaced.
//!
//! The first failure of any task halts dispatch, even while earlier tasks are
//! still running. Results ahead of the failure keep surfacing in order; when
//! the failure itself is reached the engine waits for in-flight tasks,
//! discards their results and returns the failure. Results surfaced before
//! the failure stay surfaced.

use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::future::BoxFuture;
use futures::stream::{self, FuturesUnordered, Stream, StreamExt};

use crate::error::AppError;

/// Lifecycle state of a deferred task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Queued,
    Running,
    Succeeded,
    /// Failed with an error that a retry layer could still have handled.
    FailedRetryable,
    FailedTerminal,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::FailedRetryable | TaskState::FailedTerminal
        )
    }
}

/// Identifies a submitted task; handles are issued in submission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskHandle(usize);

impl TaskHandle {
    pub fn index(&self) -> usize {
        self.0
    }
}

type Task<T> = BoxFuture<'static, Result<T, AppError>>;
type InFlight<T> = BoxFuture<'static, (TaskHandle, Result<T, AppError>)>;

pub struct DeferredEngine<T> {
    limit: usize,
    queued: VecDeque<(TaskHandle, Task<T>)>,
    running: FuturesUnordered<InFlight<T>>,
    /// Finished results waiting for their turn, keyed by handle index.
    finished: BTreeMap<usize, Result<T, AppError>>,
    /// Index of the next handle to surface.
    cursor: usize,
    states: Vec<TaskState>,
    /// Set by a task the moment it fails.
    failed: Arc<AtomicBool>,
    /// The failure has been surfaced; nothing more comes out.
    halted: bool,
}

impl<T: Send + 'static> DeferredEngine<T> {
    /// Create an engine running at most `limit` tasks at once (minimum 1).
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            queued: VecDeque::new(),
            running: FuturesUnordered::new(),
            finished: BTreeMap::new(),
            cursor: 0,
            states: Vec::new(),
            failed: Arc::new(AtomicBool::new(false)),
            halted: false,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Schedule a task. It starts as soon as a concurrency slot is free.
    ///
    /// Must be called within a tokio runtime. Tasks submitted after a task
    /// failed are recorded but never started.
    pub fn submit<F>(&mut self, task: F) -> TaskHandle
    where
        F: Future<Output = Result<T, AppError>> + Send + 'static,
    {
        let handle = TaskHandle(self.states.len());
        self.states.push(TaskState::Queued);
        self.queued.push_back((handle, Box::pin(task)));
        self.dispatch();
        handle
    }

    pub fn state(&self, handle: TaskHandle) -> Option<TaskState> {
        self.states.get(handle.0).copied()
    }

    /// Number of tasks submitted so far.
    pub fn submitted(&self) -> usize {
        self.states.len()
    }

    /// Tasks spawned and not yet collected into the reorder buffer.
    pub fn in_flight(&self) -> usize {
        self.running.len()
    }

    /// True once any task has failed; no further task will be started.
    pub fn is_halted(&self) -> bool {
        self.halted || self.failed.load(Ordering::SeqCst)
    }

    /// True when nothing is queued, in flight or waiting to be surfaced.
    pub fn is_idle(&self) -> bool {
        self.queued.is_empty() && self.running.is_empty() && self.finished.is_empty()
    }

    fn dispatch(&mut self) {
        while !self.is_halted() && self.running.len() < self.limit {
            let Some((handle, task)) = self.queued.pop_front() else {
                break;
            };
            self.states[handle.0] = TaskState::Running;
            let failed = self.failed.clone();
            let join = tokio::spawn(async move {
                let result = task.await;
                if result.is_err() {
                    failed.store(true, Ordering::SeqCst);
                }
                result
            });
            self.running.push(Box::pin(async move {
                let result = match join.await {
                    Ok(result) => result,
                    Err(e) => Err(AppError::Generic(format!("Deferred task aborted: {e}"))),
                };
                (handle, result)
            }));
        }
    }

    fn settle(&mut self, handle: TaskHandle, result: &Result<T, AppError>) {
        self.states[handle.0] = match result {
            Ok(_) => TaskState::Succeeded,
            Err(e) if e.is_retryable() => TaskState::FailedRetryable,
            Err(_) => TaskState::FailedTerminal,
        };
        if result.is_err() {
            // Panics only show up here.
            self.failed.store(true, Ordering::SeqCst);
        }
    }

    /// Surface the next result in submission order.
    ///
    /// Returns `None` once every task has been surfaced, or after a failure
    /// has been returned.
    pub async fn next(&mut self) -> Option<Result<T, AppError>> {
        if self.halted {
            return None;
        }

        loop {
            if let Some(result) = self.finished.remove(&self.cursor) {
                let handle = TaskHandle(self.cursor);
                self.cursor += 1;
                return match result {
                    Ok(value) => {
                        self.dispatch();
                        Some(Ok(value))
                    }
                    Err(e) => {
                        self.halt(handle).await;
                        Some(Err(e))
                    }
                };
            }

            self.dispatch();
            let (handle, result) = self.running.next().await?;
            self.settle(handle, &result);
            self.finished.insert(handle.0, result);
        }
    }

    /// Stop for good and wait for in-flight tasks to finish.
    async fn halt(&mut self, failed: TaskHandle) {
        self.halted = true;
        let abandoned = self.queued.len();
        self.queued.clear();

        let mut drained = 0usize;
        while let Some((handle, result)) = self.running.next().await {
            self.settle(handle, &result);
            drained += 1;
        }
        let discarded = self.finished.len();
        self.finished.clear();

        tracing::debug!(
            failed_task = failed.0,
            abandoned,
            drained,
            discarded,
            "Deferred engine halted after task failure"
        );
    }

    /// Consume the engine as a stream of results in submission order.
    pub fn drain_in_order(self) -> impl Stream<Item = Result<T, AppError>> + Send {
        stream::unfold(self, |mut engine| async move {
            engine.next().await.map(|result| (result, engine))
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::testutil::{permanent_error, transient_error};

    /// Task that sleeps, tracking how many tasks run at the same time.
    fn tracked_task(
        value: usize,
        delay_ms: u64,
        active: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    ) -> impl Future<Output = Result<usize, AppError>> + Send + 'static {
        async move {
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            active.fetch_sub(1, Ordering::SeqCst);
            Ok(value)
        }
    }

    #[tokio::test]
    async fn results_surface_in_submission_order_for_all_latency_permutations() {
        let latencies: [u64; 4] = [5, 15, 25, 35];
        let permutations = permutations(&latencies);
        assert_eq!(permutations.len(), 24);

        for delays in permutations {
            let active = Arc::new(AtomicUsize::new(0));
            let peak = Arc::new(AtomicUsize::new(0));
            let mut engine = DeferredEngine::new(2);

            for (i, delay) in delays.iter().enumerate() {
                engine.submit(tracked_task(i, *delay, active.clone(), peak.clone()));
            }

            let results: Vec<usize> = engine
                .drain_in_order()
                .map(|r| r.unwrap())
                .collect()
                .await;

            assert_eq!(results, vec![0, 1, 2, 3], "latencies {delays:?}");
            assert!(peak.load(Ordering::SeqCst) <= 2, "latencies {delays:?}");
        }
    }

    #[tokio::test]
    async fn concurrency_never_exceeds_limit() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut engine = DeferredEngine::new(3);

        for i in 0..12 {
            let delay = [7, 2, 11, 4][i % 4];
            engine.submit(tracked_task(i, delay, active.clone(), peak.clone()));
        }
        assert_eq!(engine.in_flight(), 3);

        let mut seen = Vec::new();
        while let Some(r) = engine.next().await {
            seen.push(r.unwrap());
        }

        assert_eq!(seen, (0..12).collect::<Vec<_>>());
        assert_eq!(peak.load(Ordering::SeqCst), 3);
        assert!(engine.is_idle());
    }

    #[tokio::test]
    async fn tasks_run_in_parallel() {
        let mut engine = DeferredEngine::new(4);
        let start = std::time::Instant::now();
        for i in 0..4 {
            engine.submit(async move {
                tokio::time::sleep(Duration::from_millis(60)).await;
                Ok(i)
            });
        }
        let results: Vec<_> = engine.drain_in_order().collect().await;
        assert_eq!(results.len(), 4);
        assert!(start.elapsed() < Duration::from_millis(200));
    }

    #[tokio::test]
    async fn failure_behind_slow_task_stops_dispatch() {
        let started = Arc::new(AtomicUsize::new(0));
        let mut engine = DeferredEngine::new(2);
        let mut handles = Vec::new();

        for i in 0..6usize {
            let started = started.clone();
            handles.push(engine.submit(async move {
                started.fetch_add(1, Ordering::SeqCst);
                match i {
                    0 => tokio::time::sleep(Duration::from_millis(60)).await,
                    1 => return Err(permanent_error("https://api.test/page/1")),
                    _ => tokio::time::sleep(Duration::from_millis(5)).await,
                }
                Ok(i)
            }));
        }

        // Task 1 failed long before task 0 surfaced; nothing else may start.
        assert_eq!(engine.next().await.unwrap().unwrap(), 0);
        assert_eq!(started.load(Ordering::SeqCst), 2);
        assert!(engine.is_halted());

        let err = engine.next().await.unwrap().unwrap_err();
        assert!(matches!(err, AppError::PermanentUpstream { .. }));
        assert!(engine.next().await.is_none());

        assert_eq!(started.load(Ordering::SeqCst), 2);
        assert_eq!(engine.state(handles[0]), Some(TaskState::Succeeded));
        assert_eq!(engine.state(handles[1]), Some(TaskState::FailedTerminal));
        for handle in &handles[2..] {
            assert_eq!(engine.state(*handle), Some(TaskState::Queued));
        }
    }

    #[tokio::test]
    async fn submit_after_failure_is_not_started() {
        let mut engine = DeferredEngine::new(2);
        engine.submit(async { Err::<usize, _>(permanent_error("https://api.test/page/0")) });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(engine.is_halted());

        let late = engine.submit(async { Ok(1usize) });
        assert_eq!(engine.state(late), Some(TaskState::Queued));
        assert_eq!(engine.in_flight(), 1);

        assert!(engine.next().await.unwrap().is_err());
        assert!(engine.next().await.is_none());
        assert_eq!(engine.state(late), Some(TaskState::Queued));
    }

    #[tokio::test]
    async fn slow_head_leaves_other_slots_busy() {
        let started = Arc::new(AtomicUsize::new(0));
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut engine = DeferredEngine::new(2);

        for i in 0..5usize {
            let delay = if i == 0 { 80 } else { 5 };
            let started = started.clone();
            let task = tracked_task(i, delay, active.clone(), peak.clone());
            engine.submit(async move {
                started.fetch_add(1, Ordering::SeqCst);
                task.await
            });
        }

        // While task 0 runs, the second slot works through tasks 1..5.
        assert_eq!(engine.next().await.unwrap().unwrap(), 0);
        assert_eq!(started.load(Ordering::SeqCst), 5);
        assert_eq!(peak.load(Ordering::SeqCst), 2);

        let rest: Vec<usize> = engine.drain_in_order().map(|r| r.unwrap()).collect().await;
        assert_eq!(rest, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn early_finisher_waits_for_slow_predecessor_failure() {
        let mut engine = DeferredEngine::new(2);
        let slow = engine.submit(async {
            tokio::time::sleep(Duration::from_millis(40)).await;
            Err::<usize, _>(transient_error("https://api.test/slow"))
        });
        let fast = engine.submit(async { Ok(1usize) });

        let first = engine.next().await.unwrap();
        assert!(first.is_err());
        assert!(engine.next().await.is_none());
        assert_eq!(engine.state(slow), Some(TaskState::FailedRetryable));
        // The fast task finished but its result is never surfaced.
        assert_eq!(engine.state(fast), Some(TaskState::Succeeded));
    }

    #[tokio::test]
    async fn panicking_task_surfaces_as_error() {
        let mut engine: DeferredEngine<usize> = DeferredEngine::new(1);
        let handle = engine.submit(async {
            if true {
                panic!("boom");
            }
            Ok(0)
        });
        let err = engine.next().await.unwrap().unwrap_err();
        assert!(err.to_string().contains("aborted"));
        assert_eq!(engine.state(handle), Some(TaskState::FailedTerminal));
    }

    #[tokio::test]
    async fn empty_engine_yields_nothing() {
        let mut engine: DeferredEngine<()> = DeferredEngine::new(0);
        assert_eq!(engine.limit(), 1);
        assert!(engine.next().await.is_none());
        assert_eq!(engine.submitted(), 0);
    }

    fn permutations(items: &[u64]) -> Vec<Vec<u64>> {
        if items.len() <= 1 {
            return vec![items.to_vec()];
        }
        let mut out = Vec::new();
        for i in 0..items.len() {
            let mut rest = items.to_vec();
            let head = rest.remove(i);
            for mut tail in permutations(&rest) {
                tail.insert(0, head);
                out.push(tail);
            }
        }
        out
    }
}
