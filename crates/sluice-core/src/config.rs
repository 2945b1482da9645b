use std::time::Duration;

use crate::checkpoint::CheckpointPolicy;
use crate::error::AppError;
use crate::retry::RetryPolicy;

/// Default number of deferred fetches in flight per resource.
pub const DEFAULT_CONCURRENCY: usize = 5;

/// Engine-wide knobs shared by every resource of a run.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum deferred fetches in flight per resource.
    pub concurrency: usize,
    pub retry: RetryPolicy,
    pub checkpoint_policy: CheckpointPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            retry: RetryPolicy::default(),
            checkpoint_policy: CheckpointPolicy::default(),
        }
    }
}

impl EngineConfig {
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_retry_params(
        mut self,
        max_attempts: u32,
        initial_delay: Duration,
        backoff_factor: f64,
    ) -> Self {
        self.retry = RetryPolicy::new(max_attempts, initial_delay, backoff_factor);
        self
    }

    pub fn with_checkpoint_policy(mut self, policy: CheckpointPolicy) -> Self {
        self.checkpoint_policy = policy;
        self
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.concurrency == 0 {
            return Err(AppError::ConfigError(
                "concurrency must be at least 1".into(),
            ));
        }
        self.retry.validate()
    }
}
