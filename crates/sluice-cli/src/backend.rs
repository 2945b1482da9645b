use std::collections::HashSet;
use std::path::Path;

use sluice_core::checkpoint::FileCheckpointBackend;
use sluice_core::error::AppError;
use sluice_core::models::CheckpointSummary;
use sluice_core::traits::CheckpointBackend;
use sluice_db::{CheckpointRepository, Database, DatabaseConfig};

/// Checkpoint storage selected at startup.
#[derive(Clone)]
pub enum StateBackend {
    File(FileCheckpointBackend),
    Postgres(CheckpointRepository),
}

impl StateBackend {
    /// Postgres when `DATABASE_URL` is set, otherwise files under `state_dir`.
    pub async fn open(state_dir: &Path) -> Result<Self, AppError> {
        if std::env::var_os("DATABASE_URL").is_none() {
            tracing::debug!(state_dir = %state_dir.display(), "Using file checkpoints");
            return Ok(Self::File(FileCheckpointBackend::new(state_dir)));
        }

        let db = Database::connect(&DatabaseConfig::from_env()?).await?;
        db.migrate().await?;
        tracing::debug!("Using Postgres checkpoints");
        Ok(Self::Postgres(db.checkpoint_repo()))
    }

    pub fn describe(&self) -> String {
        match self {
            Self::File(b) => format!("files in {}", b.root().display()),
            Self::Postgres(_) => "postgres".to_string(),
        }
    }
}

impl CheckpointBackend for StateBackend {
    async fn load(&self, pipeline: &str, resource: &str) -> Result<HashSet<String>, AppError> {
        match self {
            Self::File(b) => b.load(pipeline, resource).await,
            Self::Postgres(b) => b.load(pipeline, resource).await,
        }
    }

    async fn save(&self, pipeline: &str, resource: &str, ids: &[String]) -> Result<(), AppError> {
        match self {
            Self::File(b) => b.save(pipeline, resource, ids).await,
            Self::Postgres(b) => b.save(pipeline, resource, ids).await,
        }
    }

    async fn reset(&self, pipeline: &str, resource: &str) -> Result<u64, AppError> {
        match self {
            Self::File(b) => b.reset(pipeline, resource).await,
            Self::Postgres(b) => b.reset(pipeline, resource).await,
        }
    }

    async fn scopes(&self, pipeline: &str) -> Result<Vec<CheckpointSummary>, AppError> {
        match self {
            Self::File(b) => b.scopes(pipeline).await,
            Self::Postgres(b) => b.scopes(pipeline).await,
        }
    }
}
