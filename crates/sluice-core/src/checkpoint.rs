//! Resource-scoped record of already processed work items.
//!
//! A [`CheckpointStore`] keeps the checkpoint set of each resource of one
//! pipeline in memory. A scope is loaded fully from its
//! [`CheckpointBackend`] when the resource starts and flushed in one write
//! when the resource ends, whatever the outcome.
//!
//! Which marks become durable is governed by [`CheckpointPolicy`]:
//!
//! - `CommitOnYield`: a mark is durable only after the records of its unit
//!   were accepted by the sink. A crash may cause a unit to be fetched again,
//!   never to be lost.
//! - `MarkOnSubmit`: a mark is durable as soon as the unit is submitted, even
//!   if its fetch later fails.
//!
//! In both cases marking happens at submission time in memory, so a unit is
//! never submitted twice within one invocation.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::error::AppError;
use crate::models::{CheckpointSummary, compute_hash};
use crate::traits::CheckpointBackend;

/// When in-memory marks become eligible for persistence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CheckpointPolicy {
    #[default]
    CommitOnYield,
    MarkOnSubmit,
}

#[derive(Debug, Default)]
struct ScopeState {
    /// Loaded entries plus everything marked during this invocation.
    processed: HashSet<String>,
    /// Marked but not yet accepted downstream (`CommitOnYield` only).
    in_flight: HashSet<String>,
    /// Durable-eligible entries waiting for the next flush, in mark order.
    unflushed: Vec<String>,
}

/// In-memory view over the checkpoint scopes of one pipeline.
///
/// Mutated only by the task driving the resources; worker tasks never touch it.
pub struct CheckpointStore<B> {
    backend: B,
    pipeline: String,
    policy: CheckpointPolicy,
    scopes: HashMap<String, ScopeState>,
}

impl<B: CheckpointBackend> CheckpointStore<B> {
    pub fn new(backend: B, pipeline: impl Into<String>, policy: CheckpointPolicy) -> Self {
        Self {
            backend,
            pipeline: pipeline.into(),
            policy,
            scopes: HashMap::new(),
        }
    }

    pub fn pipeline(&self) -> &str {
        &self.pipeline
    }

    pub fn policy(&self) -> CheckpointPolicy {
        self.policy
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Replace the in-memory scope of `resource` with its persisted contents.
    ///
    /// Returns the number of loaded entries.
    pub async fn load(&mut self, resource: &str) -> Result<usize, AppError> {
        let processed = self.backend.load(&self.pipeline, resource).await?;
        let count = processed.len();
        self.scopes.insert(
            resource.to_string(),
            ScopeState {
                processed,
                ..ScopeState::default()
            },
        );
        tracing::debug!(pipeline = %self.pipeline, %resource, count, "Checkpoint scope loaded");
        Ok(count)
    }

    pub fn has(&self, resource: &str, id: &str) -> bool {
        self.scopes
            .get(resource)
            .is_some_and(|scope| scope.processed.contains(id))
    }

    /// Mark `id` as processed. Returns false if it was already marked.
    pub fn mark_processed(&mut self, resource: &str, id: &str) -> bool {
        let policy = self.policy;
        let scope = self.scopes.entry(resource.to_string()).or_default();
        if !scope.processed.insert(id.to_string()) {
            return false;
        }
        match policy {
            CheckpointPolicy::MarkOnSubmit => scope.unflushed.push(id.to_string()),
            CheckpointPolicy::CommitOnYield => {
                scope.in_flight.insert(id.to_string());
            }
        }
        true
    }

    /// Record that the records of `id` were accepted downstream.
    pub fn commit(&mut self, resource: &str, id: &str) {
        if let Some(scope) = self.scopes.get_mut(resource)
            && scope.in_flight.remove(id)
        {
            scope.unflushed.push(id.to_string());
        }
    }

    /// Number of marks waiting to be flushed for `resource`.
    pub fn pending(&self, resource: &str) -> usize {
        self.scopes
            .get(resource)
            .map_or(0, |scope| scope.unflushed.len())
    }

    /// Persist eligible marks of `resource` in one write.
    ///
    /// Marks that were never committed are forgotten, so a later invocation
    /// in the same process fetches those units again. Returns the number of
    /// persisted entries.
    pub async fn flush(&mut self, resource: &str) -> Result<usize, AppError> {
        let Some(scope) = self.scopes.get_mut(resource) else {
            return Ok(0);
        };

        for id in scope.in_flight.drain() {
            scope.processed.remove(&id);
        }

        if scope.unflushed.is_empty() {
            return Ok(0);
        }
        let ids = std::mem::take(&mut scope.unflushed);
        if let Err(e) = self.backend.save(&self.pipeline, resource, &ids).await {
            // Keep the marks so a retried flush still has them.
            if let Some(scope) = self.scopes.get_mut(resource) {
                scope.unflushed = ids;
            }
            return Err(e);
        }

        tracing::debug!(pipeline = %self.pipeline, %resource, count = ids.len(), "Checkpoint scope flushed");
        Ok(ids.len())
    }

    /// Forget every mark of `resource` that is not persisted yet.
    ///
    /// Used when the records behind the marks may not have reached storage.
    /// Returns the number of forgotten marks.
    pub fn discard(&mut self, resource: &str) -> usize {
        let Some(scope) = self.scopes.get_mut(resource) else {
            return 0;
        };
        let ids: Vec<String> = scope
            .in_flight
            .drain()
            .chain(scope.unflushed.drain(..))
            .collect();
        for id in &ids {
            scope.processed.remove(id);
        }
        ids.len()
    }

    /// Drop every persisted and in-memory entry of `resource`.
    pub async fn reset(&mut self, resource: &str) -> Result<u64, AppError> {
        let removed = self.backend.reset(&self.pipeline, resource).await?;
        self.scopes.remove(resource);
        Ok(removed)
    }
}

// ---------------------------------------------------------------------------
// MemoryCheckpointBackend
// ---------------------------------------------------------------------------

type ScopeKey = (String, String);

/// Process-local backend; state survives across stores sharing the same clone.
#[derive(Debug, Clone, Default)]
pub struct MemoryCheckpointBackend {
    scopes: Arc<Mutex<HashMap<ScopeKey, (HashSet<String>, DateTime<Utc>)>>>,
}

impl MemoryCheckpointBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend pre-populated with `ids` for one scope.
    pub fn with_entries(pipeline: &str, resource: &str, ids: &[&str]) -> Self {
        let backend = Self::new();
        backend.lock().insert(
            (pipeline.to_string(), resource.to_string()),
            (ids.iter().map(|s| s.to_string()).collect(), Utc::now()),
        );
        backend
    }

    /// Snapshot of one scope.
    pub fn entries(&self, pipeline: &str, resource: &str) -> HashSet<String> {
        self.lock()
            .get(&(pipeline.to_string(), resource.to_string()))
            .map(|(ids, _)| ids.clone())
            .unwrap_or_default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ScopeKey, (HashSet<String>, DateTime<Utc>)>> {
        self.scopes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl CheckpointBackend for MemoryCheckpointBackend {
    async fn load(&self, pipeline: &str, resource: &str) -> Result<HashSet<String>, AppError> {
        Ok(self.entries(pipeline, resource))
    }

    async fn save(&self, pipeline: &str, resource: &str, ids: &[String]) -> Result<(), AppError> {
        let mut scopes = self.lock();
        let (set, updated) = scopes
            .entry((pipeline.to_string(), resource.to_string()))
            .or_insert_with(|| (HashSet::new(), Utc::now()));
        set.extend(ids.iter().cloned());
        *updated = Utc::now();
        Ok(())
    }

    async fn reset(&self, pipeline: &str, resource: &str) -> Result<u64, AppError> {
        let removed = self
            .lock()
            .remove(&(pipeline.to_string(), resource.to_string()))
            .map_or(0, |(ids, _)| ids.len() as u64);
        Ok(removed)
    }

    async fn scopes(&self, pipeline: &str) -> Result<Vec<CheckpointSummary>, AppError> {
        let mut summaries: Vec<_> = self
            .lock()
            .iter()
            .filter(|((p, _), _)| p == pipeline)
            .map(|((p, r), (ids, updated))| CheckpointSummary {
                pipeline: p.clone(),
                resource: r.clone(),
                entries: ids.len() as u64,
                last_updated: Some(*updated),
            })
            .collect();
        summaries.sort_by(|a, b| a.resource.cmp(&b.resource));
        Ok(summaries)
    }
}

// ---------------------------------------------------------------------------
// FileCheckpointBackend
// ---------------------------------------------------------------------------

/// On-disk document holding one scope.
#[derive(Debug, Serialize, Deserialize)]
struct ScopeFile {
    pipeline: String,
    resource: String,
    updated_at: DateTime<Utc>,
    ids: Vec<String>,
}

/// Backend storing one JSON document per scope under a state directory.
///
/// Files are named after the SHA-256 of the scope so arbitrary pipeline and
/// resource names map to safe file names. Writes go to a temporary file that is
/// synced and then renamed over the previous document.
#[derive(Debug, Clone)]
pub struct FileCheckpointBackend {
    root: PathBuf,
}

impl FileCheckpointBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn scope_path(&self, pipeline: &str, resource: &str) -> PathBuf {
        let key = compute_hash(&format!("{pipeline}\u{0}{resource}"));
        self.root.join(format!("{key}.json"))
    }

    async fn read_scope(path: &Path) -> Result<Option<ScopeFile>, AppError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(AppError::CheckpointError(format!(
                "Failed to read {}: {e}",
                path.display()
            ))),
        }
    }

    async fn write_scope(&self, path: &Path, scope: &ScopeFile) -> Result<(), AppError> {
        let io_err = |e: std::io::Error| {
            AppError::CheckpointError(format!("Failed to write {}: {e}", path.display()))
        };
        tokio::fs::create_dir_all(&self.root).await.map_err(io_err)?;
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(scope)?;
        let mut file = tokio::fs::File::create(&tmp).await.map_err(io_err)?;
        file.write_all(&bytes).await.map_err(io_err)?;
        // Contents must be on disk before the rename makes them visible.
        file.sync_all().await.map_err(io_err)?;
        drop(file);
        tokio::fs::rename(&tmp, path).await.map_err(io_err)?;
        Ok(())
    }
}

impl CheckpointBackend for FileCheckpointBackend {
    async fn load(&self, pipeline: &str, resource: &str) -> Result<HashSet<String>, AppError> {
        let path = self.scope_path(pipeline, resource);
        Ok(Self::read_scope(&path)
            .await?
            .map(|scope| scope.ids.into_iter().collect())
            .unwrap_or_default())
    }

    async fn save(&self, pipeline: &str, resource: &str, ids: &[String]) -> Result<(), AppError> {
        let path = self.scope_path(pipeline, resource);
        let mut scope = Self::read_scope(&path).await?.unwrap_or_else(|| ScopeFile {
            pipeline: pipeline.to_string(),
            resource: resource.to_string(),
            updated_at: Utc::now(),
            ids: Vec::new(),
        });

        let mut known: HashSet<String> = scope.ids.iter().cloned().collect();
        for id in ids {
            if known.insert(id.clone()) {
                scope.ids.push(id.clone());
            }
        }
        scope.updated_at = Utc::now();

        self.write_scope(&path, &scope).await
    }

    async fn reset(&self, pipeline: &str, resource: &str) -> Result<u64, AppError> {
        let path = self.scope_path(pipeline, resource);
        let Some(scope) = Self::read_scope(&path).await? else {
            return Ok(0);
        };
        tokio::fs::remove_file(&path).await.map_err(|e| {
            AppError::CheckpointError(format!("Failed to remove {}: {e}", path.display()))
        })?;
        Ok(scope.ids.len() as u64)
    }

    async fn scopes(&self, pipeline: &str) -> Result<Vec<CheckpointSummary>, AppError> {
        let mut dir = match tokio::fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => {
                return Err(AppError::CheckpointError(format!(
                    "Failed to list {}: {e}",
                    self.root.display()
                )));
            }
        };

        let mut summaries = Vec::new();
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| AppError::CheckpointError(e.to_string()))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(scope) = Self::read_scope(&path).await?
                && scope.pipeline == pipeline
            {
                summaries.push(CheckpointSummary {
                    pipeline: scope.pipeline,
                    resource: scope.resource,
                    entries: scope.ids.len() as u64,
                    last_updated: Some(scope.updated_at),
                });
            }
        }
        summaries.sort_by(|a, b| a.resource.cmp(&b.resource));
        Ok(summaries)
    }
}
