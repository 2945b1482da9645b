use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A single emitted data item: field name to JSON value.
pub type Record = serde_json::Map<String, serde_json::Value>;

/// How a loader must treat records of a resource relative to earlier runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteDisposition {
    /// Keep prior records, add the new ones.
    Append,
    /// Full refresh: prior records are discarded at the start of each run.
    Replace,
}

impl WriteDisposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            WriteDisposition::Append => "append",
            WriteDisposition::Replace => "replace",
        }
    }
}

impl fmt::Display for WriteDisposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for WriteDisposition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "append" => Ok(WriteDisposition::Append),
            "replace" => Ok(WriteDisposition::Replace),
            _ => Err(format!("Unknown write disposition: {}", s)),
        }
    }
}

/// Static description of a resource: identity, disposition, selection and dependency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceMeta {
    pub name: String,
    pub write_disposition: WriteDisposition,
    /// Whether the resource runs when no explicit selection is made.
    pub selected: bool,
    /// Name of the resource whose output this one consumes.
    pub depends_on: Option<String>,
}

impl ResourceMeta {
    pub fn new(name: impl Into<String>, write_disposition: WriteDisposition) -> Self {
        Self {
            name: name.into(),
            write_disposition,
            selected: true,
            depends_on: None,
        }
    }

    pub fn deselected(mut self) -> Self {
        self.selected = false;
        self
    }

    pub fn depends_on(mut self, name: impl Into<String>) -> Self {
        self.depends_on = Some(name.into());
        self
    }
}

/// Counters collected while a resource runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResourceStats {
    pub name: String,
    /// Work items discovered by the index phase.
    pub candidates: usize,
    /// Work items dropped by the range filter.
    pub filtered_out: usize,
    /// Work items skipped because they were already checkpointed.
    pub skipped: usize,
    /// Deferred fetch tasks submitted.
    pub tasks_submitted: usize,
    pub records_emitted: usize,
}

impl ResourceStats {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

/// Summary of one persisted checkpoint scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointSummary {
    pub pipeline: String,
    pub resource: String,
    pub entries: u64,
    pub last_updated: Option<DateTime<Utc>>,
}

/// Compute a SHA-256 hash of a string, returned as 64-char hex.
pub fn compute_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}
