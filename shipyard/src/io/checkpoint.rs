//! Batch progress checkpoint (`.shipyard/batch-progress.json`).

use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::io::atomic::write_json_atomic;
use crate::io::lock::{FileLock, LockSettings};
use crate::io::pid::pid_alive;

pub const CHECKPOINT_SCHEMA_VERSION: u32 = 1;

/// Persisted bookkeeping for an in-progress batch run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Checkpoint {
    pub schema_version: u32,
    pub session_id: String,
    /// Process that owns the batch.
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub parallel: usize,
    /// Items the batch set out to process, in scheduling order.
    pub queued_items: Vec<String>,
    /// Items a worker is currently running.
    pub current_items: Vec<String>,
    pub completed: Vec<String>,
    pub failed: Vec<String>,
    pub skipped: Vec<String>,
}

impl Checkpoint {
    pub fn new(parallel: usize, queued_items: Vec<String>, now: DateTime<Utc>) -> Self {
        Self {
            schema_version: CHECKPOINT_SCHEMA_VERSION,
            session_id: Uuid::new_v4().to_string(),
            pid: std::process::id(),
            started_at: now,
            updated_at: now,
            parallel,
            queued_items,
            current_items: Vec::new(),
            completed: Vec::new(),
            failed: Vec::new(),
            skipped: Vec::new(),
        }
    }

    /// Queued items with no recorded outcome.
    pub fn outstanding(&self) -> Vec<String> {
        self.queued_items
            .iter()
            .filter(|id| !self.has_outcome(id))
            .cloned()
            .collect()
    }

    pub fn has_outcome(&self, id: &str) -> bool {
        [&self.completed, &self.failed, &self.skipped]
            .iter()
            .any(|list| list.iter().any(|entry| entry == id))
    }

    pub fn staleness(&self, now: DateTime<Utc>, stale_after: Duration) -> CheckpointStaleness {
        if !pid_alive(self.pid) {
            return CheckpointStaleness::OwnerDead;
        }
        let age = now
            .signed_duration_since(self.updated_at)
            .to_std()
            .unwrap_or_default();
        if age > stale_after {
            CheckpointStaleness::Expired
        } else {
            CheckpointStaleness::Active
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointStaleness {
    /// Owner alive and recently updated: another batch is running.
    Active,
    OwnerDead,
    Expired,
}

impl CheckpointStaleness {
    pub fn is_stale(self) -> bool {
        self != CheckpointStaleness::Active
    }
}

/// Load the checkpoint; `Ok(None)` when none exists.
pub fn load_checkpoint(path: &Path) -> Result<Option<Checkpoint>> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err).with_context(|| format!("read checkpoint {}", path.display()));
        }
    };
    let checkpoint: Checkpoint = serde_json::from_str(&contents)
        .with_context(|| format!("parse checkpoint {}", path.display()))?;
    debug!(session = %checkpoint.session_id, pid = checkpoint.pid, "checkpoint loaded");
    Ok(Some(checkpoint))
}

/// Lock-protected atomic checkpoint write.
pub fn write_checkpoint(path: &Path, checkpoint: &Checkpoint, lock: LockSettings) -> Result<()> {
    let _guard = FileLock::acquire(path, lock)?;
    debug!(
        session = %checkpoint.session_id,
        completed = checkpoint.completed.len(),
        failed = checkpoint.failed.len(),
        "writing checkpoint"
    );
    write_json_atomic(path, checkpoint)
}

/// Remove the checkpoint (clean finish or discard). Missing is fine.
pub fn remove_checkpoint(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("remove checkpoint {}", path.display())),
    }
}
