//! Append-only progress records (`items/<id>/progress.log`, JSON lines).

use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::core::states::Phase;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressEvent {
    PhaseStarted,
    PhaseSkipped,
    PhaseSucceeded,
    PhaseFailed,
    IterationStarted,
    StoryCompleted,
    VerificationFailed,
    StoryReverted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub timestamp: DateTime<Utc>,
    pub phase: Phase,
    pub iteration: Option<u32>,
    pub story_id: Option<String>,
    pub event: ProgressEvent,
    pub message: String,
}

impl ProgressRecord {
    pub fn new(phase: Phase, event: ProgressEvent, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            phase,
            iteration: None,
            story_id: None,
            event,
            message: message.into(),
        }
    }

    pub fn iteration(mut self, iteration: u32) -> Self {
        self.iteration = Some(iteration);
        self
    }

    pub fn story(mut self, story_id: impl Into<String>) -> Self {
        self.story_id = Some(story_id.into());
        self
    }
}

/// Append one record and fsync. Never rewrites earlier lines.
pub fn append_progress(path: &Path, record: &ProgressRecord) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create progress dir {}", parent.display()))?;
    }
    let mut line = serde_json::to_string(record).context("serialize progress record")?;
    line.push('\n');
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open progress log {}", path.display()))?;
    file.write_all(line.as_bytes())
        .with_context(|| format!("append progress log {}", path.display()))?;
    file.sync_all()
        .with_context(|| format!("fsync progress log {}", path.display()))?;
    Ok(())
}

/// Read all records, skipping (and warning about) malformed lines such as a
/// torn final line after a crash.
pub fn read_progress(path: &Path) -> Result<Vec<ProgressRecord>> {
    let file = match fs::File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err).with_context(|| format!("open {}", path.display())),
    };
    let mut records = Vec::new();
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("read {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(&line) {
            Ok(record) => records.push(record),
            Err(err) => warn!(line = idx + 1, err = %err, "skipping malformed progress record"),
        }
    }
    Ok(records)
}

/// Highest iteration number recorded for a phase (0 if none).
pub fn last_iteration(records: &[ProgressRecord], phase: Phase) -> u32 {
    records
        .iter()
        .filter(|record| record.phase == phase)
        .filter_map(|record| record.iteration)
        .max()
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_preserve_earlier_records() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("item").join("progress.log");
        append_progress(
            &path,
            &ProgressRecord::new(Phase::Implement, ProgressEvent::IterationStarted, "go").iteration(1),
        )
        .expect("first");
        append_progress(
            &path,
            &ProgressRecord::new(Phase::Implement, ProgressEvent::StoryCompleted, "done")
                .iteration(1)
                .story("US-001"),
        )
        .expect("second");

        let records = read_progress(&path).expect("read");
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].story_id.as_deref(), Some("US-001"));
        assert_eq!(last_iteration(&records, Phase::Implement), 1);
    }

    #[test]
    fn torn_last_line_is_skipped() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("progress.log");
        append_progress(
            &path,
            &ProgressRecord::new(Phase::Research, ProgressEvent::PhaseStarted, "start"),
        )
        .expect("append");
        let mut file = OpenOptions::new().append(true).open(&path).expect("open");
        file.write_all(b"{\"timestamp\":").expect("torn");
        assert_eq!(read_progress(&path).expect("read").len(), 1);
    }
}
