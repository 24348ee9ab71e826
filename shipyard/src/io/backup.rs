//! Backup sessions taken before any repair mutates the store.
//!
//! A session directory is only created by the first backed-up file and is only
//! kept if it ends up holding something. Finalized sessions carry a manifest
//! with a SHA-256 per file so restores are verifiable byte-for-byte.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::io::atomic::{write_atomic, write_json_atomic};
use crate::io::paths::StorePaths;

pub const MANIFEST_SCHEMA_VERSION: u32 = 1;
const MANIFEST_FILE: &str = "manifest.json";
const FILES_DIR: &str = "files";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Path relative to the repository root, `/`-separated.
    pub path: String,
    /// False when the file did not exist before the repair (restore deletes it).
    pub existed: bool,
    pub sha256: Option<String>,
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub schema_version: u32,
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub reason: String,
    pub entries: Vec<ManifestEntry>,
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Lazily materialized backup session.
#[derive(Debug)]
pub struct BackupSession {
    paths: StorePaths,
    session_id: String,
    created_at: DateTime<Utc>,
    reason: String,
    dir: Option<PathBuf>,
    entries: Vec<ManifestEntry>,
}

impl BackupSession {
    pub fn new(paths: &StorePaths, reason: impl Into<String>, now: DateTime<Utc>) -> Self {
        let short = Uuid::new_v4().simple().to_string();
        let session_id = format!("{}-{}", now.format("%Y%m%dT%H%M%S%.3fZ"), &short[..8]);
        Self {
            paths: paths.clone(),
            session_id,
            created_at: now,
            reason: reason.into(),
            dir: None,
            entries: Vec::new(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Copy `path` into the session before it is mutated. Repeat calls are no-ops.
    #[instrument(skip_all, fields(session = %self.session_id, path = %path.display()))]
    pub fn backup_file(&mut self, path: &Path) -> Result<()> {
        let rel = self.paths.relative(path);
        if self.entries.iter().any(|entry| entry.path == rel) {
            return Ok(());
        }
        let entry = match fs::read(path) {
            Ok(bytes) => {
                let dest = self.session_dir()?.join(FILES_DIR).join(&rel);
                if let Some(parent) = dest.parent() {
                    fs::create_dir_all(parent)
                        .with_context(|| format!("create backup dir {}", parent.display()))?;
                }
                fs::write(&dest, &bytes)
                    .with_context(|| format!("write backup copy {}", dest.display()))?;
                ManifestEntry {
                    path: rel,
                    existed: true,
                    sha256: Some(sha256_hex(&bytes)),
                    bytes: bytes.len() as u64,
                }
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                self.session_dir()?;
                ManifestEntry {
                    path: rel,
                    existed: false,
                    sha256: None,
                    bytes: 0,
                }
            }
            Err(err) => {
                return Err(err).with_context(|| format!("read {} for backup", path.display()));
            }
        };
        debug!(existed = entry.existed, "backed up");
        self.entries.push(entry);
        Ok(())
    }

    fn session_dir(&mut self) -> Result<PathBuf> {
        if let Some(dir) = &self.dir {
            return Ok(dir.clone());
        }
        let dir = self.paths.backups_dir().join(&self.session_id);
        fs::create_dir_all(&dir)
            .with_context(|| format!("create backup session {}", dir.display()))?;
        self.dir = Some(dir.clone());
        Ok(dir)
    }

    /// Write the manifest and prune old sessions; discard the session if empty.
    ///
    /// Returns the session id when something was kept.
    pub fn finalize(self, retention: usize) -> Result<Option<String>> {
        if self.entries.is_empty() {
            if let Some(dir) = &self.dir {
                let _ = fs::remove_dir_all(dir);
            }
            debug!(session = %self.session_id, "empty backup session discarded");
            return Ok(None);
        }
        let dir = self
            .dir
            .clone()
            .ok_or_else(|| anyhow!("backup session has entries but no directory"))?;
        let manifest = Manifest {
            schema_version: MANIFEST_SCHEMA_VERSION,
            session_id: self.session_id.clone(),
            created_at: self.created_at,
            reason: self.reason,
            entries: self.entries,
        };
        write_json_atomic(&dir.join(MANIFEST_FILE), &manifest)?;
        info!(session = %manifest.session_id, files = manifest.entries.len(), "backup session finalized");
        prune_sessions(&self.paths, retention)?;
        Ok(Some(manifest.session_id))
    }
}

/// Finalized session ids, oldest first.
pub fn list_sessions(paths: &StorePaths) -> Result<Vec<String>> {
    let dir = paths.backups_dir();
    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err).with_context(|| format!("read {}", dir.display())),
    };
    let mut sessions = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("read {}", dir.display()))?;
        if entry.path().join(MANIFEST_FILE).is_file() {
            sessions.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    sessions.sort();
    Ok(sessions)
}

/// Remove the oldest finalized sessions beyond `retention`.
pub fn prune_sessions(paths: &StorePaths, retention: usize) -> Result<Vec<String>> {
    let sessions = list_sessions(paths)?;
    let excess = sessions.len().saturating_sub(retention);
    let mut pruned = Vec::new();
    for id in sessions.into_iter().take(excess) {
        let dir = paths.backups_dir().join(&id);
        fs::remove_dir_all(&dir).with_context(|| format!("prune {}", dir.display()))?;
        debug!(session = %id, "pruned backup session");
        pruned.push(id);
    }
    Ok(pruned)
}

pub fn load_manifest(paths: &StorePaths, session_id: &str) -> Result<Manifest> {
    if session_id.contains(['/', '\\']) || session_id.starts_with('.') {
        bail!("invalid backup session id '{session_id}'");
    }
    let path = paths.backups_dir().join(session_id).join(MANIFEST_FILE);
    let raw = fs::read_to_string(&path)
        .with_context(|| format!("read backup manifest {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parse backup manifest {}", path.display()))
}

/// Restore every file recorded in a session. Returns the restored paths.
#[instrument(skip_all, fields(session = %session_id))]
pub fn restore_session(paths: &StorePaths, session_id: &str) -> Result<Vec<PathBuf>> {
    let manifest = load_manifest(paths, session_id)?;
    let session_dir = paths.backups_dir().join(session_id);
    let mut restored = Vec::new();
    for entry in &manifest.entries {
        if entry.path.split('/').any(|part| part == "..") {
            bail!("manifest path escapes repository: {}", entry.path);
        }
        let target = paths.repo_root().join(&entry.path);
        if !entry.existed {
            match fs::remove_file(&target) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(err).with_context(|| format!("remove {}", target.display()));
                }
            }
            restored.push(target);
            continue;
        }
        let copy = session_dir.join(FILES_DIR).join(&entry.path);
        let bytes = fs::read(&copy).with_context(|| format!("read backup {}", copy.display()))?;
        let actual = sha256_hex(&bytes);
        if entry.sha256.as_deref() != Some(actual.as_str()) {
            warn!(path = %entry.path, "backup copy checksum mismatch");
            bail!("backup copy of {} is corrupt (checksum mismatch)", entry.path);
        }
        write_atomic(&target, &bytes)?;
        restored.push(target);
    }
    info!(files = restored.len(), "backup session restored");
    Ok(restored)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_session_leaves_nothing_behind() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = StorePaths::new(temp.path());
        let session = BackupSession::new(&paths, "noop", Utc::now());
        assert_eq!(session.finalize(10).expect("finalize"), None);
        assert!(!paths.backups_dir().exists());
    }

    /// Backed-up bytes come back exactly after the original is overwritten.
    #[test]
    fn restore_is_byte_for_byte() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = StorePaths::new(temp.path());
        let file = paths.item_file("001-a");
        fs::create_dir_all(file.parent().expect("parent")).expect("mkdir");
        fs::write(&file, b"original\x00bytes").expect("write");

        let mut session = BackupSession::new(&paths, "test", Utc::now());
        session.backup_file(&file).expect("backup");
        session.backup_file(&file).expect("second backup is a no-op");
        let id = session.finalize(10).expect("finalize").expect("kept");

        fs::write(&file, b"mutated").expect("mutate");
        let restored = restore_session(&paths, &id).expect("restore");
        assert_eq!(restored, vec![file.clone()]);
        assert_eq!(fs::read(&file).expect("read"), b"original\x00bytes");
    }

    #[test]
    fn newly_created_file_is_removed_on_restore() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = StorePaths::new(temp.path());
        let file = paths.index();
        let mut session = BackupSession::new(&paths, "test", Utc::now());
        session.backup_file(&file).expect("backup absent");
        let id = session.finalize(10).expect("finalize").expect("kept");
        fs::write(&file, b"{}").expect("create");
        restore_session(&paths, &id).expect("restore");
        assert!(!file.exists());
    }

    #[test]
    fn prune_keeps_newest_sessions() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = StorePaths::new(temp.path());
        let file = temp.path().join("f.txt");
        fs::write(&file, b"x").expect("write");
        let base = Utc::now();
        let mut kept = Vec::new();
        for offset in 0..4 {
            let mut session =
                BackupSession::new(&paths, "test", base + chrono::Duration::seconds(offset));
            session.backup_file(&file).expect("backup");
            kept.push(session.finalize(2).expect("finalize").expect("kept"));
        }
        assert_eq!(list_sessions(&paths).expect("list"), kept[2..].to_vec());
    }
}
