//! Repository snapshots used to enforce phase write scope.
//!
//! A snapshot is the porcelain status plus a content hash of every dirty path
//! outside the store, together with a hash of every store file the phase is
//! not allowed to write. Two equal snapshots mean the agent stayed in scope.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

use crate::io::backup::sha256_hex;
use crate::io::git::Git;
use crate::io::paths::STORE_DIR;

/// Store files a phase must leave alone: everything under `roots` except the
/// `allowed` paths and lock files.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreGuard {
    roots: Vec<PathBuf>,
    allowed: Vec<PathBuf>,
}

impl StoreGuard {
    pub fn new(roots: Vec<PathBuf>, allowed: Vec<PathBuf>) -> Self {
        Self { roots, allowed }
    }

    fn watches(&self, path: &Path) -> bool {
        !self.allowed.iter().any(|allowed| allowed == path) && !is_lock_file(path)
    }
}

fn is_lock_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.ends_with(".lock") || name.contains(".lock.stale-"))
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepoSnapshot {
    /// path -> (status code, content hash or `-` when absent/directory)
    entries: BTreeMap<String, (String, String)>,
}

impl RepoSnapshot {
    pub fn capture(git: &Git, guard: &StoreGuard) -> Result<Self> {
        let mut entries = BTreeMap::new();
        if git.is_repo() {
            let prefix = format!("{STORE_DIR}/");
            for entry in git.status_porcelain()? {
                if entry.path.starts_with(&prefix) || entry.path == STORE_DIR {
                    continue;
                }
                let hash = hash_file(&git.workdir().join(&entry.path))?;
                entries.insert(entry.path, (entry.code, hash));
            }
        }

        let mut store_files = Vec::new();
        for root in &guard.roots {
            collect_files(root, &mut store_files)
                .with_context(|| format!("walk {}", root.display()))?;
        }
        for path in store_files.into_iter().filter(|path| guard.watches(path)) {
            let key = path
                .strip_prefix(git.workdir())
                .unwrap_or(&path)
                .to_string_lossy()
                .into_owned();
            entries.insert(key, ("store".to_string(), hash_file(&path)?));
        }
        debug!(entries = entries.len(), "repository snapshot captured");
        Ok(Self { entries })
    }

    /// Paths whose status or content differ between `self` (before) and `after`.
    pub fn changed_paths(&self, after: &RepoSnapshot) -> Vec<String> {
        let mut changed: Vec<String> = Vec::new();
        for (path, state) in &after.entries {
            if self.entries.get(path) != Some(state) {
                changed.push(path.clone());
            }
        }
        for path in self.entries.keys() {
            if !after.entries.contains_key(path) {
                changed.push(path.clone());
            }
        }
        changed.sort();
        changed.dedup();
        changed
    }
}

fn hash_file(path: &Path) -> Result<String> {
    match fs::read(path) {
        Ok(bytes) => Ok(sha256_hex(&bytes)),
        Err(err) if matches!(err.kind(), io::ErrorKind::NotFound | io::ErrorKind::IsADirectory) => {
            Ok("-".to_string())
        }
        Err(err) => Err(err).with_context(|| format!("hash {}", path.display())),
    }
}

/// Every file under `root` (or `root` itself when it is a file).
fn collect_files(root: &Path, out: &mut Vec<PathBuf>) -> io::Result<()> {
    let metadata = match fs::metadata(root) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err),
    };
    if !metadata.is_dir() {
        out.push(root.to_path_buf());
        return Ok(());
    }
    for entry in fs::read_dir(root)? {
        collect_files(&entry?.path(), out)?;
    }
    Ok(())
}
