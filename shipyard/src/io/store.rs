//! Durable item store: records, backlog documents and the derived index.
//!
//! Reads keep four failure modes apart (absent, unparseable, schema-invalid,
//! I/O) because the doctor must never mistake a permission error for a
//! missing item. Writes validate first, take the record's own lock, then
//! replace the file atomically.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::backlog::Backlog;
use crate::core::artifacts::{Artifact, ArtifactPresence};
use crate::core::migrate::upgrade_item;
use crate::io::atomic::write_json_atomic;
use crate::io::lock::{FileLock, LockError, LockSettings};
use crate::io::paths::StorePaths;
use crate::io::schema::{item_schema_errors, prd_schema_errors};
use crate::item::{Item, ItemState, format_item_id, item_number, validate_item_id};

pub const INDEX_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {path}")]
    NotFound { path: PathBuf },
    #[error("unparseable {path}: {message}")]
    Parse { path: PathBuf, message: String },
    #[error("schema validation failed for {path}: {}", .errors.join("; "))]
    Schema { path: PathBuf, errors: Vec<String> },
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Lock(#[from] LockError),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    fn io(path: &Path, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::NotFound {
            StoreError::NotFound {
                path: path.to_path_buf(),
            }
        } else {
            StoreError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    }

    fn schema(path: &Path, errors: Vec<String>) -> Self {
        StoreError::Schema {
            path: path.to_path_buf(),
            errors,
        }
    }
}

/// Denormalized projection of one item; never authoritative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub id: String,
    pub state: ItemState,
    pub title: String,
    pub depends_on: Vec<String>,
}

impl From<&Item> for IndexEntry {
    fn from(item: &Item) -> Self {
        Self {
            id: item.id.clone(),
            state: item.state,
            title: item.title.clone(),
            depends_on: item.depends_on.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Index {
    pub schema_version: u32,
    pub generated_at: DateTime<Utc>,
    pub items: Vec<IndexEntry>,
}

/// Handle to the `.shipyard/` store of one repository.
#[derive(Debug, Clone)]
pub struct Store {
    paths: StorePaths,
    lock: LockSettings,
}

impl Store {
    pub fn new(paths: StorePaths, lock: LockSettings) -> Self {
        Self { paths, lock }
    }

    pub fn paths(&self) -> &StorePaths {
        &self.paths
    }

    pub fn lock_settings(&self) -> LockSettings {
        self.lock
    }

    /// Read an item; absent is `StoreError::NotFound`.
    pub fn read_item(&self, id: &str) -> Result<Item, StoreError> {
        let path = self.paths.item_file(id);
        let raw = fs::read_to_string(&path).map_err(|err| StoreError::io(&path, err))?;
        parse_item(&path, &raw)
    }

    /// Read an item; absent is `Ok(None)`, every other failure stays an error.
    pub fn try_read_item(&self, id: &str) -> Result<Option<Item>, StoreError> {
        match self.read_item(id) {
            Ok(item) => Ok(Some(item)),
            Err(StoreError::NotFound { .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Validate, lock, and atomically replace an item record. Refreshes the index.
    #[instrument(skip_all, fields(id = %item.id, state = %item.state))]
    pub fn write_item(&self, item: &Item) -> Result<(), StoreError> {
        let path = self.paths.item_file(&item.id);
        let value = serde_json::to_value(item).map_err(|err| StoreError::Parse {
            path: path.clone(),
            message: err.to_string(),
        })?;
        let mut errors = item_schema_errors(&value);
        errors.extend(item.semantic_errors());
        if !errors.is_empty() {
            return Err(StoreError::schema(&path, errors));
        }
        {
            let _guard = FileLock::acquire(&path, self.lock)?;
            write_json_atomic(&path, item).map_err(|err| anyhow_to_io(&path, err))?;
        }
        debug!("item written");
        if let Err(err) = self.refresh_index_entry(item) {
            warn!(err = %err, "index refresh failed; doctor will rebuild it");
        }
        Ok(())
    }

    /// All item ids with a directory under `items/`, sorted.
    pub fn list_item_ids(&self) -> Result<Vec<String>, StoreError> {
        let dir = self.paths.items_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(StoreError::io(&dir, err)),
        };
        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| StoreError::io(&dir, err))?;
            let is_dir = entry
                .file_type()
                .map_err(|err| StoreError::io(&entry.path(), err))?
                .is_dir();
            if is_dir {
                ids.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Read every item, keeping per-item failures separate.
    pub fn load_all(&self) -> Result<Vec<(String, Result<Item, StoreError>)>, StoreError> {
        Ok(self
            .list_item_ids()?
            .into_iter()
            .map(|id| {
                let item = self.read_item(&id);
                (id, item)
            })
            .collect())
    }

    /// Allocate the next sequential id and write a fresh `idea` item.
    pub fn create_item(&self, title: &str, now: DateTime<Utc>) -> anyhow::Result<Item> {
        self.create_item_with(title, now, |_| {})
    }

    /// Allocate the next item number, let `fill` complete the record, then
    /// write it once. Numbering holds the `items` lock and the directory is
    /// claimed with `create_dir`, so two creators never share a number.
    #[instrument(skip(self, now, fill))]
    pub fn create_item_with(
        &self,
        title: &str,
        now: DateTime<Utc>,
        fill: impl FnOnce(&mut Item),
    ) -> anyhow::Result<Item> {
        let items_dir = self.paths.items_dir();
        fs::create_dir_all(&items_dir).map_err(|err| StoreError::io(&items_dir, err))?;
        let _numbering = FileLock::acquire(&items_dir, self.lock)?;

        let mut next = self
            .list_item_ids()?
            .iter()
            .filter_map(|id| item_number(id))
            .max()
            .unwrap_or(0)
            + 1;
        let id = loop {
            let id = format_item_id(next, title);
            validate_item_id(&id)?;
            let dir = self.paths.item_dir(&id);
            match fs::create_dir(&dir) {
                Ok(()) => break id,
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    debug!(id = %id, "item directory already claimed");
                    next += 1;
                }
                Err(err) => return Err(StoreError::io(&dir, err).into()),
            }
        };

        let mut item = Item::new(id, title.trim(), now);
        fill(&mut item);
        if let Err(err) = self.write_item(&item) {
            let dir = self.paths.item_dir(&item.id);
            if let Err(cleanup) = fs::remove_dir(&dir) {
                warn!(dir = %dir.display(), err = %cleanup, "could not release item directory");
            }
            return Err(err.into());
        }
        Ok(item)
    }

    /// Resolve operator input: a full id, a bare number, or a unique slug prefix.
    pub fn resolve_id(&self, input: &str) -> anyhow::Result<String> {
        let ids = self.list_item_ids()?;
        resolve_id_in(&ids, input)
    }

    pub fn read_prd(&self, id: &str) -> Result<Backlog, StoreError> {
        let path = self.paths.prd(id);
        let raw = fs::read_to_string(&path).map_err(|err| StoreError::io(&path, err))?;
        parse_prd(&path, &raw)
    }

    pub fn try_read_prd(&self, id: &str) -> Result<Option<Backlog>, StoreError> {
        match self.read_prd(id) {
            Ok(doc) => Ok(Some(doc)),
            Err(StoreError::NotFound { .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    #[instrument(skip_all, fields(id = %doc.id))]
    pub fn write_prd(&self, item_id: &str, doc: &Backlog) -> Result<(), StoreError> {
        let path = self.paths.prd(item_id);
        let value = serde_json::to_value(doc).map_err(|err| StoreError::Parse {
            path: path.clone(),
            message: err.to_string(),
        })?;
        let mut errors = prd_schema_errors(&value);
        errors.extend(doc.structural_errors());
        if !errors.is_empty() {
            return Err(StoreError::schema(&path, errors));
        }
        let _guard = FileLock::acquire(&path, self.lock)?;
        write_json_atomic(&path, doc).map_err(|err| anyhow_to_io(&path, err))
    }

    /// Which artifacts exist for an item (file existence plus the PR reference).
    pub fn artifact_presence(&self, item: &Item) -> Result<ArtifactPresence, StoreError> {
        let exists = |artifact: Artifact| -> Result<bool, StoreError> {
            match self.paths.artifact(&item.id, artifact) {
                Some(path) => path
                    .try_exists()
                    .map_err(|err| StoreError::io(&path, err)),
                None => Ok(false),
            }
        };
        Ok(ArtifactPresence {
            research: exists(Artifact::Research)?,
            plan: exists(Artifact::Plan)?,
            prd: exists(Artifact::Prd)?,
            pr_reference: item.has_pr_reference(),
        })
    }

    pub fn read_index(&self) -> Result<Index, StoreError> {
        let path = self.paths.index();
        let raw = fs::read_to_string(&path).map_err(|err| StoreError::io(&path, err))?;
        serde_json::from_str(&raw).map_err(|err| StoreError::Parse {
            path,
            message: err.to_string(),
        })
    }

    pub fn write_index(&self, index: &Index) -> Result<(), StoreError> {
        let path = self.paths.index();
        let _guard = FileLock::acquire(&path, self.lock)?;
        write_json_atomic(&path, index).map_err(|err| anyhow_to_io(&path, err))
    }

    /// Index computed from the readable items on disk.
    pub fn compute_index(&self, now: DateTime<Utc>) -> Result<Index, StoreError> {
        let mut items = Vec::new();
        for (id, result) in self.load_all()? {
            match result {
                Ok(item) => items.push(IndexEntry::from(&item)),
                Err(err) => debug!(id, err = %err, "skipping unreadable item in index"),
            }
        }
        Ok(Index {
            schema_version: INDEX_SCHEMA_VERSION,
            generated_at: now,
            items,
        })
    }

    /// Regenerate `index.json` from a full rescan.
    pub fn rebuild_index(&self) -> Result<Index, StoreError> {
        let index = self.compute_index(Utc::now())?;
        self.write_index(&index)?;
        Ok(index)
    }

    fn refresh_index_entry(&self, item: &Item) -> Result<(), StoreError> {
        let path = self.paths.index();
        let _guard = FileLock::acquire(&path, self.lock)?;
        let mut index = match fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<Index>(&raw) {
                Ok(index) => index,
                Err(_) => {
                    drop(_guard);
                    return self.rebuild_index().map(|_| ());
                }
            },
            Err(err) if err.kind() == io::ErrorKind::NotFound => Index {
                schema_version: INDEX_SCHEMA_VERSION,
                generated_at: Utc::now(),
                items: Vec::new(),
            },
            Err(err) => return Err(StoreError::io(&path, err)),
        };
        let entry = IndexEntry::from(item);
        match index.items.iter_mut().find(|e| e.id == item.id) {
            Some(existing) => *existing = entry,
            None => index.items.push(entry),
        }
        index.items.sort_by(|a, b| a.id.cmp(&b.id));
        index.generated_at = Utc::now();
        write_json_atomic(&path, &index).map_err(|err| anyhow_to_io(&path, err))
    }

    /// Lock files under the store, for stale-lock diagnostics.
    pub fn lock_files(&self) -> Result<Vec<PathBuf>, StoreError> {
        let mut out = Vec::new();
        collect_lock_files(self.paths.store_dir(), &mut out)?;
        out.sort();
        Ok(out)
    }
}

fn collect_lock_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), StoreError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(StoreError::io(dir, err)),
    };
    for entry in entries {
        let entry = entry.map_err(|err| StoreError::io(dir, err))?;
        let path = entry.path();
        if path.is_dir() {
            if entry.file_name() != "backups" {
                collect_lock_files(&path, out)?;
            }
        } else if path.extension().is_some_and(|ext| ext == "lock") {
            out.push(path);
        }
    }
    Ok(())
}

fn anyhow_to_io(path: &Path, err: anyhow::Error) -> StoreError {
    match err.downcast::<io::Error>() {
        Ok(source) => StoreError::Io {
            path: path.to_path_buf(),
            source,
        },
        Err(other) => StoreError::Io {
            path: path.to_path_buf(),
            source: io::Error::other(format!("{other:#}")),
        },
    }
}

/// Parse, upgrade, schema-check and semantically check an item record.
pub fn parse_item(path: &Path, raw: &str) -> Result<Item, StoreError> {
    let value: Value = serde_json::from_str(raw).map_err(|err| StoreError::Parse {
        path: path.to_path_buf(),
        message: err.to_string(),
    })?;
    let (value, _from_version) =
        upgrade_item(value).map_err(|err| StoreError::schema(path, vec![err.to_string()]))?;
    let errors = item_schema_errors(&value);
    if !errors.is_empty() {
        return Err(StoreError::schema(path, errors));
    }
    let item: Item =
        serde_json::from_value(value).map_err(|err| StoreError::schema(path, vec![err.to_string()]))?;
    let errors = item.semantic_errors();
    if !errors.is_empty() {
        return Err(StoreError::schema(path, errors));
    }
    let dir_name = path
        .parent()
        .and_then(Path::file_name)
        .map(|name| name.to_string_lossy().into_owned());
    if let Some(dir_name) = dir_name
        && dir_name != item.id
    {
        return Err(StoreError::schema(
            path,
            vec![format!("id '{}' does not match directory '{dir_name}'", item.id)],
        ));
    }
    Ok(item)
}

pub fn parse_prd(path: &Path, raw: &str) -> Result<Backlog, StoreError> {
    let value: Value = serde_json::from_str(raw).map_err(|err| StoreError::Parse {
        path: path.to_path_buf(),
        message: err.to_string(),
    })?;
    let errors = prd_schema_errors(&value);
    if !errors.is_empty() {
        return Err(StoreError::schema(path, errors));
    }
    let doc: Backlog =
        serde_json::from_value(value).map_err(|err| StoreError::schema(path, vec![err.to_string()]))?;
    let errors = doc.structural_errors();
    if !errors.is_empty() {
        return Err(StoreError::schema(path, errors));
    }
    Ok(doc)
}

/// Resolve `input` against known ids.
pub fn resolve_id_in(ids: &[String], input: &str) -> anyhow::Result<String> {
    let input = input.trim();
    if ids.iter().any(|id| id == input) {
        return Ok(input.to_string());
    }
    let candidates: BTreeSet<&String> = if let Ok(number) = input.parse::<u64>() {
        ids.iter()
            .filter(|id| item_number(id) == Some(number))
            .collect()
    } else {
        ids.iter()
            .filter(|id| {
                id.split_once('-')
                    .is_some_and(|(_, slug)| slug.starts_with(input))
            })
            .collect()
    };
    match candidates.len() {
        0 => Err(anyhow::anyhow!("no item matches '{input}'")),
        1 => Ok(candidates
            .into_iter()
            .next()
            .map(String::clone)
            .unwrap_or_default()),
        _ => Err(anyhow::anyhow!(
            "'{input}' is ambiguous: {}",
            candidates
                .into_iter()
                .map(String::as_str)
                .collect::<Vec<_>>()
                .join(", ")
        )),
    }
}
