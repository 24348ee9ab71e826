//! Apply fixes for fixable diagnostics inside one backup session.

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use tracing::{info, instrument, warn};

use super::{Fix, Report};
use crate::compute::ComputeBackend;
use crate::core::artifacts::consistent_state;
use crate::io::backup::BackupSession;
use crate::io::checkpoint::remove_checkpoint;
use crate::io::config::Config;
use crate::io::init::write_default_prompts;
use crate::io::lock::remove_stale_lock;
use crate::io::paths::PROMPT_NAMES;
use crate::io::store::Store;
use crate::item::ItemState;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixResult {
    pub fix: Fix,
    /// What was done, or why it failed.
    pub outcome: Result<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepairReport {
    pub results: Vec<FixResult>,
    /// Backup session holding the pre-repair files; `None` when nothing changed.
    pub backup_session: Option<String>,
}

impl RepairReport {
    pub fn applied(&self) -> usize {
        self.results.iter().filter(|r| r.outcome.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.results.iter().filter(|r| r.outcome.is_err()).count()
    }
}

/// Fix every fixable diagnostic in `report`.
///
/// Each fix stands alone: one failure is recorded and the rest still run.
/// The index is rebuilt last so it reflects any state downgrades.
#[instrument(skip_all, fields(fixable = report.fixable().count()))]
pub fn repair(
    store: &Store,
    config: &Config,
    backend: Option<&dyn ComputeBackend>,
    report: &Report,
    now: DateTime<Utc>,
) -> Result<RepairReport> {
    let fixes = ordered_fixes(report);
    let mut session = BackupSession::new(store.paths(), "doctor --fix", now);
    let mut results = Vec::new();
    for fix in fixes {
        let outcome =
            apply(store, config, backend, &mut session, &fix, now).map_err(|err| format!("{err:#}"));
        match &outcome {
            Ok(done) => info!(fix = ?fix, %done, "fix applied"),
            Err(err) => warn!(fix = ?fix, %err, "fix failed"),
        }
        results.push(FixResult { fix, outcome });
    }
    let backup_session = session
        .finalize(config.doctor.backup_retention)
        .context("finalize backup session")?;
    Ok(RepairReport {
        results,
        backup_session,
    })
}

fn ordered_fixes(report: &Report) -> Vec<Fix> {
    let mut fixes: Vec<Fix> = Vec::new();
    let mut rebuild_index = false;
    for fix in report.fixable().filter_map(|d| d.fix.clone()) {
        if fix == Fix::RebuildIndex {
            rebuild_index = true;
        } else if !fixes.contains(&fix) {
            fixes.push(fix);
        }
    }
    let downgrades = fixes
        .iter()
        .any(|fix| matches!(fix, Fix::DowngradeState { .. }));
    if rebuild_index || downgrades {
        fixes.push(Fix::RebuildIndex);
    }
    fixes
}

fn apply(
    store: &Store,
    config: &Config,
    backend: Option<&dyn ComputeBackend>,
    session: &mut BackupSession,
    fix: &Fix,
    now: DateTime<Utc>,
) -> Result<String> {
    let paths = store.paths();
    match fix {
        Fix::DowngradeState { item_id, to } => downgrade(store, session, item_id, *to, now),
        Fix::WriteDefaultPrompts => {
            for name in PROMPT_NAMES {
                let path = paths.prompt_override(name);
                if !path.exists() {
                    session.backup_file(&path)?;
                }
            }
            let written = write_default_prompts(paths, false)?;
            Ok(format!("wrote {} default template(s)", written.len()))
        }
        Fix::RemoveCheckpoint => {
            let path = paths.checkpoint();
            session.backup_file(&path)?;
            remove_checkpoint(&path)?;
            Ok("removed stale batch checkpoint".to_string())
        }
        Fix::RemoveLock { path } => {
            // Lock files are not restorable state; no backup. The scan may be
            // old, so staleness is checked again here.
            let removed = remove_stale_lock(path, config.lock.settings().stale_after)
                .with_context(|| format!("remove {}", path.display()))?;
            if removed {
                Ok(format!("removed {}", paths.relative(path)))
            } else {
                Ok(format!("kept {}: no longer stale", paths.relative(path)))
            }
        }
        Fix::TerminateResource { name } => {
            let backend = backend.ok_or_else(|| anyhow!("no compute backend configured"))?;
            backend.terminate(name)?;
            Ok(format!("terminated {name}"))
        }
        Fix::RebuildIndex => {
            session.backup_file(&paths.index())?;
            let index = store.rebuild_index()?;
            Ok(format!("rebuilt index with {} item(s)", index.items.len()))
        }
    }
}

/// Move an item down to the state its artifacts support. Never upgrades.
fn downgrade(
    store: &Store,
    session: &mut BackupSession,
    item_id: &str,
    target: ItemState,
    now: DateTime<Utc>,
) -> Result<String> {
    let mut item = store.read_item(item_id)?;
    let presence = store.artifact_presence(&item)?;
    let to = consistent_state(item.state, &presence).min(target);
    if to >= item.state {
        return Ok(format!("{item_id} already consistent at {}", item.state));
    }
    session.backup_file(&store.paths().item_file(item_id))?;
    session.backup_file(&store.paths().index())?;
    let from = item.state;
    item.state = to;
    item.last_error = Some(format!("doctor downgraded {from} -> {to}: missing artifacts"));
    item.updated_at = now.max(item.created_at);
    store.write_item(&item)?;
    Ok(format!("{item_id}: {from} -> {to}"))
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::tempdir;

    use super::*;
    use crate::doctor::{Code, scan};
    use crate::io::backup::restore_session;
    use crate::io::lock::LockSettings;
    use crate::io::paths::StorePaths;
    use crate::item::Item;

    #[test]
    fn empty_report_leaves_no_backup_session() {
        let dir = tempdir().expect("tempdir");
        let store = Store::new(StorePaths::new(dir.path()), LockSettings::default());
        let result = repair(&store, &Config::default(), None, &Report::default(), Utc::now())
            .expect("repair");
        assert!(result.results.is_empty());
        assert_eq!(result.backup_session, None);
    }

    /// Planned item whose plan was deleted: downgrade, then restore the
    /// original record byte-for-byte.
    #[test]
    fn downgrade_is_backed_up_and_restorable() {
        let dir = tempdir().expect("tempdir");
        let store = Store::new(StorePaths::new(dir.path()), LockSettings::default());
        let mut item = Item::new("001-a", "a", Utc::now());
        item.state = ItemState::Planned;
        store.write_item(&item).expect("write");
        fs::write(store.paths().research("001-a"), "# research\n").expect("research");
        let original = fs::read(store.paths().item_file("001-a")).expect("read original");

        let (report, config) = scan(&store, None, Utc::now());
        assert_eq!(report.with_code(Code::StateArtifactMismatch).count(), 1);
        let result = repair(&store, &config, None, &report, Utc::now()).expect("repair");
        assert_eq!(result.failed(), 0);
        assert_eq!(
            store.read_item("001-a").expect("read").state,
            ItemState::Researched
        );

        let session = result.backup_session.expect("session kept");
        restore_session(store.paths(), &session).expect("restore");
        let restored = fs::read(store.paths().item_file("001-a")).expect("read restored");
        assert_eq!(restored, original);
    }
}
