//! Read-only store scan.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, instrument};

use super::{Code, Diagnostic, Fix, Report, Severity};
use crate::compute::ComputeBackend;
use crate::core::artifacts::{consistent_state, missing_for};
use crate::core::deps::DepGraph;
use crate::core::quality::{prd_issues, story_warnings};
use crate::io::checkpoint::load_checkpoint;
use crate::io::config::{Config, load_config};
use crate::io::lock::inspect;
use crate::io::paths::PROMPT_NAMES;
use crate::io::prompt::{check_template, missing_overrides};
use crate::io::store::{Store, StoreError};
use crate::item::Item;

/// Scan the store. Returns the report and the configuration the scan used
/// (defaults when the file is invalid).
#[instrument(skip_all)]
pub fn scan(
    store: &Store,
    backend: Option<&dyn ComputeBackend>,
    now: DateTime<Utc>,
) -> (Report, Config) {
    let mut report = Report::default();
    let config = scan_config(store, &mut report);
    scan_prompts(store, &mut report);
    let items = scan_items(store, &config, &mut report);
    scan_dependencies(&items, &mut report);
    scan_index(store, &items, now, &mut report);
    scan_checkpoint(store, &config, now, &mut report);
    scan_locks(store, &config, &mut report);
    if let Some(backend) = backend {
        scan_backend(backend, now, &mut report);
    }
    debug!(
        errors = report.errors(),
        warnings = report.warnings(),
        "doctor scan finished"
    );
    (report, config)
}

fn scan_config(store: &Store, report: &mut Report) -> Config {
    match load_config(&store.paths().config()) {
        Ok(config) => config,
        Err(err) => {
            report.push(Diagnostic::new(
                Code::ConfigInvalid,
                Severity::Error,
                "config",
                format!("{err:#}"),
            ));
            Config::default()
        }
    }
}

fn scan_prompts(store: &Store, report: &mut Report) {
    let paths = store.paths();
    if !paths.store_dir().is_dir() {
        return;
    }
    let missing = missing_overrides(paths);
    if !missing.is_empty() {
        report.push(
            Diagnostic::new(
                Code::MissingPromptTemplates,
                Severity::Warning,
                "prompts",
                format!("no template file for: {}", missing.join(", ")),
            )
            .fixable(Fix::WriteDefaultPrompts),
        );
    }
    for name in PROMPT_NAMES {
        let path = paths.prompt_override(name);
        let Ok(source) = fs::read_to_string(&path) else {
            continue;
        };
        if let Err(err) = check_template(&source) {
            report.push(Diagnostic::new(
                Code::PromptTemplateInvalid,
                Severity::Error,
                "prompts",
                format!("{}: {err}", paths.relative(&path)),
            ));
        }
    }
}

/// Per-item checks. Returns the items that could be read.
fn scan_items(store: &Store, config: &Config, report: &mut Report) -> Vec<Item> {
    let loaded = match store.load_all() {
        Ok(loaded) => loaded,
        Err(err) => {
            report.push(Diagnostic::new(
                Code::ItemIoError,
                Severity::Error,
                "items",
                err.to_string(),
            ));
            return Vec::new();
        }
    };

    let mut items = Vec::new();
    for (id, result) in loaded {
        let item = match result {
            Ok(item) => item,
            Err(err) => {
                report.push(item_read_diagnostic(&id, &err));
                continue;
            }
        };
        scan_item_artifacts(store, &item, report);
        scan_backlog(store, config, &item, report);
        items.push(item);
    }
    items
}

fn item_read_diagnostic(id: &str, err: &StoreError) -> Diagnostic {
    let code = match err {
        StoreError::Parse { .. } => Code::ItemUnreadable,
        StoreError::Schema { .. } => Code::ItemInvalid,
        StoreError::NotFound { .. } | StoreError::Io { .. } | StoreError::Lock(_) => {
            Code::ItemIoError
        }
    };
    Diagnostic::new(code, Severity::Error, id, err.to_string())
}

fn scan_item_artifacts(store: &Store, item: &Item, report: &mut Report) {
    let presence = match store.artifact_presence(item) {
        Ok(presence) => presence,
        Err(err) => {
            report.push(Diagnostic::new(
                Code::ItemIoError,
                Severity::Error,
                &item.id,
                err.to_string(),
            ));
            return;
        }
    };
    let missing = missing_for(item.state, &presence);
    if missing.is_empty() {
        return;
    }
    let to = consistent_state(item.state, &presence);
    let names: Vec<String> = missing.iter().map(ToString::to_string).collect();
    report.push(
        Diagnostic::new(
            Code::StateArtifactMismatch,
            Severity::Error,
            &item.id,
            format!(
                "state {} requires {} (would downgrade to {to})",
                item.state,
                names.join(", ")
            ),
        )
        .fixable(Fix::DowngradeState {
            item_id: item.id.clone(),
            to,
        }),
    );
}

fn scan_backlog(store: &Store, config: &Config, item: &Item, report: &mut Report) {
    let doc = match store.try_read_prd(&item.id) {
        Ok(Some(doc)) => doc,
        Ok(None) => return,
        Err(err) => {
            report.push(Diagnostic::new(
                Code::BacklogInvalid,
                Severity::Error,
                &item.id,
                err.to_string(),
            ));
            return;
        }
    };
    for issue in prd_issues(&doc, &item.id, config.quality.min_acceptance_criteria) {
        report.push(Diagnostic::new(
            Code::BacklogInvalid,
            Severity::Error,
            &item.id,
            issue,
        ));
    }
    for warning in story_warnings(&doc) {
        report.push(Diagnostic::new(
            Code::StoryQuality,
            Severity::Warning,
            &item.id,
            warning,
        ));
    }
}

fn scan_dependencies(items: &[Item], report: &mut Report) {
    let graph = DepGraph::from_items(items);
    for cycle in graph.cycles() {
        let first = cycle.first().cloned().unwrap_or_default();
        let mut path = cycle.clone();
        path.push(first.clone());
        report.push(Diagnostic::new(
            Code::DependencyCycle,
            Severity::Error,
            first,
            format!("dependency cycle {}", path.join(" -> ")),
        ));
    }
    for (id, dep) in graph.dangling() {
        report.push(Diagnostic::new(
            Code::DanglingDependency,
            Severity::Warning,
            id,
            format!("depends on unknown item {dep}"),
        ));
    }
}

fn scan_index(store: &Store, items: &[Item], now: DateTime<Utc>, report: &mut Report) {
    let index = match store.read_index() {
        Ok(index) => index,
        Err(StoreError::NotFound { .. }) => {
            if store.paths().store_dir().is_dir() {
                report.push(
                    Diagnostic::new(
                        Code::IndexMissing,
                        Severity::Warning,
                        "index",
                        "index.json is missing",
                    )
                    .fixable(Fix::RebuildIndex),
                );
            }
            return;
        }
        Err(err) => {
            report.push(
                Diagnostic::new(Code::IndexUnreadable, Severity::Warning, "index", err.to_string())
                    .fixable(Fix::RebuildIndex),
            );
            return;
        }
    };

    let indexed: BTreeMap<&str, _> = index
        .items
        .iter()
        .map(|entry| (entry.id.as_str(), entry.state))
        .collect();
    let actual: BTreeMap<&str, _> = items.iter().map(|item| (item.id.as_str(), item.state)).collect();
    let indexed_ids: BTreeSet<&str> = indexed.keys().copied().collect();
    let actual_ids: BTreeSet<&str> = actual.keys().copied().collect();

    let mut problems = Vec::new();
    for id in actual_ids.difference(&indexed_ids) {
        problems.push(format!("{id} not indexed"));
    }
    for id in indexed_ids.difference(&actual_ids) {
        problems.push(format!("{id} indexed but absent"));
    }
    for (id, state) in &actual {
        if let Some(indexed_state) = indexed.get(id)
            && indexed_state != state
        {
            problems.push(format!("{id} indexed as {indexed_state}, actually {state}"));
        }
    }
    if !problems.is_empty() {
        debug!(generated_at = %index.generated_at, %now, "index is stale");
        report.push(
            Diagnostic::new(Code::IndexStale, Severity::Warning, "index", problems.join("; "))
                .fixable(Fix::RebuildIndex),
        );
    }
}

fn scan_checkpoint(store: &Store, config: &Config, now: DateTime<Utc>, report: &mut Report) {
    let checkpoint = match load_checkpoint(&store.paths().checkpoint()) {
        Ok(Some(checkpoint)) => checkpoint,
        Ok(None) => return,
        Err(err) => {
            report.push(
                Diagnostic::new(
                    Code::CheckpointUnreadable,
                    Severity::Warning,
                    "checkpoint",
                    format!("{err:#}"),
                )
                .fixable(Fix::RemoveCheckpoint),
            );
            return;
        }
    };
    let stale_after = Duration::from_secs(config.doctor.checkpoint_stale_secs);
    let staleness = checkpoint.staleness(now, stale_after);
    if staleness.is_stale() {
        report.push(
            Diagnostic::new(
                Code::CheckpointStale,
                Severity::Warning,
                "checkpoint",
                format!(
                    "batch {} (pid {}) is {staleness:?}; {} of {} item(s) outstanding",
                    checkpoint.session_id,
                    checkpoint.pid,
                    checkpoint.outstanding().len(),
                    checkpoint.queued_items.len()
                ),
            )
            .fixable(Fix::RemoveCheckpoint),
        );
    }
}

fn scan_locks(store: &Store, config: &Config, report: &mut Report) {
    let locks = match store.lock_files() {
        Ok(locks) => locks,
        Err(err) => {
            report.push(Diagnostic::new(
                Code::ItemIoError,
                Severity::Warning,
                "locks",
                err.to_string(),
            ));
            return;
        }
    };
    let stale_after = config.lock.settings().stale_after;
    for path in locks {
        let (staleness, seen) = inspect(&path, stale_after);
        if !staleness.is_stale() {
            continue;
        }
        let holder = seen
            .map(|info| info.pid)
            .map_or_else(|| "unknown holder".to_string(), |pid| format!("pid {pid}"));
        report.push(
            Diagnostic::new(
                Code::StaleLock,
                Severity::Warning,
                store.paths().relative(&path),
                format!("lock is {staleness:?} ({holder})"),
            )
            .fixable(Fix::RemoveLock { path }),
        );
    }
}

fn scan_backend(backend: &dyn ComputeBackend, now: DateTime<Utc>, report: &mut Report) {
    if let Err(err) = backend.check() {
        report.push(Diagnostic::new(
            Code::BackendUnreachable,
            Severity::Error,
            backend.name(),
            err.to_string(),
        ));
        return;
    }
    match backend.list_orphans(now) {
        Ok(orphans) => {
            for orphan in orphans {
                report.push(
                    Diagnostic::new(
                        Code::OrphanedResource,
                        Severity::Warning,
                        backend.name(),
                        format!(
                            "{} ({}, age {}s)",
                            orphan.name, orphan.reason, orphan.age_secs
                        ),
                    )
                    .fixable(Fix::TerminateResource { name: orphan.name }),
                );
            }
        }
        Err(err) => report.push(Diagnostic::new(
            Code::BackendUnreachable,
            Severity::Error,
            backend.name(),
            err.to_string(),
        )),
    }
}
