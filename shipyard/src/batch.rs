//! Batch orchestrator: advance many items concurrently, checkpointing each outcome.
//!
//! The coordinator owns the checkpoint and the scheduling decisions. Workers
//! only run one phase for one item and report back over a channel, so no item
//! state is shared in memory; every worker goes through the store.

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use tracing::{info, instrument, warn};

use crate::core::deps::DepGraph;
use crate::core::states::Phase;
use crate::io::checkpoint::{
    Checkpoint, CheckpointStaleness, load_checkpoint, remove_checkpoint, write_checkpoint,
};
use crate::io::store::Store;
use crate::item::{Item, ItemState};
use crate::phases::{PhaseContext, PhaseError, PhaseOutcome, eligible_phase, run_next};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchOptions {
    pub parallel: usize,
    /// Continue a stale checkpoint instead of starting over.
    pub resume: bool,
    /// Re-queue items the resumed checkpoint recorded as failed.
    pub retry_failed: bool,
    pub force: bool,
}

/// Progress notifications for the caller (CLI output).
#[derive(Debug)]
pub enum BatchEvent<'a> {
    Started { item_id: &'a str, phase: Phase },
    Advanced { outcome: &'a PhaseOutcome },
    Failed { item_id: &'a str, error: &'a PhaseError },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub session_id: String,
    pub resumed: bool,
    pub completed: Vec<String>,
    pub failed: Vec<(String, String)>,
    /// Items parked without failing (awaiting review merge, unschedulable).
    pub skipped: Vec<(String, String)>,
    /// Queued items with no outcome yet.
    pub remaining: Vec<String>,
    pub interrupted: bool,
}

/// What a batch would do, without running anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchPlan {
    /// Ready now, with the phase each would run.
    pub ready: Vec<(String, Phase)>,
    /// Waiting on non-terminal dependencies.
    pub waiting: Vec<(String, Vec<String>)>,
    /// On a cycle or depending on a missing item; never scheduled.
    pub blocked: Vec<String>,
}

/// Schedule preview for `batch --dry-run`.
pub fn plan_batch(store: &Store) -> Result<BatchPlan> {
    let items = readable_items(store)?;
    let graph = DepGraph::from_items(items.values());
    let blocked = graph.unschedulable();
    let mut plan = BatchPlan {
        blocked: blocked.iter().cloned().collect(),
        ..BatchPlan::default()
    };
    for item in items.values() {
        if item.state.is_terminal() || blocked.contains(&item.id) {
            continue;
        }
        if graph.is_ready(&item.id) {
            if let Some(phase) = eligible_phase(store, item)? {
                plan.ready.push((item.id.clone(), phase));
            }
        } else {
            let pending = item
                .depends_on
                .iter()
                .filter(|dep| !graph.state(dep).is_some_and(ItemState::is_terminal))
                .cloned()
                .collect();
            plan.waiting.push((item.id.clone(), pending));
        }
    }
    Ok(plan)
}

/// Run the batch until nothing is schedulable, or until interrupted.
#[instrument(skip_all, fields(parallel = options.parallel, resume = options.resume))]
pub fn run_batch<F>(
    ctx: &PhaseContext<'_>,
    options: &BatchOptions,
    mut on_event: F,
) -> Result<BatchReport>
where
    F: FnMut(BatchEvent<'_>),
{
    let store = ctx.store;
    let checkpoint_path = store.paths().checkpoint();
    let lock = store.lock_settings();
    let parallel = options.parallel.max(1);

    let (mut checkpoint, resumed) = open_checkpoint(ctx, options)?;
    checkpoint.parallel = parallel;
    write_checkpoint(&checkpoint_path, &checkpoint, lock)?;
    info!(
        session = %checkpoint.session_id,
        queued = checkpoint.queued_items.len(),
        resumed,
        "batch started"
    );

    let mut skipped: Vec<(String, String)> = Vec::new();
    let mut failures: Vec<(String, String)> = Vec::new();
    let mut last_phase: BTreeMap<String, (Phase, ItemState)> = BTreeMap::new();
    let mut interrupted = false;

    thread::scope(|scope| -> Result<()> {
        let (tx, rx) = mpsc::channel::<(String, Result<Option<PhaseOutcome>, PhaseError>)>();
        let mut running: BTreeSet<String> = BTreeSet::new();

        loop {
            if ctx.interrupt.is_set() {
                interrupted = true;
            }
            if !interrupted {
                let items = readable_items(store)?;
                let graph = DepGraph::from_items(items.values());
                let blocked = graph.unschedulable();
                for id in checkpoint.outstanding() {
                    if running.len() >= parallel {
                        break;
                    }
                    if running.contains(&id) {
                        continue;
                    }
                    let Some(item) = items.get(&id) else {
                        failures.push((id.clone(), "item is missing or unreadable".to_string()));
                        checkpoint.failed.push(id);
                        continue;
                    };
                    if item.state.is_terminal() {
                        checkpoint.completed.push(id);
                        continue;
                    }
                    if blocked.contains(&id) {
                        skipped.push((id.clone(), "dependency cycle or missing dependency".to_string()));
                        checkpoint.skipped.push(id);
                        continue;
                    }
                    if !graph.is_ready(&id) {
                        continue;
                    }
                    let Some(phase) = eligible_phase(store, item)? else {
                        checkpoint.completed.push(id);
                        continue;
                    };
                    on_event(BatchEvent::Started {
                        item_id: &id,
                        phase,
                    });
                    running.insert(id.clone());
                    let tx = tx.clone();
                    let force = options.force;
                    scope.spawn(move || {
                        let result = run_worker(ctx, &id, phase, force);
                        // Receiver outlives every worker inside the scope.
                        let _ = tx.send((id, result));
                    });
                }
                checkpoint.current_items = running.iter().cloned().collect();
                checkpoint.updated_at = Utc::now();
                write_checkpoint(&checkpoint_path, &checkpoint, lock)?;
            }

            if running.is_empty() {
                break;
            }
            let Ok((id, result)) = rx.recv_timeout(Duration::from_millis(250)) else {
                continue;
            };
            running.remove(&id);

            match result {
                Ok(Some(outcome)) => {
                    on_event(BatchEvent::Advanced { outcome: &outcome });
                    let key = (outcome.phase, outcome.to);
                    if outcome.to.is_terminal() {
                        checkpoint.completed.push(id.clone());
                    } else if outcome.to == ItemState::InPr {
                        skipped.push((id.clone(), "awaiting review merge".to_string()));
                        checkpoint.skipped.push(id.clone());
                    } else if last_phase.get(&id) == Some(&key) {
                        let message = format!("{} made no progress", outcome.phase);
                        failures.push((id.clone(), message));
                        checkpoint.failed.push(id.clone());
                    }
                    last_phase.insert(id, key);
                }
                Ok(None) => checkpoint.completed.push(id),
                Err(PhaseError::Interrupted) => {
                    interrupted = true;
                }
                Err(PhaseError::AwaitingMerge { number }) => {
                    skipped.push((id.clone(), format!("review request #{number} not merged")));
                    checkpoint.skipped.push(id);
                }
                Err(err) => {
                    on_event(BatchEvent::Failed {
                        item_id: &id,
                        error: &err,
                    });
                    failures.push((id.clone(), err.to_string()));
                    checkpoint.failed.push(id);
                }
            }
            checkpoint.current_items = running.iter().cloned().collect();
            checkpoint.updated_at = Utc::now();
            write_checkpoint(&checkpoint_path, &checkpoint, lock)?;
        }
        Ok(())
    })?;

    let remaining = checkpoint.outstanding();
    if remaining.is_empty() && checkpoint.failed.is_empty() && !interrupted {
        remove_checkpoint(&checkpoint_path)?;
    } else {
        checkpoint.current_items.clear();
        write_checkpoint(&checkpoint_path, &checkpoint, lock)?;
    }
    info!(
        completed = checkpoint.completed.len(),
        failed = checkpoint.failed.len(),
        remaining = remaining.len(),
        interrupted,
        "batch finished"
    );

    Ok(BatchReport {
        session_id: checkpoint.session_id,
        resumed,
        completed: checkpoint.completed,
        failed: failures,
        skipped,
        remaining,
        interrupted,
    })
}

/// Run the next phase for one item. A panic becomes a recorded failure so the
/// coordinator always hears back from every worker.
fn run_worker(
    ctx: &PhaseContext<'_>,
    item_id: &str,
    phase: Phase,
    force: bool,
) -> Result<Option<PhaseOutcome>, PhaseError> {
    match panic::catch_unwind(AssertUnwindSafe(|| run_next(ctx, item_id, force))) {
        Ok(result) => result,
        Err(payload) => {
            let err = PhaseError::Panicked(panic_message(payload.as_ref()));
            warn!(item = item_id, %phase, err = %err, "worker panicked");
            ctx.record_failure(item_id, phase, &err);
            Err(err)
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Fresh checkpoint, or the stale one when resuming. Refuses to run next to
/// a live batch.
fn open_checkpoint(ctx: &PhaseContext<'_>, options: &BatchOptions) -> Result<(Checkpoint, bool)> {
    let store = ctx.store;
    let path = store.paths().checkpoint();
    let stale_after = Duration::from_secs(ctx.config.doctor.checkpoint_stale_secs);
    let now = Utc::now();

    let existing = match load_checkpoint(&path) {
        Ok(existing) => existing,
        Err(err) if !options.resume => {
            warn!(err = %format!("{err:#}"), "discarding unreadable checkpoint");
            None
        }
        Err(err) => return Err(err).context("resume batch (use --no-resume to start over)"),
    };

    if let Some(mut checkpoint) = existing {
        let staleness = checkpoint.staleness(now, stale_after);
        if staleness == CheckpointStaleness::Active && checkpoint.pid != std::process::id() {
            bail!(
                "batch {} is still running (pid {}); wait for it or run `shipyard doctor --fix` if it is stuck",
                checkpoint.session_id,
                checkpoint.pid
            );
        }
        if options.resume {
            if options.retry_failed {
                let retried = std::mem::take(&mut checkpoint.failed);
                info!(count = retried.len(), "re-queueing failed items");
            }
            checkpoint.pid = std::process::id();
            checkpoint.updated_at = now;
            checkpoint.current_items.clear();
            info!(
                session = %checkpoint.session_id,
                outstanding = checkpoint.outstanding().len(),
                "resuming batch"
            );
            return Ok((checkpoint, true));
        }
        info!(session = %checkpoint.session_id, "discarding previous checkpoint");
    }

    let queued: Vec<String> = readable_items(store)?
        .into_values()
        .filter(|item| !item.state.is_terminal())
        .map(|item| item.id)
        .collect();
    Ok((Checkpoint::new(options.parallel.max(1), queued, now), false))
}

fn readable_items(store: &Store) -> Result<BTreeMap<String, Item>> {
    let mut items = BTreeMap::new();
    for (id, result) in store.load_all()? {
        match result {
            Ok(item) => {
                items.insert(id, item);
            }
            Err(err) => warn!(item = %id, err = %err, "skipping unreadable item"),
        }
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::io::lock::LockSettings;
    use crate::io::paths::StorePaths;

    fn write(store: &Store, id: &str, state: ItemState, deps: &[&str]) {
        let mut item = Item::new(id, id, Utc::now());
        item.state = state;
        item.depends_on = deps.iter().map(|d| d.to_string()).collect();
        store.write_item(&item).expect("write item");
    }

    #[test]
    fn plan_orders_by_dependencies_and_blocks_cycles() {
        let dir = tempdir().expect("tempdir");
        let store = Store::new(StorePaths::new(dir.path()), LockSettings::default());
        write(&store, "001-a", ItemState::Idea, &[]);
        write(&store, "002-b", ItemState::Idea, &["001-a"]);
        write(&store, "003-c", ItemState::Idea, &["004-d"]);
        write(&store, "004-d", ItemState::Idea, &["003-c"]);
        write(&store, "005-e", ItemState::Done, &[]);

        let plan = plan_batch(&store).expect("plan");
        assert_eq!(plan.ready, vec![("001-a".to_string(), Phase::Research)]);
        assert_eq!(
            plan.waiting,
            vec![("002-b".to_string(), vec!["001-a".to_string()])]
        );
        assert_eq!(plan.blocked, vec!["003-c".to_string(), "004-d".to_string()]);
    }
}
