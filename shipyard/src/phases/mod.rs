//! Phase executors: precondition, agent invocation, artifact validation, transition.
//!
//! Every executor follows the same contract. A failure never advances state:
//! the item keeps its state, gets `last_error`, and the phase can be re-run.
//! Success clears `last_error` and moves the item along the workflow graph.

pub mod complete;
pub mod implement;
pub mod plan;
pub mod pr;
pub mod research;
pub mod tools;

use std::fs;
use std::io;
use std::path::Path;
use std::sync::RwLock;

use chrono::Utc;
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::agent::{AgentRequest, AgentResult, CompletionReason};
use crate::backlog::Backlog;
use crate::compute::{BackendError, ComputeBackend};
use crate::core::artifacts::missing_for;
use crate::core::states::{Phase, TransitionError, check_transition, next_phase};
use crate::interrupt::Interrupt;
use crate::io::config::Config;
use crate::io::gates::GateRunner;
use crate::io::git::Git;
use crate::io::progress_log::{ProgressEvent, ProgressRecord, append_progress};
use crate::io::prompt::{PromptContext, PromptEngine};
use crate::io::review::ReviewHost;
use crate::io::snapshot::{RepoSnapshot, StoreGuard};
use crate::io::store::{Store, StoreError};
use crate::item::{Item, ItemState};

#[derive(Debug, Error)]
pub enum PhaseError {
    #[error("precondition failed: {0}")]
    Precondition(String),
    #[error("agent did not complete ({reason}): {detail}")]
    Agent {
        reason: CompletionReason,
        detail: String,
    },
    #[error("required artifact missing: {0}")]
    ArtifactMissing(String),
    #[error("quality check failed: {}", .0.join("; "))]
    Quality(Vec<String>),
    #[error("tool '{tool}' is not permitted during {phase}")]
    ToolNotPermitted { tool: String, phase: Phase },
    #[error("files changed outside the phase write scope: {}", .0.join(", "))]
    ScopeViolation(Vec<String>),
    #[error("stopped after {0} iteration(s) with stories still pending")]
    MaxIterations(u32),
    #[error("{message} (hint: {hint})")]
    Vcs { message: String, hint: String },
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("review request #{number} is not merged yet")]
    AwaitingMerge { number: u64 },
    #[error("interrupted")]
    Interrupted,
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("phase worker panicked: {0}")]
    Panicked(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PhaseError {
    /// Whether re-running the phase may succeed without repair or operator changes.
    pub fn is_retryable(&self) -> bool {
        match self {
            PhaseError::Precondition(_) | PhaseError::Transition(_) | PhaseError::Panicked(_) => {
                false
            }
            PhaseError::Store(err) => matches!(err, StoreError::Io { .. } | StoreError::Lock(_)),
            PhaseError::Backend(err) => matches!(
                err,
                BackendError::Provisioning { .. }
                    | BackendError::Unreachable { .. }
                    | BackendError::Command(_)
            ),
            _ => true,
        }
    }

    /// Failures that belong in the item's `last_error`. A store failure may
    /// mean the record itself cannot be written.
    fn records_on_item(&self) -> bool {
        !matches!(self, PhaseError::Store(_))
    }

    pub fn vcs(message: impl Into<String>, hint: impl Into<String>) -> Self {
        PhaseError::Vcs {
            message: message.into(),
            hint: hint.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeKind {
    /// The phase ran (agent or checks) and the item was written.
    Advanced,
    /// Required artifacts already existed; no agent call.
    Skipped,
    /// Dry run: preconditions checked, nothing executed.
    DryRun,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseOutcome {
    pub item_id: String,
    pub phase: Phase,
    pub from: ItemState,
    pub to: ItemState,
    pub kind: OutcomeKind,
    pub agent_invoked: bool,
    pub message: String,
}

/// Snapshot taken before a scope-restricted agent call.
pub(crate) struct ScopeCheck {
    guard: StoreGuard,
    before: RepoSnapshot,
}

/// Handles shared by every phase executor. `Sync`, so batch workers share one.
pub struct PhaseContext<'a> {
    pub store: &'a Store,
    pub config: &'a Config,
    pub backend: &'a dyn ComputeBackend,
    pub review: &'a dyn ReviewHost,
    pub gates: &'a dyn GateRunner,
    pub interrupt: &'a Interrupt,
    pub git: Git,
    pub prompts: PromptEngine,
    pub dry_run: bool,
    /// Phases that touch the working tree take this exclusively; scope-checked
    /// phases share it so their before/after snapshots see no foreign writes.
    worktree: RwLock<()>,
}

impl<'a> PhaseContext<'a> {
    pub fn new(
        store: &'a Store,
        config: &'a Config,
        backend: &'a dyn ComputeBackend,
        review: &'a dyn ReviewHost,
        gates: &'a dyn GateRunner,
        interrupt: &'a Interrupt,
    ) -> Self {
        let paths = store.paths();
        Self {
            store,
            config,
            backend,
            review,
            gates,
            interrupt,
            git: Git::new(paths.repo_root()),
            prompts: PromptEngine::new(paths),
            dry_run: false,
            worktree: RwLock::new(()),
        }
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub(crate) fn worktree_shared(&self) -> std::sync::RwLockReadGuard<'_, ()> {
        self.worktree.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn worktree_exclusive(&self) -> std::sync::RwLockWriteGuard<'_, ()> {
        self.worktree.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Branch an item is delivered on.
    pub fn branch_for(&self, item: &Item) -> String {
        item.branch
            .clone()
            .unwrap_or_else(|| format!("{}{}", self.config.branch_prefix, item.id))
    }

    pub(crate) fn prompt_context<'b>(&'b self, item: &'b Item) -> PromptContext<'b> {
        PromptContext::new(item, self.store.paths(), self.config)
    }

    pub(crate) fn progress(&self, item_id: &str, record: ProgressRecord) {
        let path = self.store.paths().progress_log(item_id);
        if let Err(err) = append_progress(&path, &record) {
            warn!(item = item_id, err = %format!("{err:#}"), "progress record not written");
        }
    }

    /// Invoke the agent through the compute backend and vet its result.
    ///
    /// Tool calls are checked against the phase allow-list before the caller
    /// applies any of them.
    pub(crate) fn invoke_agent(
        &self,
        item: &Item,
        phase: Phase,
        prompt: String,
        story_id: Option<&str>,
    ) -> Result<AgentResult, PhaseError> {
        let paths = self.store.paths();
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3fZ").to_string();
        let request = AgentRequest {
            item_id: item.id.clone(),
            phase,
            prompt,
            allowed_tools: phase.allowed_tools().iter().map(|t| t.to_string()).collect(),
            workdir: paths.repo_root().to_path_buf(),
            log_path: paths.agent_log(&item.id, phase, &stamp),
            research_path: paths.research(&item.id),
            plan_path: paths.plan(&item.id),
            branch_name: self.branch_for(item),
            story_id: story_id.map(str::to_string),
        };
        let result = self.backend.execute(&request, self.interrupt)?;
        if result.reason == CompletionReason::Interrupted || self.interrupt.is_set() {
            return Err(PhaseError::Interrupted);
        }
        if !result.reason.is_success() {
            return Err(PhaseError::Agent {
                reason: result.reason,
                detail: format!("see {}", paths.relative(&request.log_path)),
            });
        }
        if !result.malformed_calls.is_empty() {
            return Err(PhaseError::Quality(
                result
                    .malformed_calls
                    .iter()
                    .map(|call| format!("malformed tool call: {call}"))
                    .collect(),
            ));
        }
        tools::ensure_permitted(phase, &result.tool_calls)?;
        Ok(result)
    }

    /// Persist a successful phase: validate the transition and the artifact
    /// table for the target state, clear the error, write atomically.
    pub(crate) fn advance(
        &self,
        mut item: Item,
        phase: Phase,
        to: ItemState,
        agent_invoked: bool,
        message: impl Into<String>,
    ) -> Result<PhaseOutcome, PhaseError> {
        let from = item.state;
        check_transition(from, to)?;
        item.state = to;
        let presence = self.store.artifact_presence(&item)?;
        let missing = missing_for(to, &presence);
        if !missing.is_empty() {
            return Err(PhaseError::ArtifactMissing(
                missing
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", "),
            ));
        }
        item.last_error = None;
        item.updated_at = Utc::now().max(item.created_at);
        self.store.write_item(&item)?;
        let message = message.into();
        self.progress(
            &item.id,
            ProgressRecord::new(phase, ProgressEvent::PhaseSucceeded, message.clone()),
        );
        info!(item = %item.id, %phase, %from, %to, "phase succeeded");
        Ok(PhaseOutcome {
            item_id: item.id,
            phase,
            from,
            to,
            kind: OutcomeKind::Advanced,
            agent_invoked,
            message,
        })
    }

    pub(crate) fn unchanged(
        &self,
        item: &Item,
        phase: Phase,
        kind: OutcomeKind,
        message: impl Into<String>,
    ) -> PhaseOutcome {
        let message = message.into();
        if kind == OutcomeKind::Skipped {
            self.progress(
                &item.id,
                ProgressRecord::new(phase, ProgressEvent::PhaseSkipped, message.clone()),
            );
        }
        PhaseOutcome {
            item_id: item.id.clone(),
            phase,
            from: item.state,
            to: item.state,
            kind,
            agent_invoked: false,
            message,
        }
    }

    /// Snapshot the working tree and guarded store files before a
    /// scope-restricted agent call.
    pub(crate) fn scope_snapshot(&self, item_id: &str, phase: Phase) -> Result<ScopeCheck, PhaseError> {
        let guard = self.store_guard(item_id, phase);
        let before = RepoSnapshot::capture(&self.git, &guard)?;
        Ok(ScopeCheck { guard, before })
    }

    /// The item's own directory, the store config and prompt overrides. Other
    /// items are left out because concurrent batch workers write them.
    fn store_guard(&self, item_id: &str, phase: Phase) -> StoreGuard {
        let paths = self.store.paths();
        let mut allowed = vec![paths.progress_log(item_id)];
        match phase {
            Phase::Research => allowed.push(paths.research(item_id)),
            Phase::Plan => allowed.extend([paths.plan(item_id), paths.prd(item_id)]),
            Phase::Implement | Phase::Pr | Phase::Complete => {}
        }
        StoreGuard::new(
            vec![paths.item_dir(item_id), paths.config(), paths.prompts_dir()],
            allowed,
        )
    }

    /// Fail when anything outside the phase's write scope changed.
    pub(crate) fn check_scope(&self, scope: ScopeCheck) -> Result<(), PhaseError> {
        let after = RepoSnapshot::capture(&self.git, &scope.guard)?;
        let changed = scope.before.changed_paths(&after);
        if changed.is_empty() {
            Ok(())
        } else {
            Err(PhaseError::ScopeViolation(changed))
        }
    }

    pub(crate) fn record_failure(&self, item_id: &str, phase: Phase, err: &PhaseError) {
        self.progress(
            item_id,
            ProgressRecord::new(phase, ProgressEvent::PhaseFailed, err.to_string()),
        );
        if !err.records_on_item() {
            return;
        }
        let result = self.store.read_item(item_id).and_then(|mut item| {
            item.last_error = Some(err.to_string());
            item.updated_at = Utc::now().max(item.created_at);
            self.store.write_item(&item)
        });
        if let Err(write_err) = result {
            warn!(item = item_id, err = %write_err, "could not record phase failure");
        }
    }
}

/// Read an artifact document, `None` when absent.
pub(crate) fn read_artifact(path: &Path) -> Result<Option<String>, PhaseError> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(Some(text)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(anyhow::Error::new(err)
            .context(format!("read {}", path.display()))
            .into()),
    }
}

/// Run one named phase for an item.
#[instrument(skip_all, fields(item = %item_id, %phase, force))]
pub fn run_phase(
    ctx: &PhaseContext<'_>,
    item_id: &str,
    phase: Phase,
    force: bool,
) -> Result<PhaseOutcome, PhaseError> {
    let item = ctx.store.read_item(item_id)?;
    let result = if phase.accepts(item.state) {
        if !ctx.dry_run {
            ctx.progress(
                item_id,
                ProgressRecord::new(
                    phase,
                    ProgressEvent::PhaseStarted,
                    format!("from {}", item.state),
                ),
            );
        }
        match phase {
            Phase::Research => research::run(ctx, item, force),
            Phase::Plan => plan::run(ctx, item, force),
            Phase::Implement => implement::run(ctx, item, force),
            Phase::Pr => pr::run(ctx, item, force),
            Phase::Complete => complete::run(ctx, item),
        }
    } else {
        Err(PhaseError::Precondition(format!(
            "{phase} cannot start from state {}",
            item.state
        )))
    };
    if let Err(err) = &result {
        warn!(err = %err, retryable = err.is_retryable(), "phase failed");
        if !ctx.dry_run {
            ctx.record_failure(item_id, phase, err);
        }
    }
    result
}

/// The phase an item would run next, or `None` when it is done.
pub fn eligible_phase(store: &Store, item: &Item) -> Result<Option<Phase>, StoreError> {
    let backlog_complete = store
        .try_read_prd(&item.id)?
        .as_ref()
        .is_some_and(Backlog::all_done);
    Ok(next_phase(item.state, backlog_complete))
}

/// Run exactly the next eligible phase.
pub fn run_next(
    ctx: &PhaseContext<'_>,
    item_id: &str,
    force: bool,
) -> Result<Option<PhaseOutcome>, PhaseError> {
    let item = ctx.store.read_item(item_id)?;
    match eligible_phase(ctx.store, &item)? {
        Some(phase) => run_phase(ctx, item_id, phase, force).map(Some),
        None => Ok(None),
    }
}

/// Run phases until the item is done, waits in review, or a phase fails.
pub fn run_item(
    ctx: &PhaseContext<'_>,
    item_id: &str,
    force: bool,
) -> Result<Vec<PhaseOutcome>, PhaseError> {
    let mut outcomes: Vec<PhaseOutcome> = Vec::new();
    loop {
        if ctx.interrupt.is_set() {
            return Err(PhaseError::Interrupted);
        }
        let Some(outcome) = run_next(ctx, item_id, force)? else {
            break;
        };
        let stop = outcome.kind == OutcomeKind::DryRun
            || outcome.to == ItemState::InPr
            || outcomes
                .last()
                .is_some_and(|prev| prev.phase == outcome.phase && prev.to == outcome.to);
        outcomes.push(outcome);
        if stop {
            break;
        }
    }
    Ok(outcomes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryability_follows_error_kind() {
        assert!(!PhaseError::Precondition("x".into()).is_retryable());
        assert!(
            !PhaseError::Transition(TransitionError {
                from: ItemState::Done,
                to: ItemState::Idea
            })
            .is_retryable()
        );
        assert!(
            PhaseError::Agent {
                reason: CompletionReason::TimedOut,
                detail: String::new()
            }
            .is_retryable()
        );
        assert!(PhaseError::AwaitingMerge { number: 3 }.is_retryable());
        assert!(PhaseError::vcs("dirty", "commit first").is_retryable());
        assert!(
            !PhaseError::Backend(BackendError::BinaryMissing {
                binary: "multipass".into()
            })
            .is_retryable()
        );
    }
}
