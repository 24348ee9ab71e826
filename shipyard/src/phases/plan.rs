//! `plan`: produce `plan.md` and the structured backlog document.

use tracing::{info, warn};

use super::{OutcomeKind, PhaseContext, PhaseError, PhaseOutcome, read_artifact, tools};
use crate::backlog::Backlog;
use crate::core::quality::{plan_issues, prd_issues};
use crate::core::states::{Phase, TOOL_SAVE_PRD};
use crate::io::store::StoreError;
use crate::item::{Item, ItemState};

pub fn run(ctx: &PhaseContext<'_>, item: Item, force: bool) -> Result<PhaseOutcome, PhaseError> {
    let paths = ctx.store.paths();
    let plan_path = paths.plan(&item.id);
    let min_criteria = ctx.config.quality.min_acceptance_criteria;

    if !force && existing_plan_is_valid(ctx, &item, min_criteria)? {
        info!(item = %item.id, "plan already present");
        if ctx.dry_run {
            return Ok(ctx.unchanged(
                &item,
                Phase::Plan,
                OutcomeKind::DryRun,
                "plan.md and prd.json present; would advance",
            ));
        }
        if item.state == ItemState::Researched {
            return finish(ctx, &item.id, false, "existing plan accepted");
        }
        return Ok(ctx.unchanged(
            &item,
            Phase::Plan,
            OutcomeKind::Skipped,
            "plan.md and prd.json already present",
        ));
    }

    if ctx.dry_run {
        return Ok(ctx.unchanged(
            &item,
            Phase::Plan,
            OutcomeKind::DryRun,
            format!("would invoke agent to write {}", paths.relative(&plan_path)),
        ));
    }

    let branch = ctx.branch_for(&item);
    let _worktree = ctx.worktree_shared();
    let scope = ctx.scope_snapshot(&item.id, Phase::Plan)?;
    let prompt = ctx
        .prompts
        .render("plan", &ctx.prompt_context(&item).with_branch(&branch))?;
    let result = ctx.invoke_agent(&item, Phase::Plan, prompt, None)?;
    ctx.check_scope(scope)?;

    let text = read_artifact(&plan_path)?
        .ok_or_else(|| PhaseError::ArtifactMissing(paths.relative(&plan_path)))?;
    let issues = plan_issues(&text);
    if !issues.is_empty() {
        return Err(PhaseError::Quality(issues));
    }

    // Later saves replace earlier ones.
    match result.tool_calls.iter().rev().find(|call| call.name == TOOL_SAVE_PRD) {
        Some(call) => {
            tools::save_prd(ctx.store, &item.id, min_criteria, &call.input)?;
        }
        None => {
            let doc = ctx
                .store
                .try_read_prd(&item.id)?
                .ok_or_else(|| PhaseError::ArtifactMissing("prd.json".to_string()))?;
            check_backlog(&doc, &item.id, min_criteria)?;
        }
    }

    finish(ctx, &item.id, true, "plan.md and prd.json written")
}

fn existing_plan_is_valid(
    ctx: &PhaseContext<'_>,
    item: &Item,
    min_criteria: usize,
) -> Result<bool, PhaseError> {
    let Some(text) = read_artifact(&ctx.store.paths().plan(&item.id))? else {
        return Ok(false);
    };
    if !plan_issues(&text).is_empty() {
        return Ok(false);
    }
    match ctx.store.try_read_prd(&item.id) {
        Ok(Some(doc)) => Ok(prd_issues(&doc, &item.id, min_criteria).is_empty()),
        Ok(None) => Ok(false),
        Err(err @ (StoreError::Parse { .. } | StoreError::Schema { .. })) => {
            warn!(item = %item.id, err = %err, "stored prd.json is unusable; replanning");
            Ok(false)
        }
        Err(err) => Err(err.into()),
    }
}

fn check_backlog(doc: &Backlog, item_id: &str, min_criteria: usize) -> Result<(), PhaseError> {
    let issues = prd_issues(doc, item_id, min_criteria);
    if issues.is_empty() {
        Ok(())
    } else {
        Err(PhaseError::Quality(issues))
    }
}

fn finish(
    ctx: &PhaseContext<'_>,
    item_id: &str,
    agent_invoked: bool,
    message: &str,
) -> Result<PhaseOutcome, PhaseError> {
    let mut item = ctx.store.read_item(item_id)?;
    let branch = ctx.branch_for(&item);
    if let Some(doc) = ctx.store.try_read_prd(item_id)?
        && doc.branch_name != branch
    {
        warn!(item = item_id, prd_branch = %doc.branch_name, %branch, "prd branch name ignored");
    }
    item.branch = Some(branch);
    ctx.advance(item, Phase::Plan, ItemState::Planned, agent_invoked, message)
}
