//! `implement`: work through pending stories one agent iteration at a time.

use std::time::Duration;

use chrono::Utc;
use tracing::{info, instrument, warn};

use super::{OutcomeKind, PhaseContext, PhaseError, PhaseOutcome, tools};
use crate::backlog::{Backlog, Story, StoryStatus};
use crate::core::states::{Phase, check_transition};
use crate::io::config::VerifyMode;
use crate::io::gates::run_gates;
use crate::io::paths::STORE_DIR;
use crate::io::progress_log::{ProgressEvent, ProgressRecord, last_iteration, read_progress};
use crate::item::{Item, ItemState};

pub fn run(ctx: &PhaseContext<'_>, item: Item, _force: bool) -> Result<PhaseOutcome, PhaseError> {
    let mut doc = ctx.store.try_read_prd(&item.id)?.ok_or_else(|| {
        PhaseError::ArtifactMissing(ctx.store.paths().relative(&ctx.store.paths().prd(&item.id)))
    })?;

    if doc.all_done() {
        if ctx.dry_run {
            return Ok(ctx.unchanged(
                &item,
                Phase::Implement,
                OutcomeKind::DryRun,
                "all stories done; nothing to implement",
            ));
        }
        if item.state == ItemState::Planned {
            return ctx.advance(
                item,
                Phase::Implement,
                ItemState::Implementing,
                false,
                "all stories already done",
            );
        }
        return Ok(ctx.unchanged(
            &item,
            Phase::Implement,
            OutcomeKind::Skipped,
            "all stories already done",
        ));
    }

    let branch = ctx.branch_for(&item);
    if ctx.dry_run {
        return Ok(ctx.unchanged(
            &item,
            Phase::Implement,
            OutcomeKind::DryRun,
            format!(
                "would implement {} pending story(ies) on {branch}",
                doc.pending_count()
            ),
        ));
    }

    let _worktree = ctx.worktree_exclusive();
    let use_git = ctx.git.is_repo();
    if use_git {
        ctx.git
            .switch_or_create(&branch, &ctx.config.base_branch)
            .map_err(|err| {
                PhaseError::vcs(
                    format!("cannot switch to {branch}: {err:#}"),
                    "commit or stash local changes, then re-run implement",
                )
            })?;
    } else {
        warn!(item = %item.id, "not a git repository; stories will not be committed");
    }

    let item = start_implementing(ctx, item, &branch)?;
    let records = read_progress(&ctx.store.paths().progress_log(&item.id))?;
    let mut iteration = last_iteration(&records, Phase::Implement);
    let max = ctx.config.max_iterations;
    let mut runs = 0u32;
    let mut completed = 0usize;

    while let Some(story) = doc.next_pending().cloned() {
        if runs >= max {
            return Err(PhaseError::MaxIterations(runs));
        }
        if ctx.interrupt.is_set() {
            return Err(PhaseError::Interrupted);
        }
        runs += 1;
        iteration += 1;
        if run_iteration(ctx, &item.id, &branch, &mut doc, &story, iteration)? {
            completed += 1;
        }
        if use_git {
            commit_story(ctx, &item.id, &story)?;
        }
    }

    let item = ctx.store.read_item(&item.id)?;
    ctx.advance(
        item,
        Phase::Implement,
        ItemState::Implementing,
        true,
        format!("{completed} story(ies) completed in {runs} iteration(s)"),
    )
}

/// Persist `planned -> implementing` before the first iteration so a crash
/// resumes as an implementation in progress.
fn start_implementing(
    ctx: &PhaseContext<'_>,
    mut item: Item,
    branch: &str,
) -> Result<Item, PhaseError> {
    let mut dirty = false;
    if item.state == ItemState::Planned {
        check_transition(item.state, ItemState::Implementing)?;
        item.state = ItemState::Implementing;
        dirty = true;
    }
    if item.branch.as_deref() != Some(branch) {
        item.branch = Some(branch.to_string());
        dirty = true;
    }
    if dirty {
        item.updated_at = Utc::now().max(item.created_at);
        ctx.store.write_item(&item)?;
    }
    Ok(item)
}

/// One agent call for `story`. Returns whether the story ended up done.
#[instrument(skip_all, fields(item = %item_id, story = %story.id, iteration))]
fn run_iteration(
    ctx: &PhaseContext<'_>,
    item_id: &str,
    branch: &str,
    doc: &mut Backlog,
    story: &Story,
    iteration: u32,
) -> Result<bool, PhaseError> {
    ctx.progress(
        item_id,
        ProgressRecord::new(
            Phase::Implement,
            ProgressEvent::IterationStarted,
            story.title.clone(),
        )
        .iteration(iteration)
        .story(&story.id),
    );

    let item = ctx.store.read_item(item_id)?;
    let prompt = ctx.prompts.render(
        "implement",
        &ctx.prompt_context(&item)
            .with_branch(branch)
            .with_story(story, iteration, doc.pending_count())
            .with_stories(&doc.user_stories),
    )?;
    let result = ctx.invoke_agent(&item, Phase::Implement, prompt, Some(&story.id))?;

    for call in &result.tool_calls {
        let update = tools::update_story_status(doc, &call.input)?;
        if update.status == StoryStatus::Done {
            ctx.progress(
                item_id,
                ProgressRecord::new(
                    Phase::Implement,
                    ProgressEvent::StoryCompleted,
                    update.notes.clone().unwrap_or_default(),
                )
                .iteration(iteration)
                .story(&update.story_id),
            );
        }
    }
    ctx.store.write_prd(item_id, doc)?;

    let done = doc
        .user_stories
        .iter()
        .any(|s| s.id == story.id && s.status == StoryStatus::Done);
    if !done {
        warn!("agent finished without marking the story done");
        return Ok(false);
    }
    verify_story(ctx, item_id, doc, &story.id, iteration)
}

/// Run acceptance verification commands; in block mode a failure reverts the story.
fn verify_story(
    ctx: &PhaseContext<'_>,
    item_id: &str,
    doc: &mut Backlog,
    story_id: &str,
    iteration: u32,
) -> Result<bool, PhaseError> {
    let quality = &ctx.config.quality;
    if quality.verify_commands.is_empty() {
        return Ok(true);
    }
    let paths = ctx.store.paths();
    let failure = run_gates(
        ctx.gates,
        &quality.verify_commands,
        paths.repo_root(),
        &paths.logs_dir(item_id).join(format!("verify-{iteration}")),
        Duration::from_secs(ctx.config.merge.gate_timeout_secs),
        ctx.config.agent.output_limit_bytes,
    )?;
    let Some((command, outcome)) = failure else {
        info!(story = story_id, "acceptance verification passed");
        return Ok(true);
    };

    match quality.verify_acceptance {
        VerifyMode::Warn => {
            warn!(story = story_id, %command, ?outcome, "acceptance verification failed");
            ctx.progress(
                item_id,
                ProgressRecord::new(
                    Phase::Implement,
                    ProgressEvent::VerificationFailed,
                    format!("{command} failed"),
                )
                .iteration(iteration)
                .story(story_id),
            );
            Ok(true)
        }
        VerifyMode::Block => {
            if let Some(story) = doc.story_mut(story_id) {
                story.status = StoryStatus::Pending;
                story.notes = format!("verification failed: {command}");
            }
            ctx.store.write_prd(item_id, doc)?;
            warn!(story = story_id, %command, "verification failed; story reverted to pending");
            ctx.progress(
                item_id,
                ProgressRecord::new(
                    Phase::Implement,
                    ProgressEvent::StoryReverted,
                    format!("{command} failed"),
                )
                .iteration(iteration)
                .story(story_id),
            );
            Ok(false)
        }
    }
}

fn commit_story(ctx: &PhaseContext<'_>, item_id: &str, story: &Story) -> Result<(), PhaseError> {
    let hint = "inspect `git status` and re-run implement";
    ctx.git
        .add_all_except(&[STORE_DIR])
        .map_err(|err| PhaseError::vcs(format!("stage changes: {err:#}"), hint))?;
    let message = format!("shipyard({item_id}): {} {}", story.id, story.title);
    let committed = ctx
        .git
        .commit_staged(&message)
        .map_err(|err| PhaseError::vcs(format!("commit {}: {err:#}", story.id), hint))?;
    if !committed {
        info!(story = %story.id, "no file changes to commit");
    }
    Ok(())
}
