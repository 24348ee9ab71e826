//! `pr`: gate, push and deliver the item branch.
//!
//! Checks run in a fixed order and any failure stops before the push:
//! branch, auto-commit, clean tree, quality gates, secret scan, remote
//! allow-list, conflict dry run. Delivery is either a review request or a
//! direct merge into the base branch.

use std::time::Duration;

use chrono::Utc;
use tracing::{info, instrument, warn};

use super::{OutcomeKind, PhaseContext, PhaseError, PhaseOutcome};
use crate::backlog::Backlog;
use crate::core::secrets::scan_diff;
use crate::core::states::Phase;
use crate::io::config::MergeMode;
use crate::io::gates::run_gates;
use crate::io::git::MergeCheck;
use crate::io::paths::STORE_DIR;
use crate::io::review::ReviewRequest;
use crate::item::{Completion, Item, ItemState};

pub fn run(ctx: &PhaseContext<'_>, item: Item, force: bool) -> Result<PhaseOutcome, PhaseError> {
    let doc = ctx.store.try_read_prd(&item.id)?.ok_or_else(|| {
        PhaseError::ArtifactMissing(ctx.store.paths().relative(&ctx.store.paths().prd(&item.id)))
    })?;
    if !doc.all_done() {
        return Err(PhaseError::Precondition(format!(
            "{} story(ies) still pending; run implement first",
            doc.pending_count()
        )));
    }
    if item.state == ItemState::InPr && item.has_pr_reference() && !force {
        return Ok(ctx.unchanged(
            &item,
            Phase::Pr,
            OutcomeKind::Skipped,
            format!(
                "review request already open: {}",
                item.pr_url.as_deref().unwrap_or("(url unknown)")
            ),
        ));
    }

    let branch = ctx.branch_for(&item);
    let mode = ctx.config.merge_mode;
    if ctx.dry_run {
        let delivery = match mode {
            MergeMode::Pr => "open a review request",
            MergeMode::Direct => "merge into the base branch",
        };
        return Ok(ctx.unchanged(
            &item,
            Phase::Pr,
            OutcomeKind::DryRun,
            format!(
                "would run {} gate(s), push {branch} and {delivery}",
                ctx.config.merge.quality_gates.len()
            ),
        ));
    }
    if !ctx.git.is_repo() {
        return Err(PhaseError::vcs(
            "repository root is not a git checkout",
            "run shipyard inside a git repository",
        ));
    }

    let _worktree = ctx.worktree_exclusive();
    let gates_ran = preflight(ctx, &item, &branch)?;
    match mode {
        MergeMode::Pr => open_review(ctx, item, &branch, &doc),
        MergeMode::Direct => merge_direct(ctx, item, &branch, gates_ran),
    }
}

/// Every check that must pass before anything leaves the machine.
/// Returns whether any quality gate ran.
#[instrument(skip_all, fields(item = %item.id, branch = %branch))]
fn preflight(ctx: &PhaseContext<'_>, item: &Item, branch: &str) -> Result<bool, PhaseError> {
    let git = &ctx.git;
    let base = ctx.config.base_branch.as_str();
    let merge = &ctx.config.merge;
    let store_prefix = format!("{STORE_DIR}/");

    let dirty = git
        .status_porcelain()
        .map_err(|err| PhaseError::vcs(format!("git status: {err:#}"), "check the repository"))?
        .into_iter()
        .filter(|entry| !entry.path.starts_with(&store_prefix))
        .count();

    git.switch_or_create(branch, base).map_err(|err| {
        PhaseError::vcs(
            format!("cannot switch to {branch}: {err:#}"),
            "commit or stash local changes, then re-run pr",
        )
    })?;

    if dirty > 0 {
        info!(dirty, "committing leftover changes before delivery");
        git.add_all_except(&[STORE_DIR])
            .and_then(|()| git.commit_staged(&format!("shipyard({}): final changes", item.id)))
            .map_err(|err| {
                PhaseError::vcs(format!("auto-commit: {err:#}"), "commit the changes manually")
            })?;
    }

    git.ensure_clean_except_prefixes(&[store_prefix.as_str()])
        .map_err(|err| PhaseError::vcs(format!("{err:#}"), "commit or remove the listed files"))?;

    let paths = ctx.store.paths();
    if let Some((command, outcome)) = run_gates(
        ctx.gates,
        &merge.quality_gates,
        paths.repo_root(),
        &paths.logs_dir(&item.id).join("gates"),
        Duration::from_secs(merge.gate_timeout_secs),
        ctx.config.agent.output_limit_bytes,
    )? {
        return Err(PhaseError::Quality(vec![format!(
            "quality gate `{command}` failed ({outcome:?})"
        )]));
    }

    if merge.secret_scan {
        let diff = git.diff_three_dot(base, branch).map_err(|err| {
            PhaseError::vcs(
                format!("diff {base}...{branch}: {err:#}"),
                "check that the base branch exists",
            )
        })?;
        let findings = scan_diff(&diff);
        if !findings.is_empty() {
            return Err(PhaseError::Quality(
                findings
                    .iter()
                    .map(|finding| format!("possible secret at {finding}"))
                    .collect(),
            ));
        }
    }

    check_remote(ctx)?;

    match git.merge_tree_check(base, branch).map_err(|err| {
        PhaseError::vcs(format!("{err:#}"), "upgrade git or resolve the merge manually")
    })? {
        MergeCheck::Clean => {}
        MergeCheck::Conflicts(files) => {
            return Err(PhaseError::vcs(
                format!("{branch} conflicts with {base}: {}", files.join(", ")),
                format!("rebase {branch} onto {base} and re-run pr"),
            ));
        }
    }
    Ok(!merge.quality_gates.is_empty())
}

fn check_remote(ctx: &PhaseContext<'_>) -> Result<(), PhaseError> {
    let merge = &ctx.config.merge;
    let url = ctx.git.remote_url(&merge.remote).map_err(|err| {
        PhaseError::vcs(
            format!("remote '{}': {err:#}", merge.remote),
            "add the remote or set merge.remote",
        )
    })?;
    let matchers = merge.remote_matchers()?;
    if matchers.is_empty() {
        warn!(remote = %merge.remote, %url, "no remote allow-list configured; any remote is accepted");
        return Ok(());
    }
    if matchers.iter().any(|re| re.is_match(&url)) {
        return Ok(());
    }
    Err(PhaseError::vcs(
        format!("remote url {url} is not in merge.allowed_remote_patterns"),
        "add a matching pattern or point the remote elsewhere",
    ))
}

/// Push `branch` and confirm the remote now points at the local head.
fn push_verified(ctx: &PhaseContext<'_>, branch: &str) -> Result<String, PhaseError> {
    let remote = ctx.config.merge.remote.as_str();
    let local = ctx
        .git
        .rev_parse(branch)
        .map_err(|err| PhaseError::vcs(format!("{err:#}"), "check the branch exists"))?;
    ctx.git.push(remote, branch).map_err(|err| {
        PhaseError::vcs(
            format!("push {branch} to {remote}: {err:#}"),
            "check network access and credentials, then re-run pr",
        )
    })?;
    let reported = ctx
        .git
        .ls_remote_head(remote, branch)
        .map_err(|err| PhaseError::vcs(format!("{err:#}"), "check the remote is reachable"))?;
    if reported.as_deref() != Some(local.as_str()) {
        return Err(PhaseError::vcs(
            format!(
                "{remote}/{branch} is at {} after push, expected {local}",
                reported.as_deref().unwrap_or("nothing")
            ),
            "inspect the remote branch and re-run pr",
        ));
    }
    Ok(local)
}

fn open_review(
    ctx: &PhaseContext<'_>,
    item: Item,
    branch: &str,
    doc: &Backlog,
) -> Result<PhaseOutcome, PhaseError> {
    push_verified(ctx, branch)?;
    let body = ctx.prompts.render(
        "pr_body",
        &ctx.prompt_context(&item)
            .with_branch(branch)
            .with_stories(&doc.user_stories),
    )?;
    let request = ReviewRequest {
        head_branch: branch.to_string(),
        base_branch: ctx.config.base_branch.clone(),
        title: format!("{}: {}", item.id, item.title),
        body,
        draft: ctx.config.merge.draft,
    };
    let review = ctx
        .review
        .create_or_update(ctx.store.paths().repo_root(), &request)
        .map_err(|err| {
            PhaseError::vcs(
                format!("open review request: {err:#}"),
                "check `gh auth status` and re-run pr",
            )
        })?;

    let mut item = ctx.store.read_item(&item.id)?;
    item.branch = Some(branch.to_string());
    item.pr_url = Some(review.url.clone());
    item.pr_number = Some(review.number);
    ctx.advance(
        item,
        Phase::Pr,
        ItemState::InPr,
        false,
        format!("review request #{} at {}", review.number, review.url),
    )
}

fn merge_direct(
    ctx: &PhaseContext<'_>,
    item: Item,
    branch: &str,
    gates_ran: bool,
) -> Result<PhaseOutcome, PhaseError> {
    let git = &ctx.git;
    let base = ctx.config.base_branch.as_str();
    let rollback_sha = git
        .rev_parse(base)
        .map_err(|err| PhaseError::vcs(format!("{err:#}"), "check the base branch exists"))?;

    let mut item = ctx.store.read_item(&item.id)?;
    item.rollback_sha = Some(rollback_sha.clone());
    item.updated_at = Utc::now().max(item.created_at);
    ctx.store.write_item(&item)?;

    git.checkout_branch(base)
        .map_err(|err| PhaseError::vcs(format!("{err:#}"), "check out the base branch manually"))?;
    let message = format!("Merge {branch}: {}", item.title);
    if let Err(err) = git.merge_no_ff(branch, &message) {
        git.merge_abort();
        if let Err(back) = git.checkout_branch(branch) {
            warn!(err = %format!("{back:#}"), "could not return to the item branch");
        }
        return Err(PhaseError::vcs(
            format!("merge {branch} into {base}: {err:#}"),
            format!("resolve the merge manually; {base} was at {rollback_sha}"),
        ));
    }

    let merge_commit = push_verified(ctx, base).map_err(|err| match err {
        PhaseError::Vcs { message, .. } => PhaseError::Vcs {
            message,
            hint: format!(
                "local {base} holds the merge; undo with `git reset --hard {rollback_sha}`"
            ),
        },
        other => other,
    })?;

    let now = Utc::now().max(item.created_at);
    item.completion = Some(Completion {
        completed_at: now,
        merged_at: Some(now),
        merge_commit: Some(merge_commit.clone()),
        checks_passed: gates_ran.then_some(true),
    });
    ctx.advance(
        item,
        Phase::Pr,
        ItemState::Done,
        false,
        format!("merged {branch} into {base} at {merge_commit}"),
    )
}
