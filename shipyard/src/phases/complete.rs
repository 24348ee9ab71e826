//! `complete`: record a merged review request and finish the item.

use chrono::Utc;
use tracing::{info, warn};

use super::{PhaseContext, PhaseError, PhaseOutcome};
use crate::core::states::Phase;
use crate::io::review::ReviewState;
use crate::item::{Completion, Item, ItemState};

pub fn run(ctx: &PhaseContext<'_>, item: Item) -> Result<PhaseOutcome, PhaseError> {
    let number = item
        .pr_number
        .ok_or_else(|| PhaseError::ArtifactMissing("pr reference".to_string()))?;
    if ctx.dry_run {
        return Ok(ctx.unchanged(
            &item,
            Phase::Complete,
            super::OutcomeKind::DryRun,
            format!("would check review request #{number}"),
        ));
    }

    let status = ctx
        .review
        .status(ctx.store.paths().repo_root(), number)
        .map_err(|err| {
            PhaseError::vcs(
                format!("query review request #{number}: {err:#}"),
                "check `gh auth status` and re-run complete",
            )
        })?;

    match status.state {
        ReviewState::Open => {
            info!(item = %item.id, number, mergeable = ?status.mergeable, "review request still open");
            Err(PhaseError::AwaitingMerge { number })
        }
        ReviewState::Closed => Err(PhaseError::vcs(
            format!("review request #{number} was closed without merging"),
            "reopen it or re-run pr --force",
        )),
        ReviewState::Merged => {
            if status.base_branch != ctx.config.base_branch {
                warn!(
                    item = %item.id,
                    merged_into = %status.base_branch,
                    expected = %ctx.config.base_branch,
                    "review request merged into a different base branch"
                );
            }
            let mut item = item;
            item.completion = Some(Completion {
                completed_at: Utc::now().max(item.created_at),
                merged_at: status.merged_at,
                merge_commit: status.merge_commit.clone(),
                checks_passed: status.checks_passed,
            });
            ctx.advance(
                item,
                Phase::Complete,
                ItemState::Done,
                false,
                format!("review request #{number} merged"),
            )
        }
    }
}
