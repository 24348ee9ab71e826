//! `research`: produce `research.md` for an idea.

use tracing::info;

use super::{OutcomeKind, PhaseContext, PhaseError, PhaseOutcome, read_artifact};
use crate::core::quality::research_issues;
use crate::core::states::Phase;
use crate::item::{Item, ItemState};

pub fn run(ctx: &PhaseContext<'_>, item: Item, force: bool) -> Result<PhaseOutcome, PhaseError> {
    let paths = ctx.store.paths();
    let research_path = paths.research(&item.id);
    let min_citations = ctx.config.quality.min_citations;

    if !force && let Some(existing) = read_artifact(&research_path)? {
        let issues = research_issues(&existing, min_citations);
        if issues.is_empty() {
            info!(item = %item.id, "research already present");
            if ctx.dry_run {
                return Ok(ctx.unchanged(
                    &item,
                    Phase::Research,
                    OutcomeKind::DryRun,
                    "research.md present; would advance",
                ));
            }
            if item.state == ItemState::Idea {
                return ctx.advance(
                    item,
                    Phase::Research,
                    ItemState::Researched,
                    false,
                    "existing research.md accepted",
                );
            }
            return Ok(ctx.unchanged(
                &item,
                Phase::Research,
                OutcomeKind::Skipped,
                "research.md already present",
            ));
        }
        info!(item = %item.id, issues = issues.len(), "existing research fails checks; regenerating");
    }

    if ctx.dry_run {
        return Ok(ctx.unchanged(
            &item,
            Phase::Research,
            OutcomeKind::DryRun,
            format!("would invoke agent to write {}", paths.relative(&research_path)),
        ));
    }

    let _worktree = ctx.worktree_shared();
    let scope = ctx.scope_snapshot(&item.id, Phase::Research)?;
    let prompt = ctx.prompts.render("research", &ctx.prompt_context(&item))?;
    ctx.invoke_agent(&item, Phase::Research, prompt, None)?;
    ctx.check_scope(scope)?;

    let text = read_artifact(&research_path)?
        .ok_or_else(|| PhaseError::ArtifactMissing(paths.relative(&research_path)))?;
    let issues = research_issues(&text, min_citations);
    if !issues.is_empty() {
        return Err(PhaseError::Quality(issues));
    }

    let item = ctx.store.read_item(&item.id)?;
    ctx.advance(item, Phase::Research, ItemState::Researched, true, "research.md written")
}
