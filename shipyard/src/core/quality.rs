//! Heuristic quality checks for phase artifacts.
//!
//! These are deliberately shallow: they catch empty or template-only output
//! from the agent, not bad engineering.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;

use crate::backlog::{Backlog, is_valid_story_id};

static CITATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"`([A-Za-z0-9_./-]+:\d+(?:-\d+)?)`|\b((?:[A-Za-z0-9_.-]+/)+[A-Za-z0-9_-]+\.[A-Za-z0-9]+)\b")
        .expect("citation regex should compile")
});

/// Required headings in `research.md`.
pub const RESEARCH_SECTIONS: [&str; 2] = ["## Summary", "## Findings"];
/// Required headings in `plan.md`.
pub const PLAN_SECTIONS: [&str; 2] = ["## Overview", "## Implementation Plan"];

/// Acceptance criteria shorter than this are flagged as vague.
const VAGUE_CRITERION_CHARS: usize = 10;

/// True when `text` has a line that is exactly the heading (case-insensitive).
pub fn has_section(text: &str, heading: &str) -> bool {
    text.lines()
        .any(|line| line.trim().eq_ignore_ascii_case(heading))
}

/// Count distinct file references (`path:line` in backticks or `dir/file.ext`).
pub fn count_citations(text: &str) -> usize {
    let mut seen = BTreeSet::new();
    for caps in CITATION_RE.captures_iter(text) {
        if let Some(m) = caps.get(1).or_else(|| caps.get(2)) {
            seen.insert(m.as_str().to_string());
        }
    }
    seen.len()
}

pub fn research_issues(text: &str, min_citations: usize) -> Vec<String> {
    let mut issues = missing_sections(text, &RESEARCH_SECTIONS);
    let citations = count_citations(text);
    if citations < min_citations {
        issues.push(format!(
            "research cites {citations} file reference(s), need at least {min_citations}"
        ));
    }
    issues
}

pub fn plan_issues(text: &str) -> Vec<String> {
    missing_sections(text, &PLAN_SECTIONS)
}

fn missing_sections(text: &str, sections: &[&str]) -> Vec<String> {
    sections
        .iter()
        .filter(|heading| !has_section(text, heading))
        .map(|heading| format!("missing section '{heading}'"))
        .collect()
}

/// Blocking problems with a backlog document produced for `item_id`.
pub fn prd_issues(doc: &Backlog, item_id: &str, min_criteria: usize) -> Vec<String> {
    let mut issues = doc.structural_errors();
    if doc.id != item_id {
        issues.push(format!("prd id '{}' does not match item '{item_id}'", doc.id));
    }
    if doc.user_stories.is_empty() {
        issues.push("prd has no user stories".to_string());
    }
    for story in &doc.user_stories {
        if !is_valid_story_id(&story.id) {
            issues.push(format!("story id '{}' does not match US-NNN", story.id));
        }
        if story.acceptance_criteria.len() < min_criteria {
            issues.push(format!(
                "story {} has {} acceptance criteria, need at least {min_criteria}",
                story.id,
                story.acceptance_criteria.len()
            ));
        }
    }
    issues
}

/// Non-blocking story smells reported by the doctor.
pub fn story_warnings(doc: &Backlog) -> Vec<String> {
    let mut warnings = Vec::new();
    let mut titles = BTreeSet::new();
    for story in &doc.user_stories {
        if story.title.trim().is_empty() {
            warnings.push(format!("story {} has an empty title", story.id));
        } else if !titles.insert(story.title.trim().to_lowercase()) {
            warnings.push(format!("story {} duplicates another story title", story.id));
        }
        for criterion in &story.acceptance_criteria {
            if criterion.trim().chars().count() < VAGUE_CRITERION_CHARS {
                warnings.push(format!(
                    "story {} has a vague acceptance criterion '{}'",
                    story.id,
                    criterion.trim()
                ));
            }
        }
    }
    warnings
}
