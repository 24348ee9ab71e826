//! Structured Backlog Document (`prd.json`): the story list that drives implementation.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// The single accepted schema version for `prd.json`.
pub const BACKLOG_SCHEMA_VERSION: u32 = 1;
/// Highest priority value (most urgent).
pub const PRIORITY_MIN: u8 = 1;
/// Lowest priority value.
pub const PRIORITY_MAX: u8 = 4;

static STORY_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^US-\d{3}$").expect("story id regex should compile"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoryStatus {
    Pending,
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Story {
    pub id: String,
    pub title: String,
    pub acceptance_criteria: Vec<String>,
    pub priority: u8,
    pub status: StoryStatus,
    #[serde(default)]
    pub notes: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backlog {
    pub schema_version: u32,
    pub id: String,
    pub branch_name: String,
    pub user_stories: Vec<Story>,
}

impl Backlog {
    /// Highest-priority pending story: lowest `priority`, ties broken by id.
    pub fn next_pending(&self) -> Option<&Story> {
        self.user_stories
            .iter()
            .filter(|story| story.status == StoryStatus::Pending)
            .min_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)))
    }

    pub fn pending_count(&self) -> usize {
        self.user_stories
            .iter()
            .filter(|story| story.status == StoryStatus::Pending)
            .count()
    }

    pub fn all_done(&self) -> bool {
        self.pending_count() == 0
    }

    pub fn story_mut(&mut self, id: &str) -> Option<&mut Story> {
        self.user_stories.iter_mut().find(|story| story.id == id)
    }

    /// Structural invariants every stored document must satisfy.
    pub fn structural_errors(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.schema_version != BACKLOG_SCHEMA_VERSION {
            errors.push(format!(
                "unsupported prd schema_version {} (expected {BACKLOG_SCHEMA_VERSION})",
                self.schema_version
            ));
        }
        let mut seen = HashSet::new();
        for story in &self.user_stories {
            if !seen.insert(story.id.as_str()) {
                errors.push(format!("duplicate story id {}", story.id));
            }
            if !(PRIORITY_MIN..=PRIORITY_MAX).contains(&story.priority) {
                errors.push(format!(
                    "story {} priority {} outside {PRIORITY_MIN}..={PRIORITY_MAX}",
                    story.id, story.priority
                ));
            }
            if story.acceptance_criteria.is_empty() {
                errors.push(format!("story {} has no acceptance criteria", story.id));
            }
        }
        errors
    }
}

/// True when `id` matches `US-NNN`.
pub fn is_valid_story_id(id: &str) -> bool {
    STORY_ID_RE.is_match(id)
}
