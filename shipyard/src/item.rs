//! Item record: one backlog unit tracked through the workflow.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Current on-disk schema version for `item.json`.
pub const ITEM_SCHEMA_VERSION: u32 = 1;

static ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d{3,})-([a-z0-9]+(?:-[a-z0-9]+)*)$").expect("item id regex should compile")
});

/// Workflow state of an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    Idea,
    Researched,
    Planned,
    Implementing,
    InPr,
    Done,
}

impl ItemState {
    pub const ALL: [ItemState; 6] = [
        ItemState::Idea,
        ItemState::Researched,
        ItemState::Planned,
        ItemState::Implementing,
        ItemState::InPr,
        ItemState::Done,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ItemState::Idea => "idea",
            ItemState::Researched => "researched",
            ItemState::Planned => "planned",
            ItemState::Implementing => "implementing",
            ItemState::InPr => "in_pr",
            ItemState::Done => "done",
        }
    }

    /// Terminal states satisfy dependents.
    pub fn is_terminal(self) -> bool {
        self == ItemState::Done
    }
}

impl fmt::Display for ItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ItemState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        ItemState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| anyhow!("unknown item state '{s}'"))
    }
}

/// Operator-authored intake details.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Intake {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub problem_statement: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub motivation: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub success_criteria: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub technical_constraints: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub in_scope: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub out_of_scope: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority_hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub urgency_hint: Option<String>,
}

/// Audit fields appended when an item reaches `done`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Completion {
    pub completed_at: DateTime<Utc>,
    pub merged_at: Option<DateTime<Utc>>,
    pub merge_commit: Option<String>,
    pub checks_passed: Option<bool>,
}

/// Persisted item record (`items/<id>/item.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub schema_version: u32,
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub overview: String,
    pub state: ItemState,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub pr_url: Option<String>,
    #[serde(default)]
    pub pr_number: Option<u64>,
    #[serde(default)]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intake: Option<Intake>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub campaign: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_sha: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion: Option<Completion>,
}

impl Item {
    /// Build a fresh `idea` item.
    pub fn new(id: impl Into<String>, title: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            schema_version: ITEM_SCHEMA_VERSION,
            id: id.into(),
            title: title.into(),
            overview: String::new(),
            state: ItemState::Idea,
            branch: None,
            pr_url: None,
            pr_number: None,
            last_error: None,
            created_at: now,
            updated_at: now,
            intake: None,
            depends_on: Vec::new(),
            campaign: None,
            rollback_sha: None,
            completion: None,
        }
    }

    /// True when a review request has been recorded.
    pub fn has_pr_reference(&self) -> bool {
        self.pr_url.is_some() || self.pr_number.is_some()
    }

    /// Semantic checks the JSON schema cannot express.
    pub fn semantic_errors(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if let Err(err) = validate_item_id(&self.id) {
            errors.push(err.to_string());
        }
        if self.title.trim().is_empty() {
            errors.push("title must be non-empty".to_string());
        }
        if self.updated_at < self.created_at {
            errors.push("updated_at precedes created_at".to_string());
        }
        if self.depends_on.iter().any(|dep| dep == &self.id) {
            errors.push(format!("item {} depends on itself", self.id));
        }
        for dep in &self.depends_on {
            if validate_item_id(dep).is_err() {
                errors.push(format!("invalid dependency id '{dep}'"));
            }
        }
        errors
    }
}

/// Validate an item id of the form `NNN-slug`.
pub fn validate_item_id(id: &str) -> Result<()> {
    let caps = ID_RE
        .captures(id)
        .ok_or_else(|| anyhow!("invalid item id '{id}': expected NNN-slug"))?;
    let number: u64 = caps[1]
        .parse()
        .map_err(|_| anyhow!("invalid item id '{id}': number out of range"))?;
    if number == 0 {
        return Err(anyhow!("invalid item id '{id}': number must be >= 1"));
    }
    Ok(())
}

/// Sequence number of a valid item id.
pub fn item_number(id: &str) -> Option<u64> {
    ID_RE.captures(id).and_then(|caps| caps[1].parse().ok())
}

/// Format an id from a sequence number and a title.
pub fn format_item_id(number: u64, title: &str) -> String {
    format!("{number:03}-{}", slugify(title))
}

/// Lowercase ASCII slug; collapses everything else into single dashes.
pub fn slugify(title: &str) -> String {
    let mut slug = String::new();
    for ch in title.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
        if slug.len() >= 48 {
            break;
        }
    }
    let slug = slug.trim_end_matches('-').to_string();
    if slug.is_empty() {
        "item".to_string()
    } else {
        slug
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_ids_pass() {
        validate_item_id("001-add-login").expect("valid");
        validate_item_id("1234-x").expect("four digits");
    }

    #[test]
    fn invalid_ids_fail() {
        for bad in ["1-x", "000-zero", "001-", "001-Bad", "001--x", "abc-def", "001-x-"] {
            assert!(validate_item_id(bad).is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn slugify_collapses_punctuation() {
        assert_eq!(slugify("Add OAuth2 login!!"), "add-oauth2-login");
        assert_eq!(slugify("  --  "), "item");
        assert_eq!(format_item_id(7, "Fix: crash on start"), "007-fix-crash-on-start");
    }

    #[test]
    fn state_serializes_snake_case() {
        let json = serde_json::to_string(&ItemState::InPr).expect("serialize");
        assert_eq!(json, "\"in_pr\"");
        assert_eq!("in_pr".parse::<ItemState>().expect("parse"), ItemState::InPr);
    }

    /// Self-dependency and reversed timestamps are semantic errors.
    #[test]
    fn semantic_errors_detect_self_dependency() {
        let now = Utc::now();
        let mut item = Item::new("001-a", "A", now);
        item.depends_on.push("001-a".to_string());
        item.updated_at = now - chrono::Duration::seconds(5);
        let errors = item.semantic_errors();
        assert_eq!(errors.len(), 2, "{errors:?}");
    }
}
