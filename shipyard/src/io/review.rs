//! Code-review host collaborator (`gh` CLI).

use std::path::Path;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, instrument};

use crate::io::process::run_command_with_timeout;

const GH_TIMEOUT: Duration = Duration::from_secs(120);
const GH_OUTPUT_LIMIT: usize = 256 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewRequest {
    pub head_branch: String,
    pub base_branch: String,
    pub title: String,
    pub body: String,
    pub draft: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewRef {
    pub number: u64,
    pub url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewState {
    Open,
    Merged,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewStatus {
    pub state: ReviewState,
    pub merged_at: Option<DateTime<Utc>>,
    pub merge_commit: Option<String>,
    /// Branch the review request targets.
    pub base_branch: String,
    pub mergeable: Option<bool>,
    /// `None` when the host reports no checks.
    pub checks_passed: Option<bool>,
}

/// Narrow interface to the hosted review system.
///
/// `status` is a read; `create_or_update` is idempotent per head branch.
pub trait ReviewHost: Send + Sync {
    fn create_or_update(&self, workdir: &Path, request: &ReviewRequest) -> Result<ReviewRef>;
    fn status(&self, workdir: &Path, number: u64) -> Result<ReviewStatus>;
}

/// `gh` CLI implementation.
#[derive(Debug, Clone)]
pub struct GhCli {
    binary: String,
}

impl Default for GhCli {
    fn default() -> Self {
        Self {
            binary: "gh".to_string(),
        }
    }
}

impl GhCli {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn run_gh(&self, workdir: &Path, args: &[&str]) -> Result<String> {
        debug!(?args, "running gh");
        let mut cmd = Command::new(&self.binary);
        cmd.args(args).current_dir(workdir);
        let output = run_command_with_timeout(cmd, None, GH_TIMEOUT, GH_OUTPUT_LIMIT)
            .with_context(|| format!("spawn {}", self.binary))?;
        if output.timed_out {
            bail!("gh {} timed out", args.first().copied().unwrap_or(""));
        }
        if !output.status.success() {
            return Err(anyhow!(
                "gh {} failed: {}",
                args.first().copied().unwrap_or(""),
                output.stderr_lossy().trim()
            ));
        }
        Ok(output.stdout_lossy().trim().to_string())
    }

    fn find_open(&self, workdir: &Path, head: &str) -> Result<Option<ReviewRef>> {
        let out = self.run_gh(
            workdir,
            &[
                "pr", "list", "--head", head, "--state", "open", "--json", "number,url",
            ],
        )?;
        let found: Vec<GhPrRef> = serde_json::from_str(&out).context("parse gh pr list output")?;
        Ok(found.into_iter().next().map(|pr| ReviewRef {
            number: pr.number,
            url: pr.url,
        }))
    }
}

impl ReviewHost for GhCli {
    #[instrument(skip_all, fields(head = %request.head_branch, base = %request.base_branch))]
    fn create_or_update(&self, workdir: &Path, request: &ReviewRequest) -> Result<ReviewRef> {
        if let Some(existing) = self.find_open(workdir, &request.head_branch)? {
            let number = existing.number.to_string();
            self.run_gh(
                workdir,
                &["pr", "edit", &number, "--title", &request.title, "--body", &request.body],
            )?;
            info!(number = existing.number, "review request updated");
            return Ok(existing);
        }

        let mut args = vec![
            "pr",
            "create",
            "--head",
            &request.head_branch,
            "--base",
            &request.base_branch,
            "--title",
            &request.title,
            "--body",
            &request.body,
        ];
        if request.draft {
            args.push("--draft");
        }
        let out = self.run_gh(workdir, &args)?;
        let url = out
            .lines()
            .rev()
            .find(|line| line.starts_with("http"))
            .ok_or_else(|| anyhow!("gh pr create printed no URL: {out}"))?
            .trim()
            .to_string();
        let number = pr_number_from_url(&url)
            .ok_or_else(|| anyhow!("cannot read PR number from {url}"))?;
        info!(number, %url, "review request created");
        Ok(ReviewRef { number, url })
    }

    #[instrument(skip_all, fields(number = number))]
    fn status(&self, workdir: &Path, number: u64) -> Result<ReviewStatus> {
        let number = number.to_string();
        let out = self.run_gh(
            workdir,
            &[
                "pr",
                "view",
                &number,
                "--json",
                "state,mergedAt,mergeCommit,baseRefName,mergeable,statusCheckRollup",
            ],
        )?;
        parse_view(&out)
    }
}

#[derive(Debug, Deserialize)]
struct GhPrRef {
    number: u64,
    url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GhPrView {
    state: String,
    merged_at: Option<DateTime<Utc>>,
    merge_commit: Option<GhCommit>,
    base_ref_name: String,
    mergeable: Option<String>,
    #[serde(default)]
    status_check_rollup: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct GhCommit {
    oid: String,
}

/// Trailing `/pull/<n>` of a review URL.
pub fn pr_number_from_url(url: &str) -> Option<u64> {
    let (_, tail) = url.trim_end_matches('/').rsplit_once("/pull/")?;
    tail.parse().ok()
}

/// Parse `gh pr view --json` output.
pub fn parse_view(raw: &str) -> Result<ReviewStatus> {
    let view: GhPrView = serde_json::from_str(raw).context("parse gh pr view output")?;
    let state = match view.state.to_ascii_uppercase().as_str() {
        "MERGED" => ReviewState::Merged,
        "CLOSED" => ReviewState::Closed,
        _ => ReviewState::Open,
    };
    let mergeable = match view.mergeable.as_deref() {
        Some("MERGEABLE") => Some(true),
        Some("CONFLICTING") => Some(false),
        _ => None,
    };
    let checks_passed = (!view.status_check_rollup.is_empty()).then(|| {
        view.status_check_rollup.iter().all(|check| {
            let verdict = check
                .get("conclusion")
                .or_else(|| check.get("state"))
                .and_then(Value::as_str)
                .unwrap_or("");
            matches!(verdict, "SUCCESS" | "NEUTRAL" | "SKIPPED")
        })
    });
    Ok(ReviewStatus {
        state,
        merged_at: view.merged_at,
        merge_commit: view.merge_commit.map(|commit| commit.oid),
        base_branch: view.base_ref_name,
        mergeable,
        checks_passed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn number_comes_from_url_tail() {
        assert_eq!(
            pr_number_from_url("https://github.com/acme/app/pull/42"),
            Some(42)
        );
        assert_eq!(pr_number_from_url("https://github.com/acme/app"), None);
    }

    #[test]
    fn merged_view_parses() {
        let raw = r#"{
            "state": "MERGED",
            "mergedAt": "2024-05-01T10:00:00Z",
            "mergeCommit": {"oid": "abc123"},
            "baseRefName": "main",
            "mergeable": "UNKNOWN",
            "statusCheckRollup": [
                {"conclusion": "SUCCESS"},
                {"state": "SUCCESS"}
            ]
        }"#;
        let status = parse_view(raw).expect("parse");
        assert_eq!(status.state, ReviewState::Merged);
        assert_eq!(status.merge_commit.as_deref(), Some("abc123"));
        assert_eq!(status.base_branch, "main");
        assert_eq!(status.mergeable, None);
        assert_eq!(status.checks_passed, Some(true));
    }

    #[test]
    fn open_view_with_failing_check() {
        let raw = r#"{"state":"OPEN","mergedAt":null,"mergeCommit":null,"baseRefName":"dev","mergeable":"CONFLICTING","statusCheckRollup":[{"conclusion":"FAILURE"}]}"#;
        let status = parse_view(raw).expect("parse");
        assert_eq!(status.state, ReviewState::Open);
        assert_eq!(status.mergeable, Some(false));
        assert_eq!(status.checks_passed, Some(false));
    }
}
