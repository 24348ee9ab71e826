//! Git adapter for the workflow engine.
//!
//! Every version-control operation is a discrete call on a small explicit
//! wrapper around `git` subprocesses, so each step of merge delivery can be
//! retried independently.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    /// Path for the changed file.
    pub path: String,
}

/// Result of a `git merge-tree` dry run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeCheck {
    Clean,
    Conflicts(Vec<String>),
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// True if the workdir is inside a git work tree.
    pub fn is_repo(&self) -> bool {
        self.run(&["rev-parse", "--is-inside-work-tree"])
            .map(|out| out.status.success())
            .unwrap_or(false)
    }

    /// Return the current branch name (errors on detached HEAD).
    #[instrument(skip_all)]
    pub fn current_branch(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        let name = out.trim().to_string();
        if name == "HEAD" {
            warn!("detached HEAD detected");
            return Err(anyhow!("detached HEAD (refuse to run)"));
        }
        debug!(branch = %name, "current branch");
        Ok(name)
    }

    /// Full SHA of a revision.
    pub fn rev_parse(&self, rev: &str) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "--verify", &format!("{rev}^{{commit}}")])?;
        Ok(out.trim().to_string())
    }

    pub fn head_sha(&self) -> Result<String> {
        self.rev_parse("HEAD")
    }

    /// Get status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        let mut entries = Vec::new();
        for line in out.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(parse_status_line(line)?);
        }
        Ok(entries)
    }

    /// Ensure the worktree is clean, allowing entries with any of the given prefixes.
    #[instrument(skip_all)]
    pub fn ensure_clean_except_prefixes(&self, allowed_prefixes: &[&str]) -> Result<()> {
        let entries = self.status_porcelain()?;
        let disallowed: Vec<StatusEntry> = entries
            .into_iter()
            .filter(|entry| {
                !allowed_prefixes
                    .iter()
                    .any(|prefix| entry.path.starts_with(prefix))
            })
            .collect();
        if disallowed.is_empty() {
            debug!("worktree is clean");
            return Ok(());
        }
        warn!(disallowed_count = disallowed.len(), "worktree not clean");
        let mut msg = String::from("working tree not clean:\n");
        for entry in disallowed {
            msg.push_str(&format!("{} {}\n", entry.code, entry.path));
        }
        Err(anyhow!(msg.trim_end().to_string()))
    }

    /// Check whether a local branch exists.
    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let status = self
            .run(&[
                "show-ref",
                "--verify",
                "--quiet",
                &format!("refs/heads/{branch}"),
            ])?
            .status;
        Ok(status.success())
    }

    /// Create `branch` at `start_point` and check it out.
    #[instrument(skip_all, fields(branch, start_point))]
    pub fn checkout_new_branch(&self, branch: &str, start_point: &str) -> Result<()> {
        debug!(branch, start_point, "creating and checking out new branch");
        self.run_checked(&["checkout", "-b", branch, start_point])?;
        Ok(())
    }

    /// Checkout an existing branch.
    #[instrument(skip_all, fields(branch))]
    pub fn checkout_branch(&self, branch: &str) -> Result<()> {
        debug!(branch, "checking out branch");
        self.run_checked(&["checkout", branch])?;
        Ok(())
    }

    /// Check out `branch`, creating it from `base` if it does not exist yet.
    /// Uncommitted changes travel with the checkout.
    pub fn switch_or_create(&self, branch: &str, base: &str) -> Result<()> {
        if self.current_branch().ok().as_deref() == Some(branch) {
            return Ok(());
        }
        if self.branch_exists(branch)? {
            self.checkout_branch(branch)
        } else {
            self.checkout_new_branch(branch, base)
        }
    }

    /// Stage all changes except paths under the given top-level directories.
    pub fn add_all_except(&self, excluded: &[&str]) -> Result<()> {
        let mut args: Vec<String> = vec!["add".into(), "-A".into(), "--".into(), ".".into()];
        args.extend(excluded.iter().map(|dir| format!(":(exclude){dir}")));
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run_checked(&args)?;
        Ok(())
    }

    /// True if there is anything staged for commit.
    pub fn has_staged_changes(&self) -> Result<bool> {
        let out = self.run(&["diff", "--cached", "--name-only"])?;
        Ok(!String::from_utf8_lossy(&out.stdout).trim().is_empty())
    }

    /// Commit staged changes with a message.
    ///
    /// If there are no staged changes, this returns Ok(false) and does nothing.
    #[instrument(skip_all)]
    pub fn commit_staged(&self, message: &str) -> Result<bool> {
        if !self.has_staged_changes()? {
            debug!("no staged changes, skipping commit");
            return Ok(false);
        }
        debug!("committing staged changes");
        self.run_checked(&["commit", "-m", message])?;
        Ok(true)
    }

    /// Configured URL of a remote.
    pub fn remote_url(&self, remote: &str) -> Result<String> {
        let out = self.run_capture(&["remote", "get-url", remote])?;
        Ok(out.trim().to_string())
    }

    /// Unified diff between the merge base of `base` and `head`, and `head`.
    pub fn diff_three_dot(&self, base: &str, head: &str) -> Result<String> {
        self.run_capture(&["diff", "--no-color", "--no-ext-diff", &format!("{base}...{head}")])
    }

    /// Dry-run merge of `head` into `base` without touching the work tree.
    #[instrument(skip_all, fields(base, head))]
    pub fn merge_tree_check(&self, base: &str, head: &str) -> Result<MergeCheck> {
        let out = self.run(&[
            "merge-tree",
            "--write-tree",
            "--name-only",
            "--no-messages",
            base,
            head,
        ])?;
        match out.status.code() {
            Some(0) => Ok(MergeCheck::Clean),
            Some(1) => {
                let stdout = String::from_utf8_lossy(&out.stdout);
                // First line is the tree id; the rest are conflicted paths.
                let files = stdout
                    .lines()
                    .skip(1)
                    .map(str::trim)
                    .filter(|line| !line.is_empty())
                    .map(str::to_string)
                    .collect();
                Ok(MergeCheck::Conflicts(files))
            }
            _ => Err(anyhow!(
                "git merge-tree failed (git >= 2.38 required): {}",
                String::from_utf8_lossy(&out.stderr).trim()
            )),
        }
    }

    /// Merge `branch` into the current branch with a merge commit.
    #[instrument(skip_all, fields(branch))]
    pub fn merge_no_ff(&self, branch: &str, message: &str) -> Result<()> {
        self.run_checked(&["merge", "--no-ff", "-m", message, branch])?;
        Ok(())
    }

    /// Abort an in-progress merge, ignoring "no merge in progress".
    pub fn merge_abort(&self) {
        let _ = self.run(&["merge", "--abort"]);
    }

    /// Push `branch` to `remote`, setting upstream.
    #[instrument(skip_all, fields(remote, branch))]
    pub fn push(&self, remote: &str, branch: &str) -> Result<()> {
        self.run_checked(&["push", "--set-upstream", remote, branch])?;
        Ok(())
    }

    /// SHA the remote reports for `refs/heads/<branch>`, if any.
    pub fn ls_remote_head(&self, remote: &str, branch: &str) -> Result<Option<String>> {
        let out = self.run_capture(&["ls-remote", remote, &format!("refs/heads/{branch}")])?;
        Ok(out
            .lines()
            .filter_map(|line| line.split_whitespace().next())
            .next()
            .map(str::to_string))
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: unquote(path.trim()),
        });
    }
    if line.len() < 4 {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once(" -> ") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry {
        code,
        path: unquote(&path),
    })
}

// Porcelain quotes paths with unusual characters.
fn unquote(path: &str) -> String {
    path.strip_prefix('"')
        .and_then(|p| p.strip_suffix('"'))
        .unwrap_or(path)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestRepo;

    #[test]
    fn parses_untracked_line() {
        let e = parse_status_line("?? foo.txt").expect("parse");
        assert_eq!(
            e,
            StatusEntry {
                code: "??".to_string(),
                path: "foo.txt".to_string()
            }
        );
    }

    #[test]
    fn parses_rename_line_uses_new_path() {
        let e = parse_status_line("R  old.txt -> new.txt").expect("parse");
        assert_eq!(e.path, "new.txt");
    }

    #[test]
    fn parses_quoted_path() {
        let e = parse_status_line(" M \"with space.txt\"").expect("parse");
        assert_eq!(e.path, "with space.txt");
    }

    #[test]
    fn merge_tree_reports_conflicts() {
        let repo = TestRepo::new().expect("repo");
        let git = Git::new(repo.path());
        git.checkout_new_branch("feature", "main").expect("branch");
        repo.write("README.md", "feature side\n").expect("write");
        repo.commit_all("feature edit").expect("commit");
        git.checkout_branch("main").expect("main");
        repo.write("README.md", "main side\n").expect("write");
        repo.commit_all("main edit").expect("commit");

        match git.merge_tree_check("main", "feature").expect("check") {
            MergeCheck::Conflicts(files) => assert_eq!(files, vec!["README.md".to_string()]),
            MergeCheck::Clean => panic!("expected conflict"),
        }
    }

    #[test]
    fn push_and_ls_remote_agree() {
        let repo = TestRepo::with_remote().expect("repo");
        let git = Git::new(repo.path());
        git.push("origin", "main").expect("push");
        let remote = git.ls_remote_head("origin", "main").expect("ls-remote");
        assert_eq!(remote, Some(git.head_sha().expect("head")));
        assert_eq!(git.ls_remote_head("origin", "nope").expect("ls-remote"), None);
    }
}
