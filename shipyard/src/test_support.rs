//! Test-only helpers: git fixtures, scripted collaborators, record builders.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::AtomicBool;
use std::sync::Mutex;

use anyhow::{Context, Result, anyhow, bail};
use chrono::Utc;
use tempfile::TempDir;

use crate::agent::{Agent, AgentRequest, AgentResult, CompletionReason, Launcher, MockAgent};
use crate::backlog::{BACKLOG_SCHEMA_VERSION, Backlog, Story, StoryStatus};
use crate::compute::BackendError;
use crate::compute::vm::{VmInstance, VmProvider, VmSpec};
use crate::core::states::Phase;
use crate::io::config::Config;
use crate::io::gates::{GateOutcome, GateRequest, GateRunner};
use crate::io::init::{InitOptions, init_store};
use crate::io::paths::StorePaths;
use crate::io::review::{ReviewHost, ReviewRef, ReviewRequest, ReviewState, ReviewStatus};
use crate::io::store::Store;
use crate::item::{Item, ItemState};

pub const MOCK_SIGNAL: &str = "<promise>COMPLETE</promise>";

/// Throwaway git repository on `main` with one commit, optionally with a bare `origin`.
pub struct TestRepo {
    dir: TempDir,
    /// Kept alive for the repo's lifetime.
    _remote: Option<TempDir>,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir().context("create repo dir")?;
        let repo = Self { dir, _remote: None };
        repo.git(&["init", "-q", "-b", "main"])?;
        repo.git(&["config", "user.email", "test@example.com"])?;
        repo.git(&["config", "user.name", "Test"])?;
        repo.git(&["config", "commit.gpgsign", "false"])?;
        repo.write("README.md", "# fixture\n")?;
        repo.commit_all("initial")?;
        Ok(repo)
    }

    /// Repository with a bare `origin` that already has `main`.
    pub fn with_remote() -> Result<Self> {
        let mut repo = Self::new()?;
        let remote = tempfile::tempdir().context("create remote dir")?;
        run_git(remote.path(), &["init", "-q", "--bare", "-b", "main"])?;
        let url = remote.path().to_string_lossy().into_owned();
        repo.git(&["remote", "add", "origin", &url])?;
        repo.git(&["push", "-q", "-u", "origin", "main"])?;
        repo._remote = Some(remote);
        Ok(repo)
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn write(&self, relative: &str, contents: &str) -> Result<PathBuf> {
        let path = self.path().join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))?;
        Ok(path)
    }

    pub fn commit_all(&self, message: &str) -> Result<()> {
        self.git(&["add", "-A"])?;
        self.git(&["commit", "-q", "--allow-empty", "-m", message])?;
        Ok(())
    }

    /// Run git in the working tree and return trimmed stdout.
    pub fn git(&self, args: &[&str]) -> Result<String> {
        run_git(self.path(), args)
    }

    /// Initialize a store with `config` and commit the scaffolding.
    pub fn init_store(&self, config: &Config) -> Result<Store> {
        let store = Store::new(StorePaths::new(self.path()), config.lock.settings());
        init_store(&store, config, InitOptions::default())?;
        self.commit_all("init shipyard")?;
        Ok(store)
    }
}

fn run_git(dir: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .with_context(|| format!("spawn git {}", args.join(" ")))?;
    if !output.status.success() {
        bail!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Wraps the mock agent and records every invocation.
pub struct RecordingAgent {
    inner: MockAgent,
    calls: Mutex<Vec<(String, Phase)>>,
    failing: Vec<String>,
    panicking: Vec<String>,
}

impl Default for RecordingAgent {
    fn default() -> Self {
        Self {
            inner: MockAgent::new(MOCK_SIGNAL),
            calls: Mutex::new(Vec::new()),
            failing: Vec::new(),
            panicking: Vec::new(),
        }
    }
}

impl RecordingAgent {
    /// Exits non-zero for `item_id`; every other item runs the mock.
    pub fn failing_on(item_id: &str) -> Self {
        Self {
            failing: vec![item_id.to_string()],
            ..Self::default()
        }
    }

    /// Panics inside `invoke` for `item_id`.
    pub fn panicking_on(item_id: &str) -> Self {
        Self {
            panicking: vec![item_id.to_string()],
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<(String, Phase)> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

impl Agent for RecordingAgent {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn invoke(
        &self,
        request: &AgentRequest,
        launcher: &dyn Launcher,
        cancel: &AtomicBool,
    ) -> Result<AgentResult> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push((request.item_id.clone(), request.phase));
        }
        if self.panicking.contains(&request.item_id) {
            panic!("agent crashed on {}", request.item_id);
        }
        if self.failing.contains(&request.item_id) {
            let mut result = AgentResult::new(CompletionReason::ExitedNonZero);
            result.exit_code = Some(1);
            return Ok(result);
        }
        self.inner.invoke(request, launcher, cancel)
    }
}

/// Returns queued results in order; errors once the queue is empty.
#[derive(Default)]
pub struct ScriptedAgent {
    results: Mutex<VecDeque<AgentResult>>,
    requests: Mutex<Vec<AgentRequest>>,
}

impl ScriptedAgent {
    pub fn new(results: impl IntoIterator<Item = AgentResult>) -> Self {
        Self {
            results: Mutex::new(results.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<AgentRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl Agent for ScriptedAgent {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn invoke(
        &self,
        request: &AgentRequest,
        _launcher: &dyn Launcher,
        _cancel: &AtomicBool,
    ) -> Result<AgentResult> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        self.results
            .lock()
            .map_err(|_| anyhow!("scripted agent poisoned"))?
            .pop_front()
            .ok_or_else(|| anyhow!("scripted agent has no result for {}", request.phase))
    }
}

#[derive(Debug, Default)]
struct ReviewLog {
    created: Vec<ReviewRequest>,
    status: Option<ReviewStatus>,
}

/// In-memory review host. Requests start open; tests flip them to merged or closed.
#[derive(Debug, Default)]
pub struct FakeReviewHost {
    state: Mutex<ReviewLog>,
}

impl FakeReviewHost {
    pub const NUMBER: u64 = 42;

    pub fn created(&self) -> Vec<ReviewRequest> {
        self.state.lock().map(|s| s.created.clone()).unwrap_or_default()
    }

    pub fn set_status(&self, status: ReviewStatus) {
        if let Ok(mut state) = self.state.lock() {
            state.status = Some(status);
        }
    }

    pub fn merge(&self, base_branch: &str, merge_commit: &str) {
        self.set_status(ReviewStatus {
            state: ReviewState::Merged,
            merged_at: Some(Utc::now()),
            merge_commit: Some(merge_commit.to_string()),
            base_branch: base_branch.to_string(),
            mergeable: None,
            checks_passed: Some(true),
        });
    }
}

impl ReviewHost for FakeReviewHost {
    fn create_or_update(&self, _workdir: &Path, request: &ReviewRequest) -> Result<ReviewRef> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| anyhow!("review host poisoned"))?;
        state.created.push(request.clone());
        Ok(ReviewRef {
            number: Self::NUMBER,
            url: format!("https://review.example/pull/{}", Self::NUMBER),
        })
    }

    fn status(&self, _workdir: &Path, number: u64) -> Result<ReviewStatus> {
        let state = self
            .state
            .lock()
            .map_err(|_| anyhow!("review host poisoned"))?;
        if number != Self::NUMBER {
            bail!("no review request #{number}");
        }
        Ok(state.status.clone().unwrap_or(ReviewStatus {
            state: ReviewState::Open,
            merged_at: None,
            merge_commit: None,
            base_branch: state
                .created
                .last()
                .map(|r| r.base_branch.clone())
                .unwrap_or_else(|| "main".to_string()),
            mergeable: Some(true),
            checks_passed: None,
        }))
    }
}

/// VM provider that runs commands on the host and tracks VMs in memory.
#[derive(Debug, Default)]
pub struct FakeVmProvider {
    vms: Mutex<Vec<VmInstance>>,
    launched: Mutex<Vec<VmSpec>>,
    deleted: Mutex<Vec<String>>,
    unavailable: bool,
}

impl FakeVmProvider {
    pub fn with_vms(vms: Vec<VmInstance>) -> Self {
        Self {
            vms: Mutex::new(vms),
            ..Self::default()
        }
    }

    /// Provider whose binary is missing.
    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::default()
        }
    }

    pub fn launched(&self) -> Vec<VmSpec> {
        self.launched.lock().map(|l| l.clone()).unwrap_or_default()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().map(|d| d.clone()).unwrap_or_default()
    }

    pub fn running(&self) -> Vec<String> {
        self.vms
            .lock()
            .map(|vms| vms.iter().map(|vm| vm.name.clone()).collect())
            .unwrap_or_default()
    }
}

impl VmProvider for FakeVmProvider {
    fn check_available(&self) -> Result<(), BackendError> {
        if self.unavailable {
            return Err(BackendError::BinaryMissing {
                binary: "fake-vm".to_string(),
            });
        }
        Ok(())
    }

    fn launch(&self, spec: &VmSpec) -> Result<(), BackendError> {
        if let Ok(mut launched) = self.launched.lock() {
            launched.push(spec.clone());
        }
        if let Ok(mut vms) = self.vms.lock() {
            vms.push(VmInstance {
                name: spec.name.clone(),
                state: "Running".to_string(),
            });
        }
        Ok(())
    }

    fn exec_command(&self, _name: &str, _workdir: &str, program: &str, args: &[String]) -> Command {
        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd
    }

    fn delete(&self, name: &str) -> Result<(), BackendError> {
        if let Ok(mut vms) = self.vms.lock() {
            vms.retain(|vm| vm.name != name);
        }
        if let Ok(mut deleted) = self.deleted.lock() {
            deleted.push(name.to_string());
        }
        Ok(())
    }

    fn list(&self) -> Result<Vec<VmInstance>, BackendError> {
        Ok(self.vms.lock().map(|v| v.clone()).unwrap_or_default())
    }
}

/// Gate runner that fails any command containing one of `failing` and records the rest.
#[derive(Debug, Default)]
pub struct ScriptedGates {
    failing: Vec<String>,
    seen: Mutex<Vec<Vec<String>>>,
}

impl ScriptedGates {
    pub fn passing() -> Self {
        Self::default()
    }

    pub fn failing_on(needle: &str) -> Self {
        Self {
            failing: vec![needle.to_string()],
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn seen(&self) -> Vec<Vec<String>> {
        self.seen.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

impl GateRunner for ScriptedGates {
    fn run(&self, request: &GateRequest) -> Result<GateOutcome> {
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(request.command.clone());
        }
        let joined = request.command.join(" ");
        if self.failing.iter().any(|needle| joined.contains(needle.as_str())) {
            return Ok(GateOutcome::Fail {
                exit_code: Some(1),
                timed_out: false,
            });
        }
        Ok(GateOutcome::Pass)
    }
}

/// Item in `state` with a fixed title derived from the id.
pub fn item(id: &str, state: ItemState) -> Item {
    let mut item = Item::new(id, format!("{id} title"), Utc::now());
    item.state = state;
    item
}

pub fn story(id: &str, priority: u8, status: StoryStatus) -> Story {
    Story {
        id: id.to_string(),
        title: format!("{id} title"),
        acceptance_criteria: vec![
            format!("{id} works"),
            format!("{id} is covered by tests"),
        ],
        priority,
        status,
        notes: String::new(),
    }
}

pub fn backlog(item_id: &str, stories: Vec<Story>) -> Backlog {
    Backlog {
        schema_version: BACKLOG_SCHEMA_VERSION,
        id: item_id.to_string(),
        branch_name: format!("shipyard/{item_id}"),
        user_stories: stories,
    }
}
