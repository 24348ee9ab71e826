//! End-to-end item lifecycle against real git repositories and the mock agent.
//!
//! These tests drive the phase executors through the public API: idea to done
//! by direct merge, idea to an open review request and its completion, and
//! idempotent re-runs that must not invoke the agent.

use std::fs;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use chrono::Utc;
use shipyard::agent::{Agent, AgentRequest, AgentResult, CompletionReason, Launcher};
use shipyard::compute::local::LocalBackend;
use shipyard::core::states::Phase;
use shipyard::interrupt::Interrupt;
use shipyard::io::config::{AgentKind, Config, MergeMode};
use shipyard::io::store::Store;
use shipyard::item::ItemState;
use shipyard::phases::{OutcomeKind, PhaseContext, PhaseError, run_item, run_phase};
use shipyard::test_support::{FakeReviewHost, RecordingAgent, ScriptedGates, TestRepo};

fn mock_config(mode: MergeMode) -> Config {
    let mut config = Config::default();
    config.agent.kind = AgentKind::Mock;
    config.merge_mode = mode;
    config
}

struct Harness {
    agent: Arc<RecordingAgent>,
    backend: LocalBackend,
    review: FakeReviewHost,
    gates: ScriptedGates,
    interrupt: Interrupt,
}

impl Harness {
    fn new(config: &Config) -> Self {
        let agent = Arc::new(RecordingAgent::default());
        let backend = LocalBackend::new(agent.clone(), &config.agent);
        Self {
            agent,
            backend,
            review: FakeReviewHost::default(),
            gates: ScriptedGates::passing(),
            interrupt: Interrupt::new(),
        }
    }

    fn context<'a>(&'a self, store: &'a Store, config: &'a Config) -> PhaseContext<'a> {
        PhaseContext::new(
            store,
            config,
            &self.backend,
            &self.review,
            &self.gates,
            &self.interrupt,
        )
    }
}

/// Idea to done in direct mode: research, plan, two implementation
/// iterations, then a verified merge pushed to a bare origin.
#[test]
fn direct_mode_takes_an_idea_to_merged() {
    let repo = TestRepo::with_remote().expect("repo");
    let config = mock_config(MergeMode::Direct);
    let store = repo.init_store(&config).expect("init store");
    let item = store.create_item("Add parser", Utc::now()).expect("create");
    let harness = Harness::new(&config);
    let ctx = harness.context(&store, &config);

    let outcomes = run_item(&ctx, &item.id, false).expect("run item");
    let phases: Vec<Phase> = outcomes.iter().map(|o| o.phase).collect();
    assert_eq!(
        phases,
        vec![Phase::Research, Phase::Plan, Phase::Implement, Phase::Pr]
    );

    let done = store.read_item(&item.id).expect("read");
    assert_eq!(done.state, ItemState::Done);
    assert_eq!(done.last_error, None);
    assert!(done.rollback_sha.is_some());
    let completion = done.completion.expect("completion metadata");
    let main_head = repo.git(&["rev-parse", "main"]).expect("rev-parse");
    assert_eq!(completion.merge_commit.as_deref(), Some(main_head.as_str()));
    let remote = repo.git(&["ls-remote", "origin", "refs/heads/main"]).expect("ls-remote");
    assert!(remote.starts_with(&main_head), "origin main is {remote}");

    // One story per implementation iteration, both committed.
    let implement_calls = harness
        .agent
        .calls()
        .iter()
        .filter(|(_, phase)| *phase == Phase::Implement)
        .count();
    assert_eq!(implement_calls, 2);
    let backlog = store.read_prd(&item.id).expect("prd");
    assert!(backlog.all_done());
    assert!(repo.path().join("mock-output").join(&item.id).join("US-001.md").is_file());
}

/// PR mode stops at in_pr; complete waits for the merge, then finishes.
#[test]
fn pr_mode_waits_for_review_merge() {
    let repo = TestRepo::with_remote().expect("repo");
    let config = mock_config(MergeMode::Pr);
    let store = repo.init_store(&config).expect("init store");
    let item = store.create_item("Dark mode", Utc::now()).expect("create");
    let harness = Harness::new(&config);
    let ctx = harness.context(&store, &config);

    let outcomes = run_item(&ctx, &item.id, false).expect("run item");
    assert_eq!(outcomes.last().map(|o| o.to), Some(ItemState::InPr));
    let in_pr = store.read_item(&item.id).expect("read");
    assert_eq!(in_pr.pr_number, Some(FakeReviewHost::NUMBER));
    let created = harness.review.created();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].head_branch, format!("shipyard/{}", item.id));
    assert_eq!(created[0].base_branch, "main");

    let branch_on_remote = repo
        .git(&["ls-remote", "origin", &format!("refs/heads/shipyard/{}", item.id)])
        .expect("ls-remote");
    assert!(!branch_on_remote.is_empty());

    let err = run_phase(&ctx, &item.id, Phase::Complete, false).expect_err("not merged yet");
    assert!(matches!(err, PhaseError::AwaitingMerge { number } if number == FakeReviewHost::NUMBER));
    assert!(err.is_retryable());
    assert_eq!(store.read_item(&item.id).expect("read").state, ItemState::InPr);

    harness.review.merge("main", "abc1234");
    let outcome = run_phase(&ctx, &item.id, Phase::Complete, false).expect("complete");
    assert_eq!(outcome.to, ItemState::Done);
    let done = store.read_item(&item.id).expect("read");
    let completion = done.completion.expect("completion");
    assert_eq!(completion.merge_commit.as_deref(), Some("abc1234"));
    assert_eq!(completion.checks_passed, Some(true));
}

/// A valid research artifact already on disk advances without an agent
/// call; running research again is a no-op.
#[test]
fn research_with_existing_artifact_skips_the_agent() {
    let repo = TestRepo::new().expect("repo");
    let config = mock_config(MergeMode::Pr);
    let store = repo.init_store(&config).expect("init store");
    let item = store.create_item("Cache results", Utc::now()).expect("create");
    fs::write(
        store.paths().research(&item.id),
        "# Research\n\n## Summary\n\nCache lookups.\n\n## Findings\n\n\
         - `src/cache.rs:12` holds the map.\n\
         - `src/lookup.rs:40` is the hot path.\n\
         - `src/main.rs:3` wires both.\n",
    )
    .expect("write research");
    let harness = Harness::new(&config);
    let ctx = harness.context(&store, &config);

    let first = run_phase(&ctx, &item.id, Phase::Research, false).expect("research");
    assert_eq!(first.to, ItemState::Researched);
    assert!(!first.agent_invoked);

    let second = run_phase(&ctx, &item.id, Phase::Research, false).expect("research again");
    assert_eq!(second.kind, OutcomeKind::Skipped);
    assert_eq!(second.to, ItemState::Researched);
    assert!(harness.agent.calls().is_empty());
}

/// Out-of-order phases are rejected: the state stays put and the reason is
/// recorded on the item.
#[test]
fn precondition_failure_is_recorded_without_moving_state() {
    let repo = TestRepo::new().expect("repo");
    let config = mock_config(MergeMode::Pr);
    let store = repo.init_store(&config).expect("init store");
    let item = store.create_item("Out of order", Utc::now()).expect("create");
    let harness = Harness::new(&config);
    let ctx = harness.context(&store, &config);

    let err = run_phase(&ctx, &item.id, Phase::Implement, false).expect_err("idea cannot implement");
    assert!(matches!(err, PhaseError::Precondition(_)));
    assert!(!err.is_retryable());
    let after = store.read_item(&item.id).expect("read after");
    assert_eq!(after.state, ItemState::Idea);
    let last_error = after.last_error.expect("last error recorded");
    assert!(last_error.contains("implement cannot start from state idea"), "{last_error}");
    assert!(harness.agent.calls().is_empty());
}

/// A dry run of an out-of-order phase still writes nothing.
#[test]
fn dry_run_precondition_failure_writes_nothing() {
    let repo = TestRepo::new().expect("repo");
    let config = mock_config(MergeMode::Pr);
    let store = repo.init_store(&config).expect("init store");
    let item = store.create_item("Out of order", Utc::now()).expect("create");
    let before = fs::read(store.paths().item_file(&item.id)).expect("read before");
    let harness = Harness::new(&config);
    let ctx = harness.context(&store, &config).with_dry_run(true);

    run_phase(&ctx, &item.id, Phase::Pr, false).expect_err("idea cannot deliver");
    let after = fs::read(store.paths().item_file(&item.id)).expect("read after");
    assert_eq!(before, after);
}

/// Dry run reports the next step and writes nothing.
#[test]
fn dry_run_does_not_invoke_or_write() {
    let repo = TestRepo::new().expect("repo");
    let config = mock_config(MergeMode::Pr);
    let store = repo.init_store(&config).expect("init store");
    let item = store.create_item("Preview", Utc::now()).expect("create");
    let harness = Harness::new(&config);
    let ctx = harness.context(&store, &config).with_dry_run(true);

    let outcome = run_phase(&ctx, &item.id, Phase::Research, false).expect("dry run");
    assert_eq!(outcome.kind, OutcomeKind::DryRun);
    assert!(harness.agent.calls().is_empty());
    assert!(!store.paths().research(&item.id).exists());
    assert_eq!(store.read_item(&item.id).expect("read").state, ItemState::Idea);
}

/// A failing quality gate stops delivery before anything leaves the machine.
#[test]
fn failing_gate_blocks_delivery() {
    let repo = TestRepo::with_remote().expect("repo");
    let mut config = mock_config(MergeMode::Direct);
    config.merge.quality_gates = vec![vec!["make".to_string(), "check".to_string()]];
    let store = repo.init_store(&config).expect("init store");
    let remote_before = repo.git(&["ls-remote", "origin", "refs/heads/main"]).expect("ls-remote");
    let item = store.create_item("Gated change", Utc::now()).expect("create");
    let mut harness = Harness::new(&config);
    harness.gates = ScriptedGates::failing_on("make check");
    let ctx = harness.context(&store, &config);

    let err = run_item(&ctx, &item.id, false).expect_err("gate fails");
    assert!(matches!(err, PhaseError::Quality(_)), "{err}");
    assert_eq!(harness.gates.seen(), vec![vec!["make".to_string(), "check".to_string()]]);

    let after = store.read_item(&item.id).expect("read");
    assert_eq!(after.state, ItemState::Implementing);
    assert!(after.last_error.as_deref().is_some_and(|e| e.contains("make check")));
    assert_eq!(after.rollback_sha, None);
    let remote_after = repo.git(&["ls-remote", "origin", "refs/heads/main"]).expect("ls-remote");
    assert_eq!(remote_before, remote_after);
}

/// Research agent that also writes a plan ahead of time.
struct PlanningAheadAgent;

impl Agent for PlanningAheadAgent {
    fn name(&self) -> &'static str {
        "planning-ahead"
    }

    fn invoke(
        &self,
        request: &AgentRequest,
        _launcher: &dyn Launcher,
        _cancel: &AtomicBool,
    ) -> anyhow::Result<AgentResult> {
        fs::write(
            &request.research_path,
            "# Research\n\n## Summary\n\nFast.\n\n## Findings\n\n\
             - `src/a.rs:1`\n- `src/b.rs:2`\n- `src/c.rs:3`\n",
        )?;
        fs::write(
            &request.plan_path,
            "# Plan\n\n## Overview\n\nx\n\n## Implementation Plan\n\ny\n",
        )?;
        Ok(AgentResult::new(CompletionReason::SignalFound))
    }
}

/// Research may write research.md only; a plan written during research is a
/// scope violation and the item stays an idea.
#[test]
fn research_writing_the_plan_is_a_scope_violation() {
    let repo = TestRepo::new().expect("repo");
    let config = mock_config(MergeMode::Pr);
    let store = repo.init_store(&config).expect("init store");
    let item = store.create_item("Eager agent", Utc::now()).expect("create");
    let backend = LocalBackend::new(Arc::new(PlanningAheadAgent), &config.agent);
    let review = FakeReviewHost::default();
    let gates = ScriptedGates::passing();
    let interrupt = Interrupt::new();
    let ctx = PhaseContext::new(&store, &config, &backend, &review, &gates, &interrupt);

    let err = run_phase(&ctx, &item.id, Phase::Research, false).expect_err("out of scope");
    let PhaseError::ScopeViolation(paths) = &err else {
        panic!("expected scope violation, got {err}");
    };
    assert_eq!(paths, &vec![format!(".shipyard/items/{}/plan.md", item.id)]);
    let after = store.read_item(&item.id).expect("read");
    assert_eq!(after.state, ItemState::Idea);
    assert!(after.last_error.is_some());
}
