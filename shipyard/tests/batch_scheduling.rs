//! Batch scheduling over real repositories: dependency order, failure
//! isolation, panicking workers and dependency cycles.

use std::sync::Arc;

use chrono::Utc;
use shipyard::batch::{BatchEvent, BatchOptions, BatchReport, run_batch};
use shipyard::compute::local::LocalBackend;
use shipyard::interrupt::Interrupt;
use shipyard::io::config::{AgentKind, Config, MergeMode};
use shipyard::io::store::Store;
use shipyard::item::ItemState;
use shipyard::phases::PhaseContext;
use shipyard::test_support::{FakeReviewHost, RecordingAgent, ScriptedGates, TestRepo};

fn direct_config() -> Config {
    let mut config = Config::default();
    config.agent.kind = AgentKind::Mock;
    config.merge_mode = MergeMode::Direct;
    config
}

fn options(parallel: usize) -> BatchOptions {
    BatchOptions {
        parallel,
        resume: false,
        retry_failed: false,
        force: false,
    }
}

fn add(store: &Store, title: &str, depends_on: &[&str]) -> String {
    let mut item = store.create_item(title, Utc::now()).expect("create");
    if !depends_on.is_empty() {
        item.depends_on = depends_on.iter().map(|d| d.to_string()).collect();
        store.write_item(&item).expect("write deps");
    }
    item.id
}

/// Runs a batch and returns the report plus a flat event log.
fn batch(
    store: &Store,
    config: &Config,
    agent: Arc<RecordingAgent>,
    parallel: usize,
) -> (BatchReport, Vec<String>) {
    let backend = LocalBackend::new(agent, &config.agent);
    let review = FakeReviewHost::default();
    let gates = ScriptedGates::passing();
    let interrupt = Interrupt::new();
    let ctx = PhaseContext::new(store, config, &backend, &review, &gates, &interrupt);
    let mut events = Vec::new();
    let report = run_batch(&ctx, &options(parallel), |event| match event {
        BatchEvent::Started { item_id, phase } => events.push(format!("start {item_id} {phase}")),
        BatchEvent::Advanced { outcome } => {
            events.push(format!("reach {} {}", outcome.item_id, outcome.to));
        }
        BatchEvent::Failed { item_id, .. } => events.push(format!("fail {item_id}")),
    })
    .expect("batch");
    (report, events)
}

fn position(events: &[String], wanted: &str) -> usize {
    events
        .iter()
        .position(|event| event == wanted)
        .unwrap_or_else(|| panic!("no `{wanted}` in {events:#?}"))
}

/// With B depending on A, B starts only after A is done, even with a free worker.
#[test]
fn dependent_starts_after_dependency_is_done() {
    let repo = TestRepo::with_remote().expect("repo");
    let config = direct_config();
    let store = repo.init_store(&config).expect("init store");
    let first = add(&store, "Storage layer", &[]);
    let second = add(&store, "Query api", &[first.as_str()]);
    let agent = Arc::new(RecordingAgent::default());

    let (report, events) = batch(&store, &config, agent.clone(), 2);

    assert!(report.failed.is_empty(), "{:?}", report.failed);
    assert!(report.remaining.is_empty());
    let first_done = position(&events, &format!("reach {first} done"));
    let second_start = position(&events, &format!("start {second} research"));
    assert!(first_done < second_start, "{events:#?}");

    let calls = agent.calls();
    let last_first = calls.iter().rposition(|(id, _)| *id == first).expect("first called");
    let first_second = calls.iter().position(|(id, _)| *id == second).expect("second called");
    assert!(last_first < first_second);
    for id in [&first, &second] {
        assert_eq!(store.read_item(id).expect("read").state, ItemState::Done);
    }
}

/// One item's agent failure is recorded on that item only; its sibling
/// still reaches done.
#[test]
fn failing_item_does_not_stop_its_sibling() {
    let repo = TestRepo::with_remote().expect("repo");
    let config = direct_config();
    let store = repo.init_store(&config).expect("init store");
    let broken = add(&store, "Flaky import", &[]);
    let healthy = add(&store, "Steady export", &[]);
    let agent = Arc::new(RecordingAgent::failing_on(&broken));

    let (report, events) = batch(&store, &config, agent.clone(), 2);

    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, broken);
    assert!(report.completed.contains(&healthy));
    assert!(events.contains(&format!("fail {broken}")));

    let failed = store.read_item(&broken).expect("read broken");
    assert_eq!(failed.state, ItemState::Idea);
    assert!(failed.last_error.is_some());
    let done = store.read_item(&healthy).expect("read healthy");
    assert_eq!(done.state, ItemState::Done);
    assert_eq!(done.last_error, None);

    // Failures are not retried inside the same run.
    let broken_calls = agent.calls().iter().filter(|(id, _)| *id == broken).count();
    assert_eq!(broken_calls, 1);
    // A failed item keeps the checkpoint for a later --retry-failed.
    assert!(store.paths().checkpoint().is_file());
}

/// A worker that panics is reported as failed and the batch still finishes.
#[test]
fn panicking_worker_is_reported_as_failed() {
    let repo = TestRepo::with_remote().expect("repo");
    let config = direct_config();
    let store = repo.init_store(&config).expect("init store");
    let crashing = add(&store, "Crashing step", &[]);
    let healthy = add(&store, "Calm step", &[]);
    let agent = Arc::new(RecordingAgent::panicking_on(&crashing));

    let (report, _) = batch(&store, &config, agent, 2);

    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, crashing);
    assert!(report.failed[0].1.contains("panicked"), "{:?}", report.failed);
    assert!(report.completed.contains(&healthy));
    let crashed = store.read_item(&crashing).expect("read crashed");
    assert_eq!(crashed.state, ItemState::Idea);
    assert!(crashed.last_error.as_deref().is_some_and(|e| e.contains("panicked")));
}

/// Both members of a cycle are skipped without any agent call.
#[test]
fn cycle_members_are_skipped_unscheduled() {
    let repo = TestRepo::new().expect("repo");
    let config = direct_config();
    let store = repo.init_store(&config).expect("init store");
    let first = add(&store, "Chicken", &[]);
    let second = add(&store, "Egg", &[first.as_str()]);
    let mut looped = store.read_item(&first).expect("read");
    looped.depends_on = vec![second.clone()];
    store.write_item(&looped).expect("close the cycle");
    let agent = Arc::new(RecordingAgent::default());

    let (report, events) = batch(&store, &config, agent.clone(), 2);

    let mut skipped: Vec<String> = report.skipped.iter().map(|(id, _)| id.clone()).collect();
    skipped.sort();
    assert_eq!(skipped, vec![first.clone(), second.clone()]);
    assert!(report.failed.is_empty());
    assert!(events.is_empty(), "{events:#?}");
    assert!(agent.calls().is_empty());
    for id in [&first, &second] {
        assert_eq!(store.read_item(id).expect("read").state, ItemState::Idea);
    }
}
