//! Batch checkpoint handling: crash resume, refusal next to a live batch,
//! and starting over.

use std::fs;
use std::sync::Arc;

use chrono::{Duration, Utc};
use shipyard::backlog::StoryStatus;
use shipyard::batch::{BatchEvent, BatchOptions, run_batch};
use shipyard::compute::local::LocalBackend;
use shipyard::interrupt::Interrupt;
use shipyard::io::checkpoint::{Checkpoint, load_checkpoint, write_checkpoint};
use shipyard::io::config::{AgentKind, Config};
use shipyard::io::init::{InitOptions, init_store};
use shipyard::io::paths::StorePaths;
use shipyard::io::store::Store;
use shipyard::item::ItemState;
use shipyard::phases::PhaseContext;
use shipyard::test_support::{FakeReviewHost, RecordingAgent, ScriptedGates, backlog, item, story};

const IDS: [&str; 5] = ["001-a", "002-b", "003-c", "004-d", "005-e"];
/// Far above any real pid limit, so never alive.
const DEAD_PID: u32 = 4_000_000;

fn config() -> Config {
    let mut config = Config::default();
    config.agent.kind = AgentKind::Mock;
    config
}

fn fresh_store(dir: &std::path::Path, config: &Config) -> Store {
    let store = Store::new(StorePaths::new(dir), config.lock.settings());
    init_store(&store, config, InitOptions::default()).expect("init");
    store
}

/// Item sitting in review with every artifact `done` requires.
fn write_in_review(store: &Store, id: &str) {
    let paths = store.paths();
    let mut record = item(id, ItemState::InPr);
    record.pr_number = Some(FakeReviewHost::NUMBER);
    record.pr_url = Some(format!("https://review.example/pull/{}", FakeReviewHost::NUMBER));
    record.branch = Some(format!("shipyard/{id}"));
    store.write_item(&record).expect("write item");
    fs::write(paths.research(id), "# research\n").expect("research");
    fs::write(paths.plan(id), "# plan\n").expect("plan");
    store
        .write_prd(id, &backlog(id, vec![story("US-001", 1, StoryStatus::Done)]))
        .expect("prd");
}

fn crashed_checkpoint(completed: &[&str]) -> Checkpoint {
    let started = Utc::now() - Duration::hours(1);
    let mut checkpoint = Checkpoint::new(2, IDS.iter().map(|id| id.to_string()).collect(), started);
    checkpoint.pid = DEAD_PID;
    checkpoint.completed = completed.iter().map(|id| id.to_string()).collect();
    checkpoint.current_items = vec!["004-d".to_string()];
    checkpoint
}

/// Three of five items finished before the owner died. Resuming runs only
/// the remaining two and removes the checkpoint once everything is done.
#[test]
fn resume_finishes_outstanding_items_only() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = config();
    let store = fresh_store(dir.path(), &config);
    for id in &IDS[..3] {
        let mut record = item(id, ItemState::Done);
        record.branch = Some(format!("shipyard/{id}"));
        store.write_item(&record).expect("write done");
    }
    for id in &IDS[3..] {
        write_in_review(&store, id);
    }
    let checkpoint = crashed_checkpoint(&IDS[..3]);
    let session = checkpoint.session_id.clone();
    write_checkpoint(&store.paths().checkpoint(), &checkpoint, store.lock_settings())
        .expect("write checkpoint");

    let agent = Arc::new(RecordingAgent::default());
    let backend = LocalBackend::new(agent.clone(), &config.agent);
    let review = FakeReviewHost::default();
    review.merge("main", "feedbeef");
    let gates = ScriptedGates::passing();
    let interrupt = Interrupt::new();
    let ctx = PhaseContext::new(&store, &config, &backend, &review, &gates, &interrupt);

    let options = BatchOptions {
        parallel: 2,
        resume: true,
        retry_failed: false,
        force: false,
    };
    let mut started = Vec::new();
    let report = run_batch(&ctx, &options, |event| {
        if let BatchEvent::Started { item_id, .. } = event {
            started.push(item_id.to_string());
        }
    })
    .expect("batch");

    assert!(report.resumed);
    assert_eq!(report.session_id, session);
    started.sort();
    assert_eq!(started, vec!["004-d".to_string(), "005-e".to_string()]);
    assert!(report.failed.is_empty(), "{:?}", report.failed);
    assert!(report.remaining.is_empty());
    assert_eq!(report.completed.len(), 5);
    for id in IDS {
        assert_eq!(store.read_item(id).expect("read").state, ItemState::Done);
    }
    assert!(agent.calls().is_empty());
    assert_eq!(load_checkpoint(&store.paths().checkpoint()).expect("load"), None);
}

/// A checkpoint whose owner is alive and recent belongs to a running batch.
#[test]
fn refuses_to_run_beside_a_live_batch() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = config();
    let store = fresh_store(dir.path(), &config);
    store.write_item(&item("001-a", ItemState::Idea)).expect("write");
    let mut checkpoint = Checkpoint::new(1, vec!["001-a".to_string()], Utc::now());
    checkpoint.pid = std::os::unix::process::parent_id();
    write_checkpoint(&store.paths().checkpoint(), &checkpoint, store.lock_settings())
        .expect("write checkpoint");

    let agent = Arc::new(RecordingAgent::default());
    let backend = LocalBackend::new(agent.clone(), &config.agent);
    let review = FakeReviewHost::default();
    let gates = ScriptedGates::passing();
    let interrupt = Interrupt::new();
    let ctx = PhaseContext::new(&store, &config, &backend, &review, &gates, &interrupt);

    let options = BatchOptions {
        parallel: 1,
        resume: true,
        retry_failed: false,
        force: false,
    };
    let err = run_batch(&ctx, &options, |_| {}).expect_err("live batch");
    assert!(format!("{err:#}").contains("still running"));
    assert!(agent.calls().is_empty());
    let kept = load_checkpoint(&store.paths().checkpoint())
        .expect("load")
        .expect("checkpoint kept");
    assert_eq!(kept.session_id, checkpoint.session_id);
}

/// `--no-resume` discards a stale checkpoint and queues every open item.
#[test]
fn no_resume_starts_a_new_session() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = config();
    let store = fresh_store(dir.path(), &config);
    write_in_review(&store, "001-a");
    let stale = crashed_checkpoint(&[]);
    write_checkpoint(&store.paths().checkpoint(), &stale, store.lock_settings())
        .expect("write checkpoint");

    let agent = Arc::new(RecordingAgent::default());
    let backend = LocalBackend::new(agent.clone(), &config.agent);
    let review = FakeReviewHost::default();
    let gates = ScriptedGates::passing();
    let interrupt = Interrupt::new();
    let ctx = PhaseContext::new(&store, &config, &backend, &review, &gates, &interrupt);

    let options = BatchOptions {
        parallel: 1,
        resume: false,
        retry_failed: false,
        force: false,
    };
    let report = run_batch(&ctx, &options, |_| {}).expect("batch");
    assert!(!report.resumed);
    assert_ne!(report.session_id, stale.session_id);
    // Review still open: parked, not failed.
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].0, "001-a");
    assert!(report.failed.is_empty());
    let kept = load_checkpoint(&store.paths().checkpoint()).expect("load");
    assert!(kept.is_none(), "all queued items have an outcome");
}
