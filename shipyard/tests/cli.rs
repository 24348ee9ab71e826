//! CLI tests: spawn the binary and check exit codes and store effects.

use std::path::Path;
use std::process::{Command, Output};

use shipyard::exit_codes;
use shipyard::io::paths::StorePaths;
use shipyard::io::store::Store;
use shipyard::item::ItemState;

fn shipyard(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_shipyard"))
        .current_dir(dir)
        .args(args)
        .output()
        .expect("spawn shipyard")
}

fn store(dir: &Path) -> Store {
    Store::new(StorePaths::new(dir), Default::default())
}

#[test]
fn commands_outside_a_store_fail() {
    let temp = tempfile::tempdir().expect("tempdir");
    let output = shipyard(temp.path(), &["list"]);
    assert_eq!(output.status.code(), Some(exit_codes::FAILURE));
    assert!(String::from_utf8_lossy(&output.stderr).contains("shipyard init"));
}

#[test]
fn init_twice_requires_force() {
    let temp = tempfile::tempdir().expect("tempdir");
    assert_eq!(shipyard(temp.path(), &["init"]).status.code(), Some(exit_codes::OK));
    assert_eq!(
        shipyard(temp.path(), &["init"]).status.code(),
        Some(exit_codes::FAILURE)
    );
    assert_eq!(
        shipyard(temp.path(), &["init", "--force"]).status.code(),
        Some(exit_codes::OK)
    );
}

/// add, then research by bare number with the mock agent; doctor stays clean.
#[test]
fn add_and_research_with_mock_agent() {
    let temp = tempfile::tempdir().expect("tempdir");
    assert_eq!(shipyard(temp.path(), &["init"]).status.code(), Some(exit_codes::OK));

    let added = shipyard(temp.path(), &["add", "Speed up search"]);
    assert_eq!(added.status.code(), Some(exit_codes::OK));
    let id = String::from_utf8_lossy(&added.stdout).trim().to_string();
    assert_eq!(id, "001-speed-up-search");

    let dry = shipyard(temp.path(), &["--mock-agent", "--dry-run", "research", "1"]);
    assert_eq!(dry.status.code(), Some(exit_codes::OK));
    assert_eq!(store(temp.path()).read_item(&id).expect("read").state, ItemState::Idea);

    let research = shipyard(temp.path(), &["--mock-agent", "research", "1"]);
    assert_eq!(
        research.status.code(),
        Some(exit_codes::OK),
        "{}",
        String::from_utf8_lossy(&research.stderr)
    );
    assert_eq!(
        store(temp.path()).read_item(&id).expect("read").state,
        ItemState::Researched
    );

    let listed = shipyard(temp.path(), &["list", "--json"]);
    let items: serde_json::Value = serde_json::from_slice(&listed.stdout).expect("list json");
    assert_eq!(items[0]["state"], "researched");

    let doctor = shipyard(temp.path(), &["--mock-agent", "doctor"]);
    assert_eq!(
        doctor.status.code(),
        Some(exit_codes::OK),
        "{}",
        String::from_utf8_lossy(&doctor.stdout)
    );
}

#[test]
fn phase_out_of_order_exits_with_failure() {
    let temp = tempfile::tempdir().expect("tempdir");
    shipyard(temp.path(), &["init"]);
    shipyard(temp.path(), &["add", "Too early"]);
    let output = shipyard(temp.path(), &["--mock-agent", "pr", "1"]);
    assert_eq!(output.status.code(), Some(exit_codes::FAILURE));
}

/// add records overview, dependencies and campaign in the first write; an
/// unknown dependency creates nothing.
#[test]
fn add_with_details_records_them() {
    let temp = tempfile::tempdir().expect("tempdir");
    shipyard(temp.path(), &["init"]);
    shipyard(temp.path(), &["add", "Schema"]);

    let added = shipyard(
        temp.path(),
        &[
            "add",
            "Migrations",
            "--overview",
            "Versioned schema changes",
            "--depends-on",
            "1",
            "--campaign",
            "storage",
        ],
    );
    assert_eq!(added.status.code(), Some(exit_codes::OK));
    let id = String::from_utf8_lossy(&added.stdout).trim().to_string();
    let item = store(temp.path()).read_item(&id).expect("read");
    assert_eq!(item.overview, "Versioned schema changes");
    assert_eq!(item.depends_on, vec!["001-schema".to_string()]);
    assert_eq!(item.campaign.as_deref(), Some("storage"));
    assert_eq!(item.created_at, item.updated_at);

    let orphan = shipyard(temp.path(), &["add", "Orphan", "--depends-on", "9"]);
    assert_eq!(orphan.status.code(), Some(exit_codes::FAILURE));
    assert_eq!(store(temp.path()).list_item_ids().expect("list").len(), 2);
}
