//! Durable backlog-item workflow engine.
//!
//! Each item moves through research, planning, story-by-story implementation,
//! delivery and completion, with an AI coding agent doing the work inside each
//! phase. The architecture keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (state graph, dependency graph,
//!   artifact rules, quality checks). No I/O.
//! - **[`io`]**: Side-effecting operations (store, locks, git, subprocesses,
//!   review host). Isolated so tests can run against temp dirs and fakes.
//!
//! Orchestration modules ([`phases`], [`batch`], [`doctor`]) combine the two to
//! implement CLI commands.

pub mod agent;
pub mod backlog;
pub mod batch;
pub mod compute;
pub mod core;
pub mod doctor;
pub mod exit_codes;
pub mod interrupt;
pub mod io;
pub mod item;
pub mod logging;
pub mod phases;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
