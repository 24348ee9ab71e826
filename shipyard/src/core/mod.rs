//! Deterministic, pure logic shared by the workflow engine.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! records and return deterministic outputs suitable for tests.

pub mod artifacts;
pub mod deps;
pub mod migrate;
pub mod quality;
pub mod secrets;
pub mod states;
