//! Side-effecting adapters: filesystem, git, subprocesses and external tools.
//!
//! Everything here is isolated behind small structs or traits so phases and
//! the doctor can be exercised against temp directories and fakes.

pub mod atomic;
pub mod backup;
pub mod checkpoint;
pub mod config;
pub mod gates;
pub mod git;
pub mod init;
pub mod lock;
pub mod paths;
pub mod pid;
pub mod process;
pub mod progress_log;
pub mod prompt;
pub mod review;
pub mod schema;
pub mod snapshot;
pub mod store;
