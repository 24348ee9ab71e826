//! Stable exit codes for shipyard CLI commands.

/// Command succeeded.
pub const OK: i32 = 0;
/// Command failed (invalid store, config, phase failure, batch with failures).
pub const FAILURE: i32 = 1;
/// Command was interrupted by SIGINT/SIGTERM.
pub const INTERRUPTED: i32 = 130;
