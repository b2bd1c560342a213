//! Stable exit codes for fixloop CLI commands.

/// Every executed fragment succeeded.
pub const OK: i32 = 0;
/// A fragment ran and failed (after retries, for `run`).
pub const FAILED: i32 = 1;
/// Invalid input or configuration, or the engine could not run at all.
pub const INVALID: i32 = 2;
