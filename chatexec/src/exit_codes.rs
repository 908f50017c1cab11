//! Stable exit codes for the CLI.

/// Command succeeded.
pub const OK: i32 = 0;
/// Invalid configuration, arguments or I/O failure.
pub const INVALID: i32 = 1;
/// The chat provider could not be reached or rejected the request.
pub const CLIENT_FAILED: i32 = 2;
