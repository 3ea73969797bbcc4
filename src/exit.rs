//! Process exit codes for embedding CLIs.

/// The run completed and every check held.
pub const SUCCESS: i32 = 0;
/// Setup or teardown failed.
pub const SETUP_TEARDOWN_ERROR: i32 = 2;
/// Option validation failed after consolidation.
pub const VALIDATION_FAILURE: i32 = 97;
/// The script's thresholds failed.
pub const THRESHOLD_FAILURE: i32 = 98;
/// The configuration could not be read, parsed, or derived.
pub const INVALID_CONFIG: i32 = 99;
/// Codes at and above this are runtime errors.
pub const RUNTIME_ERROR_BASE: i32 = 100;
