//! Default timing values shared between the engine, its CLI and manifests
//!
//! These constants keep call sites that do not override a tunable consistent
//! with each other. Every value can be overridden per call.

/// Default maximum number of invocations for a retried operation
pub const DEFAULT_MAX_ATTEMPTS: u32 = 8;

/// Default upper bound on the total time spent retrying one operation (5 minutes)
pub const DEFAULT_MAX_ELAPSED_SECS: u64 = 300;

/// Default delay before the first retry, in milliseconds
pub const DEFAULT_INITIAL_DELAY_MS: u64 = 2_000;

/// Default cap for a single retry delay, in seconds
pub const DEFAULT_MAX_DELAY_SECS: u64 = 30;

/// Default growth factor between consecutive retry delays
pub const DEFAULT_BACKOFF_FACTOR: f32 = 2.0;

/// Default interval between two `describe` polls, in seconds
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;

/// Default cap for the poll interval when poll backoff is enabled, in seconds
pub const DEFAULT_MAX_POLL_INTERVAL_SECS: u64 = 30;

/// Default growth factor for the poll interval while the observed state is unchanged
pub const DEFAULT_POLL_BACKOFF_FACTOR: f32 = 1.5;

/// Default wait timeout (20 minutes)
pub const DEFAULT_WAIT_TIMEOUT_SECS: u64 = 1_200;

/// Default number of resources torn down concurrently
pub const DEFAULT_TEARDOWN_WORKERS: usize = 4;

/// Operation name used for delete invocations when a handle does not name one
pub const DEFAULT_DELETE_OPERATION: &str = "delete";

// Serde default functions for struct field defaults

/// Returns the default maximum attempts
pub fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

/// Returns the default retry budget in seconds
pub fn default_max_elapsed_secs() -> u64 {
    DEFAULT_MAX_ELAPSED_SECS
}

/// Returns the default poll interval in seconds
pub fn default_poll_interval_secs() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}

/// Returns the default wait timeout in seconds
pub fn default_wait_timeout_secs() -> u64 {
    DEFAULT_WAIT_TIMEOUT_SECS
}

/// Returns the default worker count
pub fn default_teardown_workers() -> usize {
    DEFAULT_TEARDOWN_WORKERS
}

/// Returns the default delete operation name
pub fn default_delete_operation() -> String {
    DEFAULT_DELETE_OPERATION.to_string()
}
