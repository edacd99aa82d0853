//! Fast, deterministic settings for tests running under paused tokio time

use reconcile_engine::retry::{Backoff, RetryPolicy};
use reconcile_engine::teardown::TeardownConfig;
use reconcile_engine::wait::WaitSpec;
use std::sync::Once;
use std::time::Duration;

/// Install a test-friendly tracing subscriber once per process.
///
/// Honours `RUST_LOG`; output goes through the test harness capture.
pub fn init_test_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// `policy` with a constant one-second backoff and at most `max_attempts` calls
pub fn fast_retry(policy: RetryPolicy, max_attempts: u32) -> RetryPolicy {
    policy
        .with_max_attempts(max_attempts)
        .with_backoff(Backoff::constant(Duration::from_secs(1)))
}

/// Wait for `targets`, polling every second for up to a minute
pub fn fast_wait<I, S>(targets: I) -> WaitSpec
where
    I: IntoIterator<Item = S>,
    S: Into<reconcile_common::ObservedState>,
{
    WaitSpec::until(targets)
        .with_poll_interval(Duration::from_secs(1))
        .with_timeout(Duration::from_secs(60))
}

/// Teardown settings with short backoffs and one-second delete polling
pub fn fast_teardown_config(workers: usize) -> TeardownConfig {
    TeardownConfig {
        workers,
        delete_policy: fast_retry(RetryPolicy::for_delete(), 5),
        transition_policy: fast_retry(RetryPolicy::for_update(), 5),
        delete_wait: WaitSpec::until_deleted()
            .with_poll_interval(Duration::from_secs(1))
            .with_timeout(Duration::from_secs(60)),
        ..TeardownConfig::default()
    }
}
