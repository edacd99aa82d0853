//! Classified retries with exponential backoff and cancellation support.
//!
//! Re-invokes an operation until it succeeds, fails fatally, or exhausts its
//! budget. The budget has two independent bounds, a maximum number of
//! attempts and a maximum elapsed time; whichever triggers first ends the
//! retry loop. Delays come from `backon::ExponentialBuilder`. Every call and
//! every sleep races the cancellation token via `tokio::select!`, and a call
//! still pending when the elapsed budget runs out ends the loop.

use crate::control_plane::{ControlPlane, ControlPlaneError, ErrorClass, ErrorClassifier, Invocation};
use backon::{BackoffBuilder, ExponentialBuilder};
use reconcile_common::OperationKind;
use reconcile_common::defaults::{
    DEFAULT_BACKOFF_FACTOR, DEFAULT_INITIAL_DELAY_MS, DEFAULT_MAX_ATTEMPTS,
    DEFAULT_MAX_DELAY_SECS, DEFAULT_MAX_ELAPSED_SECS,
};
use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Exponential backoff schedule between attempts
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Growth factor between consecutive delays
    pub factor: f32,
    /// Cap for a single delay
    pub max_delay: Duration,
    /// Add random jitter to each delay
    pub jitter: bool,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(DEFAULT_INITIAL_DELAY_MS),
            factor: DEFAULT_BACKOFF_FACTOR,
            max_delay: Duration::from_secs(DEFAULT_MAX_DELAY_SECS),
            jitter: true,
        }
    }
}

impl Backoff {
    /// Fixed delay, no growth and no jitter
    pub fn constant(delay: Duration) -> Self {
        Self {
            initial_delay: delay,
            factor: 1.0,
            max_delay: delay,
            jitter: false,
        }
    }

    fn delays(&self, max_times: usize) -> impl Iterator<Item = Duration> {
        let mut builder = ExponentialBuilder::default()
            .with_min_delay(self.initial_delay)
            .with_max_delay(self.max_delay)
            .with_factor(self.factor)
            .with_max_times(max_times);
        if self.jitter {
            builder = builder.with_jitter();
        }
        builder.build()
    }
}

/// Retry budget and classification for one call site
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of invocations (at least one is always made)
    pub max_attempts: u32,
    /// No attempt starts after this much time has passed since the first one
    pub max_elapsed: Duration,
    pub backoff: Backoff,
    pub classifier: ErrorClassifier,
}

impl RetryPolicy {
    pub fn new(classifier: ErrorClassifier) -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            max_elapsed: Duration::from_secs(DEFAULT_MAX_ELAPSED_SECS),
            backoff: Backoff::default(),
            classifier,
        }
    }

    pub fn for_delete() -> Self {
        Self::new(ErrorClassifier::for_delete())
    }

    pub fn for_create() -> Self {
        Self::new(ErrorClassifier::for_create())
    }

    /// Policy for updates and pre-delete transitions
    pub fn for_update() -> Self {
        Self::new(ErrorClassifier::for_update())
    }

    /// Policy for scope-wide reads such as sweep listings
    pub fn for_read() -> Self {
        Self::new(ErrorClassifier::for_describe())
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_max_elapsed(mut self, max_elapsed: Duration) -> Self {
        self.max_elapsed = max_elapsed;
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }
}

/// Why a retried operation did not succeed
#[derive(Debug, Clone, Error)]
pub enum RetryError {
    #[error("{operation} failed: {source}")]
    Fatal {
        operation: String,
        attempts: u32,
        #[source]
        source: ControlPlaneError,
    },

    /// The target does not exist and the operation is not a delete
    #[error("{operation}: resource not found: {source}")]
    NotFound {
        operation: String,
        #[source]
        source: ControlPlaneError,
    },

    #[error("{operation}: retry budget exhausted after {attempts} attempts in {elapsed:?}: {source}")]
    Exhausted {
        operation: String,
        attempts: u32,
        elapsed: Duration,
        #[source]
        source: ControlPlaneError,
    },

    /// A call was still pending when the elapsed budget ran out
    #[error("{operation}: no response within the retry budget ({attempts} attempts in {elapsed:?})")]
    TimedOut {
        operation: String,
        attempts: u32,
        elapsed: Duration,
    },

    #[error("{operation} cancelled after {attempts} attempts")]
    Cancelled { operation: String, attempts: u32 },
}

impl RetryError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RetryError::Cancelled { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, RetryError::NotFound { .. })
    }

    /// The control plane error that ended the loop, if any
    pub fn last_error(&self) -> Option<&ControlPlaneError> {
        match self {
            RetryError::Fatal { source, .. }
            | RetryError::NotFound { source, .. }
            | RetryError::Exhausted { source, .. } => Some(source),
            RetryError::TimedOut { .. } | RetryError::Cancelled { .. } => None,
        }
    }
}

/// Run `op` under `policy`, retrying errors the policy's classifier deems retryable.
///
/// # Returns
/// * `Ok(Some(value))` - the operation succeeded
/// * `Ok(None)` - a delete-shaped operation found the resource already gone
/// * `Err` - fatal error, not found (non-delete), exhausted budget, a call
///   outliving the budget, or cancelled
///
/// `op` must be safe to call more than once.
pub async fn retry<T, F, Fut>(
    policy: &RetryPolicy,
    kind: OperationKind,
    operation: &str,
    cancel: Option<&CancellationToken>,
    mut op: F,
) -> Result<Option<T>, RetryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ControlPlaneError>>,
{
    let start = Instant::now();
    let deadline = start.checked_add(policy.max_elapsed);
    let max_attempts = policy.max_attempts.max(1);
    let mut delays = policy.backoff.delays(max_attempts as usize);
    let mut attempts = 0u32;

    loop {
        if cancel.is_some_and(|token| token.is_cancelled()) {
            return Err(RetryError::Cancelled {
                operation: operation.to_string(),
                attempts,
            });
        }

        attempts += 1;
        let result = tokio::select! {
            biased;
            _ = cancelled(cancel) => {
                return Err(RetryError::Cancelled {
                    operation: operation.to_string(),
                    attempts,
                });
            }
            result = op() => result,
            _ = sleep_until(deadline) => {
                return Err(RetryError::TimedOut {
                    operation: operation.to_string(),
                    attempts,
                    elapsed: start.elapsed(),
                });
            }
        };
        let error = match result {
            Ok(value) => {
                debug!(operation = %operation, attempts, "Operation succeeded");
                return Ok(Some(value));
            }
            Err(e) => e,
        };

        match policy.classifier.classify(&error) {
            ErrorClass::Fatal => {
                return Err(RetryError::Fatal {
                    operation: operation.to_string(),
                    attempts,
                    source: error,
                });
            }
            ErrorClass::NotFound if kind.is_delete() => {
                debug!(operation = %operation, attempts, "Resource already gone");
                return Ok(None);
            }
            ErrorClass::NotFound => {
                return Err(RetryError::NotFound {
                    operation: operation.to_string(),
                    source: error,
                });
            }
            ErrorClass::Retryable => {}
        }

        let elapsed = start.elapsed();
        let delay = delays.next().unwrap_or(policy.backoff.max_delay);
        if attempts >= max_attempts || elapsed.saturating_add(delay) > policy.max_elapsed {
            return Err(RetryError::Exhausted {
                operation: operation.to_string(),
                attempts,
                elapsed,
                source: error,
            });
        }

        warn!(
            operation = %operation,
            attempt = attempts,
            delay = ?delay,
            error = %error,
            "Retryable error, backing off"
        );

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancelled(cancel) => {
                return Err(RetryError::Cancelled {
                    operation: operation.to_string(),
                    attempts,
                });
            }
        }
    }
}

/// Resolves once `cancel` fires; never resolves without a token
pub(crate) async fn cancelled(cancel: Option<&CancellationToken>) {
    match cancel {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

/// Sleeps until `deadline`; an unrepresentable deadline never fires
pub(crate) async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Runs control plane invocations through [`retry`].
pub struct RetryExecutor<C> {
    control_plane: C,
}

impl<C: ControlPlane> RetryExecutor<C> {
    pub fn new(control_plane: C) -> Self {
        Self { control_plane }
    }

    /// Invoke `invocation` under `policy`.
    ///
    /// Returns `Ok(None)` when a delete found the resource already gone.
    pub async fn execute(
        &self,
        policy: &RetryPolicy,
        invocation: &Invocation,
        cancel: Option<&CancellationToken>,
    ) -> Result<Option<Value>, RetryError> {
        let label = invocation.label();
        let control_plane = &self.control_plane;
        retry(policy, invocation.kind, &label, cancel, move || {
            control_plane.invoke(invocation)
        })
        .await
    }
}
