//! Convergence waiting: poll `describe` until a resource reaches a target state.
//!
//! A single parameterized [`StateWaiter`] replaces per-resource polling loops;
//! each resource type only supplies a [`WaitSpec`]. Every wait has a mandatory
//! timeout and honours cancellation within one poll interval.
//!
//! ```text
//! Polling ──target──────────▶ Converged
//!    │  ────failure state───▶ Failed
//!    │  ────deadline────────▶ TimedOut
//!    └──────cancel──────────▶ Cancelled
//! ```

use crate::control_plane::{ControlPlane, ControlPlaneError, ErrorClass, ErrorClassifier};
use crate::retry::{cancelled, sleep_until};
use reconcile_common::defaults::{
    DEFAULT_MAX_POLL_INTERVAL_SECS, DEFAULT_POLL_BACKOFF_FACTOR, DEFAULT_POLL_INTERVAL_SECS,
    DEFAULT_WAIT_TIMEOUT_SECS,
};
use reconcile_common::{Observation, ObservedState, ResourceId};
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Lower bound for a poll interval so a zero interval cannot spin
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Mild growth of the poll interval while the observed state does not change
#[derive(Debug, Clone, PartialEq)]
pub struct PollBackoff {
    pub factor: f32,
    pub max_interval: Duration,
}

impl Default for PollBackoff {
    fn default() -> Self {
        Self {
            factor: DEFAULT_POLL_BACKOFF_FACTOR,
            max_interval: Duration::from_secs(DEFAULT_MAX_POLL_INTERVAL_SECS),
        }
    }
}

/// What to wait for, and for how long
#[derive(Debug, Clone, PartialEq)]
pub struct WaitSpec {
    /// States that end the wait successfully
    pub target_states: BTreeSet<ObservedState>,
    /// Terminal error states (e.g. `INVALID`, `FAILED`)
    pub failure_states: BTreeSet<ObservedState>,
    /// Expected intermediate states; when non-empty any other state fails the wait
    pub pending_states: BTreeSet<ObservedState>,
    pub poll_interval: Duration,
    pub timeout: Duration,
    /// Treat "resource not found" as reaching the target (delete waits)
    pub not_found_is_target: bool,
    /// Consecutive "not found" answers tolerated before the resource counts as gone
    pub not_found_checks: u32,
    /// Consecutive target observations required before converging
    pub continuous_target_occurrence: u32,
    pub poll_backoff: Option<PollBackoff>,
}

impl Default for WaitSpec {
    fn default() -> Self {
        Self {
            target_states: BTreeSet::new(),
            failure_states: BTreeSet::new(),
            pending_states: BTreeSet::new(),
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            timeout: Duration::from_secs(DEFAULT_WAIT_TIMEOUT_SECS),
            not_found_is_target: false,
            not_found_checks: 0,
            continuous_target_occurrence: 1,
            poll_backoff: None,
        }
    }
}

fn state_set<I, S>(states: I) -> BTreeSet<ObservedState>
where
    I: IntoIterator<Item = S>,
    S: Into<ObservedState>,
{
    states.into_iter().map(Into::into).collect()
}

impl WaitSpec {
    /// Wait until the resource reports one of `targets`
    pub fn until<I, S>(targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<ObservedState>,
    {
        Self {
            target_states: state_set(targets),
            ..Self::default()
        }
    }

    /// Wait until `describe` reports the resource gone
    pub fn until_deleted() -> Self {
        Self {
            not_found_is_target: true,
            ..Self::default()
        }
    }

    pub fn failing_on<I, S>(mut self, states: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<ObservedState>,
    {
        self.failure_states.extend(states.into_iter().map(Into::into));
        self
    }

    pub fn pending<I, S>(mut self, states: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<ObservedState>,
    {
        self.pending_states.extend(states.into_iter().map(Into::into));
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn tolerate_not_found(mut self, checks: u32) -> Self {
        self.not_found_checks = checks;
        self
    }

    pub fn with_continuous_target_occurrence(mut self, occurrences: u32) -> Self {
        self.continuous_target_occurrence = occurrences;
        self
    }

    pub fn with_poll_backoff(mut self, backoff: PollBackoff) -> Self {
        self.poll_backoff = Some(backoff);
        self
    }

    /// Copy of this spec that also accepts "not found" as success
    pub fn as_delete_wait(&self) -> Self {
        Self {
            not_found_is_target: true,
            ..self.clone()
        }
    }
}

/// Successful end of a wait
#[derive(Debug, Clone, PartialEq)]
pub struct Converged {
    /// Final observation; `None` when the resource converged by disappearing
    pub observation: Option<Observation>,
    /// Number of `describe` calls made
    pub polls: u32,
}

struct LastState<'a>(&'a Option<ObservedState>);

impl fmt::Display for LastState<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(state) => write!(f, "{state}"),
            None => f.write_str("none observed"),
        }
    }
}

fn reason_suffix(reason: &Option<String>) -> String {
    reason
        .as_deref()
        .map(|r| format!(": {r}"))
        .unwrap_or_default()
}

fn error_suffix(error: &Option<ControlPlaneError>) -> String {
    error
        .as_ref()
        .map(|e| format!(", last error: {e}"))
        .unwrap_or_default()
}

/// Terminal non-converged outcome of a wait
#[derive(Debug, Clone, Error)]
pub enum WaitError {
    #[error("{resource} entered failure state {state}{}", reason_suffix(.reason))]
    Failed {
        resource: ResourceId,
        state: ObservedState,
        reason: Option<String>,
    },

    #[error("{resource} entered unexpected state {state}{}", reason_suffix(.reason))]
    UnexpectedState {
        resource: ResourceId,
        state: ObservedState,
        reason: Option<String>,
    },

    #[error("{resource} disappeared while waiting")]
    Disappeared { resource: ResourceId },

    #[error(
        "timeout waiting for {resource} after {timeout:?} ({polls} polls, last state: {}){}",
        LastState(.last_state),
        error_suffix(.last_error)
    )]
    TimedOut {
        resource: ResourceId,
        timeout: Duration,
        polls: u32,
        last_state: Option<ObservedState>,
        /// Most recent retryable `describe` error, if any
        last_error: Option<ControlPlaneError>,
    },

    #[error("wait for {resource} cancelled")]
    Cancelled { resource: ResourceId },

    #[error("describe {resource} failed: {source}")]
    Describe {
        resource: ResourceId,
        #[source]
        source: ControlPlaneError,
    },
}

impl WaitError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, WaitError::TimedOut { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, WaitError::Cancelled { .. })
    }

    pub fn is_disappeared(&self) -> bool {
        matches!(self, WaitError::Disappeared { .. })
    }
}

/// Polls the control plane until a resource converges.
pub struct StateWaiter<C> {
    control_plane: C,
    classifier: ErrorClassifier,
}

impl<C: ControlPlane> StateWaiter<C> {
    /// `classifier` decides which `describe` errors are retried while waiting
    pub fn new(control_plane: C, classifier: ErrorClassifier) -> Self {
        Self {
            control_plane,
            classifier,
        }
    }

    /// Poll `resource` until it matches `spec`.
    ///
    /// The first poll is immediate. Retryable `describe` errors keep the wait
    /// polling but still count against `spec.timeout`; fatal ones abort it.
    /// A `describe` call still pending at the deadline ends the wait with
    /// [`WaitError::TimedOut`], and cancellation interrupts it.
    pub async fn wait(
        &self,
        resource: &ResourceId,
        spec: &WaitSpec,
        cancel: Option<&CancellationToken>,
    ) -> Result<Converged, WaitError> {
        let start = Instant::now();
        let base_interval = spec.poll_interval.max(MIN_POLL_INTERVAL);
        let required_hits = spec.continuous_target_occurrence.max(1);
        let mut interval = base_interval;
        let mut polls = 0u32;
        let mut target_hits = 0u32;
        let mut not_found_seen = 0u32;
        let mut last_state: Option<ObservedState> = None;
        let mut last_error: Option<ControlPlaneError> = None;
        let deadline = start.checked_add(spec.timeout);

        loop {
            if cancel.is_some_and(|token| token.is_cancelled()) {
                return Err(WaitError::Cancelled {
                    resource: resource.clone(),
                });
            }

            polls += 1;
            let described = tokio::select! {
                biased;
                _ = cancelled(cancel) => {
                    return Err(WaitError::Cancelled {
                        resource: resource.clone(),
                    });
                }
                result = self.control_plane.describe(resource) => result,
                _ = sleep_until(deadline) => {
                    warn!(resource = %resource, polls, "Describe still pending at wait deadline");
                    return Err(WaitError::TimedOut {
                        resource: resource.clone(),
                        timeout: spec.timeout,
                        polls,
                        last_state,
                        last_error,
                    });
                }
            };

            match described {
                Ok(observation) => {
                    not_found_seen = 0;
                    let state = observation.state.clone();

                    if spec.target_states.contains(&state) {
                        target_hits += 1;
                        if target_hits >= required_hits {
                            debug!(resource = %resource, state = %state, polls, "Resource converged");
                            return Ok(Converged {
                                observation: Some(observation),
                                polls,
                            });
                        }
                    } else {
                        target_hits = 0;
                        if spec.failure_states.contains(&state) {
                            return Err(WaitError::Failed {
                                resource: resource.clone(),
                                state,
                                reason: observation.reason,
                            });
                        }
                        if !spec.pending_states.is_empty() && !spec.pending_states.contains(&state)
                        {
                            return Err(WaitError::UnexpectedState {
                                resource: resource.clone(),
                                state,
                                reason: observation.reason,
                            });
                        }
                    }

                    if let Some(backoff) = &spec.poll_backoff {
                        interval = if last_state.as_ref() == Some(&state) {
                            interval.mul_f32(backoff.factor).min(backoff.max_interval)
                        } else {
                            base_interval
                        };
                    }
                    debug!(resource = %resource, state = %state, polls, "Resource not converged yet");
                    last_state = Some(state);
                }
                Err(error) => match self.classifier.classify(&error) {
                    ErrorClass::NotFound => {
                        if spec.not_found_is_target {
                            debug!(resource = %resource, polls, "Resource gone");
                            return Ok(Converged {
                                observation: None,
                                polls,
                            });
                        }
                        target_hits = 0;
                        not_found_seen += 1;
                        if not_found_seen > spec.not_found_checks {
                            return Err(WaitError::Disappeared {
                                resource: resource.clone(),
                            });
                        }
                        debug!(resource = %resource, not_found_seen, "Resource not visible yet");
                    }
                    ErrorClass::Retryable => {
                        warn!(resource = %resource, error = %error, "Describe failed, still waiting");
                        last_error = Some(error);
                    }
                    ErrorClass::Fatal => {
                        return Err(WaitError::Describe {
                            resource: resource.clone(),
                            source: error,
                        });
                    }
                },
            }

            if cancel.is_some_and(|token| token.is_cancelled()) {
                return Err(WaitError::Cancelled {
                    resource: resource.clone(),
                });
            }

            let elapsed = start.elapsed();
            if elapsed >= spec.timeout {
                return Err(WaitError::TimedOut {
                    resource: resource.clone(),
                    timeout: spec.timeout,
                    polls,
                    last_state,
                    last_error,
                });
            }
            let delay = interval.min(spec.timeout - elapsed);

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancelled(cancel) => {
                    return Err(WaitError::Cancelled {
                        resource: resource.clone(),
                    });
                }
            }
        }
    }
}
