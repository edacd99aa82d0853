//! Observed state values and operation kinds
//!
//! The engine never interprets an [`ObservedState`]: it only compares it
//! against the target, failure and pending sets of a wait. The
//! [`OperationKind`] of an invocation decides how a "not found" answer is
//! treated (success for deletes, a distinct outcome for everything else).

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque status value returned by the control plane's `describe`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObservedState(String);

impl ObservedState {
    pub fn new(state: impl Into<String>) -> Self {
        Self(state.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObservedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ObservedState {
    fn from(state: &str) -> Self {
        Self::new(state)
    }
}

impl From<String> for ObservedState {
    fn from(state: String) -> Self {
        Self(state)
    }
}

/// One answer from `describe`: the state plus the control plane's reason, if any
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observation {
    pub state: ObservedState,
    /// Status reason reported alongside the state (e.g. why it became INVALID)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Observation {
    pub fn new(state: impl Into<ObservedState>) -> Self {
        Self {
            state: state.into(),
            reason: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// Shape of a call against the control plane
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[strum(ascii_case_insensitive, serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Create,
    Update,
    /// Removes the resource; "not found" counts as success
    Delete,
    /// Moves the resource into an intermediate state (e.g. disable before delete)
    Transition,
    /// Read-only call such as a list or lookup
    Read,
}

impl OperationKind {
    /// Whether a "not found" answer means the operation already took effect
    pub fn is_delete(self) -> bool {
        matches!(self, OperationKind::Delete)
    }
}
