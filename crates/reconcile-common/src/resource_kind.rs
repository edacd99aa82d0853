//! Resource kinds and identifiers
//!
//! A [`ResourceKind`] names a type of remotely managed resource (for example
//! `aws_batch_job_queue`). Dependency declarations and teardown ordering are
//! expressed in terms of kinds; individual resources are addressed by a
//! [`ResourceId`], which pairs a kind with the control plane's identifier.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Type of a remotely managed resource
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceKind(String);

impl ResourceKind {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceKind {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for ResourceKind {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// Identifies one remote resource uniquely for waiting and teardown
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceId {
    /// Resource type
    pub kind: ResourceKind,
    /// Identifier assigned by the control plane
    pub id: String,
}

impl ResourceId {
    pub fn new(kind: impl Into<ResourceKind>, id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
        }
    }

    /// Human-readable description for logging, e.g. `aws_instance i-123`
    pub fn description(&self) -> String {
        format!("{} {}", self.kind, self.id)
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.id)
    }
}
