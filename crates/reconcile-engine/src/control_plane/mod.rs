//! Remote control plane boundary
//!
//! The engine talks to exactly one collaborator: the eventually-consistent
//! control plane that owns the resources being created, observed and deleted.
//! It is injected into every component as a generic `C: ControlPlane`, so
//! nothing in the engine holds a global client.
//!
//! - [`ControlPlane`]: the `invoke` / `describe` trait
//! - [`error`]: structured control plane errors and their classification

pub mod error;

use reconcile_common::{Observation, OperationKind, ResourceId};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;

pub use error::{ControlPlaneError, ErrorClass, ErrorClassifier, ErrorMatcher};

/// A single mutating or read call against the control plane
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    /// Operation name understood by the control plane (e.g. `DisableComputeEnvironment`)
    pub operation: String,
    /// Shape of the call; decides how "not found" is treated
    pub kind: OperationKind,
    /// Target resource, absent for creates and scope-wide reads
    pub resource: Option<ResourceId>,
    /// Operation parameters
    pub params: Value,
}

impl Invocation {
    pub fn new(operation: impl Into<String>, kind: OperationKind) -> Self {
        Self {
            operation: operation.into(),
            kind,
            resource: None,
            params: Value::Null,
        }
    }

    /// Delete call for `resource`
    pub fn delete(operation: impl Into<String>, resource: ResourceId) -> Self {
        Self::new(operation, OperationKind::Delete).on(resource)
    }

    /// Intermediate-state transition for `resource` (e.g. disable)
    pub fn transition(operation: impl Into<String>, resource: ResourceId) -> Self {
        Self::new(operation, OperationKind::Transition).on(resource)
    }

    pub fn on(mut self, resource: ResourceId) -> Self {
        self.resource = Some(resource);
        self
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    /// Short label for logging, e.g. `delete aws_instance/i-123`
    pub fn label(&self) -> String {
        match &self.resource {
            Some(resource) => format!("{} {}", self.operation, resource),
            None => self.operation.clone(),
        }
    }
}

/// Operations the engine needs from the remote control plane.
///
/// Implementations wrap a concrete API client. Both calls must be safe to
/// repeat: the engine retries them without being able to detect partial
/// application.
pub trait ControlPlane: Send + Sync {
    /// Perform an operation and return its (opaque) result
    fn invoke(
        &self,
        invocation: &Invocation,
    ) -> impl Future<Output = Result<Value, ControlPlaneError>> + Send;

    /// Observe the current state of a resource
    fn describe(
        &self,
        resource: &ResourceId,
    ) -> impl Future<Output = Result<Observation, ControlPlaneError>> + Send;
}

impl<C: ControlPlane> ControlPlane for Arc<C> {
    fn invoke(
        &self,
        invocation: &Invocation,
    ) -> impl Future<Output = Result<Value, ControlPlaneError>> + Send {
        (**self).invoke(invocation)
    }

    fn describe(
        &self,
        resource: &ResourceId,
    ) -> impl Future<Output = Result<Observation, ControlPlaneError>> + Send {
        (**self).describe(resource)
    }
}

impl<C: ControlPlane> ControlPlane for &C {
    fn invoke(
        &self,
        invocation: &Invocation,
    ) -> impl Future<Output = Result<Value, ControlPlaneError>> + Send {
        (**self).invoke(invocation)
    }

    fn describe(
        &self,
        resource: &ResourceId,
    ) -> impl Future<Output = Result<Observation, ControlPlaneError>> + Send {
        (**self).describe(resource)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_invocation_builders() {
        let id = ResourceId::new("aws_batch_compute_environment", "ce-1");
        let inv = Invocation::transition("disable", id.clone())
            .with_params(json!({ "state": "DISABLED" }));
        assert_eq!(inv.kind, OperationKind::Transition);
        assert_eq!(inv.resource.as_ref(), Some(&id));
        assert_eq!(inv.params["state"], "DISABLED");
        assert_eq!(inv.label(), "disable aws_batch_compute_environment/ce-1");
    }

    #[test]
    fn test_scope_wide_label() {
        let inv = Invocation::new("ListInstances", OperationKind::Read);
        assert_eq!(inv.label(), "ListInstances");
        assert!(inv.resource.is_none());
    }
}
