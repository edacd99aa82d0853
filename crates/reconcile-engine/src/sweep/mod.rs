//! Scope-wide cleanup of leftover resources
//!
//! Every resource kind registers a [`Sweeper`] naming the list operation that
//! discovers live resources and the kinds that must be swept before it.
//! [`Sweep::run`] lists every selected kind, turns the dependency
//! declarations into a [`DependencyGraph`], and hands the discovered
//! resources to the planner and orchestrator.
//!
//! Listing is best effort: kinds whose list call is unsupported in the
//! scope are skipped with a warning, and other listing failures are recorded
//! without stopping the sweep.

use crate::control_plane::{ControlPlane, ErrorClass, ErrorClassifier, ErrorMatcher, Invocation};
use crate::retry::{RetryError, RetryExecutor, RetryPolicy};
use crate::teardown::{
    DependencyGraph, PlanError, ResourceHandle, TeardownConfig, TeardownOrchestrator,
    TeardownPlanner, TeardownReport, Transition,
};
use crate::wait::WaitSpec;
use reconcile_common::defaults::DEFAULT_DELETE_OPERATION;
use reconcile_common::{OperationKind, ResourceId, ResourceKind};
use serde_json::Value;
use std::collections::HashSet;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How to find and tear down every resource of one kind
#[derive(Debug, Clone)]
pub struct Sweeper {
    pub kind: ResourceKind,
    /// `Read` operation returning the live resource IDs for a scope
    pub list_operation: String,
    /// Kinds swept before this one
    pub dependencies: Vec<ResourceKind>,
    pub transitions: Vec<Transition>,
    pub delete_operation: String,
    pub delete_policy: Option<RetryPolicy>,
    pub delete_wait: Option<WaitSpec>,
}

impl Sweeper {
    pub fn new(kind: impl Into<ResourceKind>, list_operation: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            list_operation: list_operation.into(),
            dependencies: Vec::new(),
            transitions: Vec::new(),
            delete_operation: DEFAULT_DELETE_OPERATION.to_string(),
            delete_policy: None,
            delete_wait: None,
        }
    }

    pub fn with_dependencies<I, K>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<ResourceKind>,
    {
        self.dependencies.extend(kinds.into_iter().map(Into::into));
        self
    }

    pub fn with_transition(mut self, transition: Transition) -> Self {
        self.transitions.push(transition);
        self
    }

    pub fn with_delete_operation(mut self, operation: impl Into<String>) -> Self {
        self.delete_operation = operation.into();
        self
    }

    /// Retry policy for this kind's delete calls
    pub fn with_delete_policy(mut self, policy: RetryPolicy) -> Self {
        self.delete_policy = Some(policy);
        self
    }

    pub fn with_delete_wait(mut self, wait: WaitSpec) -> Self {
        self.delete_wait = Some(wait);
        self
    }

    fn handle(&self, id: String) -> ResourceHandle {
        let mut handle = ResourceHandle::new(ResourceId::new(self.kind.clone(), id))
            .with_delete_operation(&self.delete_operation);
        handle.transitions = self.transitions.clone();
        handle.delete_policy = self.delete_policy.clone();
        handle.delete_wait = self.delete_wait.clone();
        handle
    }
}

#[derive(Debug, Clone, Error)]
pub enum SweepError {
    #[error("sweeper for {kind} registered twice")]
    DuplicateSweeper { kind: ResourceKind },

    #[error("sweeper for {kind} depends on {dependency}, which has no sweeper")]
    UnknownDependency {
        kind: ResourceKind,
        dependency: ResourceKind,
    },

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error("sweep cancelled during discovery")]
    Cancelled,
}

/// Sweepers in registration order
#[derive(Debug, Clone, Default)]
pub struct SweeperRegistry {
    sweepers: Vec<Sweeper>,
}

impl SweeperRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, sweeper: Sweeper) -> Result<(), SweepError> {
        if self.get(&sweeper.kind).is_some() {
            return Err(SweepError::DuplicateSweeper { kind: sweeper.kind });
        }
        debug!(kind = %sweeper.kind, dependencies = ?sweeper.dependencies, "Registered sweeper");
        self.sweepers.push(sweeper);
        Ok(())
    }

    pub fn get(&self, kind: &ResourceKind) -> Option<&Sweeper> {
        self.sweepers.iter().find(|s| &s.kind == kind)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Sweeper> {
        self.sweepers.iter()
    }

    pub fn len(&self) -> usize {
        self.sweepers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sweepers.is_empty()
    }

    pub fn dependency_graph(&self) -> DependencyGraph {
        let mut graph = DependencyGraph::new();
        for sweeper in &self.sweepers {
            graph.add(sweeper.kind.clone(), sweeper.dependencies.iter().cloned());
        }
        graph
    }

    /// Sweepers for `only` plus everything they depend on, transitively.
    /// An empty filter selects every sweeper.
    pub fn select(&self, only: &[ResourceKind]) -> Result<Vec<&Sweeper>, SweepError> {
        let mut wanted: HashSet<&ResourceKind> = HashSet::new();
        let mut stack: Vec<&ResourceKind> = if only.is_empty() {
            self.sweepers.iter().map(|s| &s.kind).collect()
        } else {
            only.iter().collect()
        };

        while let Some(kind) = stack.pop() {
            if !wanted.insert(kind) {
                continue;
            }
            let Some(sweeper) = self.get(kind) else {
                continue;
            };
            for dependency in &sweeper.dependencies {
                if self.get(dependency).is_none() {
                    return Err(SweepError::UnknownDependency {
                        kind: kind.clone(),
                        dependency: dependency.clone(),
                    });
                }
                stack.push(dependency);
            }
        }

        for kind in only {
            if self.get(kind).is_none() {
                warn!(kind = %kind, "No sweeper registered for kind");
            }
        }

        Ok(self
            .sweepers
            .iter()
            .filter(|s| wanted.contains(&s.kind))
            .collect())
    }
}

/// Listing errors that mean "this API is not available here", not "sweep failed"
pub fn unsupported_listing_classifier() -> ErrorClassifier {
    let skip = |code: &str, fragment: &str| ErrorMatcher::CodeWithMessage {
        code: code.to_string(),
        fragment: fragment.to_string(),
    };
    ErrorClassifier::new()
        .not_found_on_code("UnsupportedOperation")
        .not_found_on_code("AccessDeniedException")
        .rule(skip("RequestError", "send request failed"), ErrorClass::NotFound)
        .rule(skip("InvalidParameterValue", "not permitted in this API version"), ErrorClass::NotFound)
        .rule(skip("InvalidParameterValue", "Access Denied to API Version"), ErrorClass::NotFound)
        .rule(skip("BadRequestException", "not supported"), ErrorClass::NotFound)
        .rule(skip("InvalidAction", "is not valid"), ErrorClass::NotFound)
        .rule(skip("InvalidAction", "Unavailable Operation"), ErrorClass::NotFound)
}

#[derive(Debug, Clone)]
pub struct SweepConfig {
    pub teardown: TeardownConfig,
    pub list_policy: RetryPolicy,
    /// Listing errors this classifier maps to `NotFound` skip the kind
    pub unsupported: ErrorClassifier,
    /// Restrict the sweep to these kinds and their dependencies
    pub only: Vec<ResourceKind>,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            teardown: TeardownConfig::default(),
            list_policy: RetryPolicy::for_read(),
            unsupported: unsupported_listing_classifier(),
            only: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum ListingError {
    #[error(transparent)]
    Call(#[from] RetryError),

    #[error("unexpected list result: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone)]
pub struct SweepReport {
    /// Every resource found, in listing order
    pub discovered: Vec<ResourceId>,
    /// Kinds skipped because listing is not supported in this scope
    pub skipped_kinds: Vec<ResourceKind>,
    pub listing_errors: Vec<(ResourceKind, ListingError)>,
    pub teardown: TeardownReport,
}

impl SweepReport {
    /// True when every kind was listed and nothing failed to tear down
    pub fn is_clean(&self) -> bool {
        self.listing_errors.is_empty() && self.teardown.error().is_none()
    }
}

pub struct Sweep<C> {
    control_plane: C,
    registry: SweeperRegistry,
}

impl<C: ControlPlane> Sweep<C> {
    pub fn new(control_plane: C, registry: SweeperRegistry) -> Self {
        Self {
            control_plane,
            registry,
        }
    }

    pub fn registry(&self) -> &SweeperRegistry {
        &self.registry
    }

    /// Discover and tear down everything the selected sweepers find in `scope`.
    ///
    /// `scope` is passed as the parameters of every list call (e.g. a region
    /// or a name prefix).
    pub async fn run(
        &self,
        scope: &Value,
        config: &SweepConfig,
        cancel: Option<&CancellationToken>,
    ) -> Result<SweepReport, SweepError> {
        let sweepers = self.registry.select(&config.only)?;
        info!(kinds = sweepers.len(), dry_run = config.teardown.dry_run, "Starting sweep");

        let executor = RetryExecutor::new(&self.control_plane);
        let mut discovered = Vec::new();
        let mut handles = Vec::new();
        let mut skipped_kinds = Vec::new();
        let mut listing_errors = Vec::new();

        for sweeper in sweepers {
            let invocation = Invocation::new(&sweeper.list_operation, OperationKind::Read)
                .with_params(scope.clone());
            let result = match executor
                .execute(&config.list_policy, &invocation, cancel)
                .await
            {
                Ok(value) => value.unwrap_or(Value::Null),
                Err(e) if e.is_cancelled() => return Err(SweepError::Cancelled),
                Err(e) if self.is_unsupported(&e, config) => {
                    warn!(kind = %sweeper.kind, error = %e, "Skipping sweeper, listing not supported");
                    skipped_kinds.push(sweeper.kind.clone());
                    continue;
                }
                Err(e) => {
                    warn!(kind = %sweeper.kind, error = %e, "Listing failed");
                    listing_errors.push((sweeper.kind.clone(), ListingError::Call(e)));
                    continue;
                }
            };

            let ids = match parse_ids(&result) {
                Ok(ids) => ids,
                Err(e) => {
                    warn!(kind = %sweeper.kind, error = %e, "Listing failed");
                    listing_errors.push((sweeper.kind.clone(), e));
                    continue;
                }
            };

            info!(kind = %sweeper.kind, count = ids.len(), "Discovered resources");
            let mut seen = HashSet::new();
            for id in ids {
                if !seen.insert(id.clone()) {
                    continue;
                }
                let handle = sweeper.handle(id);
                discovered.push(handle.id.clone());
                handles.push(handle);
            }
        }

        let plan = TeardownPlanner::plan(handles, &self.registry.dependency_graph())?;
        let teardown = TeardownOrchestrator::new(&self.control_plane, config.teardown.clone())
            .run(&plan, cancel)
            .await;

        Ok(SweepReport {
            discovered,
            skipped_kinds,
            listing_errors,
            teardown,
        })
    }

    fn is_unsupported(&self, error: &RetryError, config: &SweepConfig) -> bool {
        error.is_not_found()
            || error
                .last_error()
                .is_some_and(|e| config.unsupported.is_not_found(e))
    }
}

/// Accepts `["id", ...]`, `[{"id": "..."}, ...]`, or either wrapped as `{"items": [...]}`.
/// `null` means nothing was found.
fn parse_ids(value: &Value) -> Result<Vec<String>, ListingError> {
    let items = match value {
        Value::Null => return Ok(Vec::new()),
        Value::Array(items) => items,
        Value::Object(map) => match map.get("items") {
            Some(Value::Array(items)) => items,
            _ => return Err(ListingError::Malformed("object without an \"items\" array".into())),
        },
        other => return Err(ListingError::Malformed(format!("expected an array, got {other}"))),
    };

    items
        .iter()
        .map(|item| match item {
            Value::String(id) => Ok(id.clone()),
            Value::Object(map) => match map.get("id") {
                Some(Value::String(id)) => Ok(id.clone()),
                _ => Err(ListingError::Malformed(format!("item without a string \"id\": {item}"))),
            },
            other => Err(ListingError::Malformed(format!("unexpected item {other}"))),
        })
        .collect()
}
