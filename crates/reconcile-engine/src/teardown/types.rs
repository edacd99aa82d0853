//! Teardown inputs and results

use crate::retry::{RetryError, RetryPolicy};
use crate::wait::{WaitError, WaitSpec};
use reconcile_common::defaults::DEFAULT_DELETE_OPERATION;
use reconcile_common::{ResourceId, ResourceKind};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use thiserror::Error;

/// Intermediate state change required before a resource may be deleted
/// (e.g. disabling a job queue)
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub operation: String,
    pub params: Value,
    /// Wait applied after the transition call is accepted
    pub wait: WaitSpec,
    /// Overrides the orchestrator's transition policy for this call
    pub policy: Option<RetryPolicy>,
}

impl Transition {
    pub fn new(operation: impl Into<String>, wait: WaitSpec) -> Self {
        Self {
            operation: operation.into(),
            params: Value::Null,
            wait,
            policy: None,
        }
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = Some(policy);
        self
    }
}

/// A resource scheduled for teardown
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceHandle {
    pub id: ResourceId,
    /// Applied in order; each must converge before the next starts
    pub transitions: Vec<Transition>,
    pub delete_operation: String,
    pub delete_params: Value,
    /// Overrides the orchestrator's delete policy, e.g. to retry a kind's
    /// own "still in use" codes
    pub delete_policy: Option<RetryPolicy>,
    /// Wait after the delete call; `not_found_is_target` is always forced on.
    /// Falls back to the orchestrator's default when absent.
    pub delete_wait: Option<WaitSpec>,
}

impl ResourceHandle {
    pub fn new(id: ResourceId) -> Self {
        Self {
            id,
            transitions: Vec::new(),
            delete_operation: DEFAULT_DELETE_OPERATION.to_string(),
            delete_params: Value::Null,
            delete_policy: None,
            delete_wait: None,
        }
    }

    pub fn kind(&self) -> &ResourceKind {
        &self.id.kind
    }

    pub fn with_transition(mut self, transition: Transition) -> Self {
        self.transitions.push(transition);
        self
    }

    pub fn with_delete_operation(mut self, operation: impl Into<String>) -> Self {
        self.delete_operation = operation.into();
        self
    }

    pub fn with_delete_params(mut self, params: Value) -> Self {
        self.delete_params = params;
        self
    }

    pub fn with_delete_policy(mut self, policy: RetryPolicy) -> Self {
        self.delete_policy = Some(policy);
        self
    }

    pub fn with_delete_wait(mut self, wait: WaitSpec) -> Self {
        self.delete_wait = Some(wait);
        self
    }
}

/// Kind-level teardown ordering.
///
/// Maps each kind to the kinds whose resources must be torn down *before*
/// it: a job queue must be gone before the compute environment it uses can
/// be deleted, so `compute_environment -> {job_queue}`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyGraph {
    before: BTreeMap<ResourceKind, BTreeSet<ResourceKind>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare that every kind in `before` is torn down before `kind`
    pub fn add<I, K>(&mut self, kind: impl Into<ResourceKind>, before: I) -> &mut Self
    where
        I: IntoIterator<Item = K>,
        K: Into<ResourceKind>,
    {
        self.before
            .entry(kind.into())
            .or_default()
            .extend(before.into_iter().map(Into::into));
        self
    }

    /// `dependent` references `dependency`, so `dependent` goes first
    pub fn depends_on(
        &mut self,
        dependent: impl Into<ResourceKind>,
        dependency: impl Into<ResourceKind>,
    ) -> &mut Self {
        self.add(dependency, [dependent.into()])
    }

    /// Kinds that must be torn down before `kind`
    pub fn torn_down_before(&self, kind: &ResourceKind) -> impl Iterator<Item = &ResourceKind> {
        self.before.get(kind).into_iter().flatten()
    }

    pub fn is_empty(&self) -> bool {
        self.before.values().all(BTreeSet::is_empty)
    }
}

/// A teardown pipeline step, for error reporting
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Transition(String),
    Delete(String),
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Transition(op) => write!(f, "transition {op}"),
            Step::Delete(op) => write!(f, "delete {op}"),
        }
    }
}

/// Why one resource's teardown failed
#[derive(Debug, Clone, Error)]
pub enum TeardownError {
    #[error("{step} failed: {source}")]
    Invoke {
        step: Step,
        #[source]
        source: RetryError,
    },

    #[error("waiting after {step} failed: {source}")]
    Wait {
        step: Step,
        #[source]
        source: WaitError,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// The resource no longer existed
    AlreadyGone,
    /// Teardown was cancelled before this resource started
    NotStarted,
    /// A resource that had to go first did not
    Blocked { by: Vec<ResourceId> },
    /// Dry run; nothing was changed
    DryRun,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::AlreadyGone => f.write_str("already gone"),
            SkipReason::NotStarted => f.write_str("not started"),
            SkipReason::Blocked { by } => {
                f.write_str("blocked by ")?;
                for (i, id) in by.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{id}")?;
                }
                Ok(())
            }
            SkipReason::DryRun => f.write_str("dry run"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum TeardownOutcome {
    Succeeded,
    Skipped(SkipReason),
    Failed(TeardownError),
    Cancelled,
}

impl TeardownOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, TeardownOutcome::Failed(_))
    }

    /// The resource is known to be gone (or deliberately untouched), so
    /// resources ordered after it may proceed
    pub fn releases_successors(&self) -> bool {
        matches!(
            self,
            TeardownOutcome::Succeeded
                | TeardownOutcome::Skipped(SkipReason::AlreadyGone | SkipReason::DryRun)
        )
    }
}

impl fmt::Display for TeardownOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TeardownOutcome::Succeeded => f.write_str("succeeded"),
            TeardownOutcome::Skipped(reason) => write!(f, "skipped ({reason})"),
            TeardownOutcome::Failed(e) => write!(f, "failed: {e}"),
            TeardownOutcome::Cancelled => f.write_str("cancelled"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TeardownEntry {
    pub resource: ResourceId,
    pub outcome: TeardownOutcome,
}

/// Counts per outcome, for logging
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TeardownSummary {
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: usize,
    pub cancelled: usize,
}

/// One entry per input handle, in input order
#[derive(Debug, Clone, Default)]
pub struct TeardownReport {
    pub entries: Vec<TeardownEntry>,
}

impl TeardownReport {
    pub fn outcome(&self, resource: &ResourceId) -> Option<&TeardownOutcome> {
        self.entries
            .iter()
            .find(|e| &e.resource == resource)
            .map(|e| &e.outcome)
    }

    pub fn failures(&self) -> impl Iterator<Item = (&ResourceId, &TeardownError)> {
        self.entries.iter().filter_map(|e| match &e.outcome {
            TeardownOutcome::Failed(err) => Some((&e.resource, err)),
            _ => None,
        })
    }

    pub fn summary(&self) -> TeardownSummary {
        self.entries
            .iter()
            .fold(TeardownSummary::default(), |mut s, e| {
                match e.outcome {
                    TeardownOutcome::Succeeded => s.succeeded += 1,
                    TeardownOutcome::Skipped(_) => s.skipped += 1,
                    TeardownOutcome::Failed(_) => s.failed += 1,
                    TeardownOutcome::Cancelled => s.cancelled += 1,
                }
                s
            })
    }

    /// The aggregate error, present iff at least one entry failed
    pub fn error(&self) -> Option<TeardownFailed> {
        let failures: Vec<_> = self
            .failures()
            .map(|(id, err)| (id.clone(), err.clone()))
            .collect();
        (!failures.is_empty()).then_some(TeardownFailed { failures })
    }

    pub fn into_result(self) -> Result<TeardownReport, TeardownFailed> {
        match self.error() {
            Some(err) => Err(err),
            None => Ok(self),
        }
    }
}

/// Every resource whose teardown failed, with its error
#[derive(Debug, Clone, Error)]
#[error("teardown failed for {} resource(s): {}", .failures.len(), render_failures(.failures))]
pub struct TeardownFailed {
    pub failures: Vec<(ResourceId, TeardownError)>,
}

fn render_failures(failures: &[(ResourceId, TeardownError)]) -> String {
    failures
        .iter()
        .map(|(id, err)| format!("{id}: {err}"))
        .collect::<Vec<_>>()
        .join("; ")
}
