//! Teardown manifest loaded by the `reconcile` CLI
//!
//! A manifest declares resource kinds (their dependencies, transitions and
//! delete operation) and the concrete resources to tear down. Durations are
//! whole seconds in `*_secs` fields, except the initial retry delay which is
//! in milliseconds.
//!
//! ```toml
//! workers = 4
//!
//! [[kinds]]
//! name = "aws_batch_compute_environment"
//! after = ["aws_batch_job_queue"]
//! delete_operation = "DeleteComputeEnvironment"
//!
//! [[kinds.transitions]]
//! operation = "UpdateComputeEnvironment"
//! params = { state = "DISABLED" }
//! target_states = ["VALID"]
//! failure_states = ["INVALID"]
//!
//! [[resources]]
//! kind = "aws_batch_compute_environment"
//! id = "ce-1"
//! ```

use crate::retry::{Backoff, RetryPolicy};
use crate::teardown::{
    DependencyGraph, PlanError, ResourceHandle, TeardownConfig, TeardownPlan, TeardownPlanner,
    Transition,
};
use crate::wait::WaitSpec;
use reconcile_common::defaults::{
    DEFAULT_INITIAL_DELAY_MS, DEFAULT_MAX_DELAY_SECS, default_delete_operation,
    default_max_attempts, default_max_elapsed_secs, default_poll_interval_secs,
    default_teardown_workers, default_wait_timeout_secs,
};
use reconcile_common::{ResourceId, ResourceKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read manifest {}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid manifest")]
    Parse(#[from] toml::de::Error),

    #[error("kind {0} is declared more than once")]
    DuplicateKind(ResourceKind),

    #[error("transition {operation} of {kind} has no target states")]
    EmptyTargetStates {
        kind: ResourceKind,
        operation: String,
    },

    #[error("workers must be at least 1")]
    NoWorkers,
}

/// Retry settings shared by every delete and transition call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryManifest {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_max_elapsed_secs")]
    pub max_elapsed_secs: u64,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

impl Default for RetryManifest {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            max_elapsed_secs: default_max_elapsed_secs(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_secs: default_max_delay_secs(),
            jitter: default_jitter(),
        }
    }
}

impl RetryManifest {
    fn apply(&self, policy: RetryPolicy) -> RetryPolicy {
        policy
            .with_max_attempts(self.max_attempts)
            .with_max_elapsed(Duration::from_secs(self.max_elapsed_secs))
            .with_backoff(Backoff {
                initial_delay: Duration::from_millis(self.initial_delay_ms),
                max_delay: Duration::from_secs(self.max_delay_secs),
                jitter: self.jitter,
                ..Backoff::default()
            })
    }
}

fn default_initial_delay_ms() -> u64 {
    DEFAULT_INITIAL_DELAY_MS
}

fn default_max_delay_secs() -> u64 {
    DEFAULT_MAX_DELAY_SECS
}

fn default_jitter() -> bool {
    true
}

fn default_target_occurrence() -> u32 {
    1
}

/// Wait settings; an empty `target_states` is only valid for delete waits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitManifest {
    #[serde(default)]
    pub target_states: Vec<String>,
    #[serde(default)]
    pub failure_states: Vec<String>,
    #[serde(default)]
    pub pending_states: Vec<String>,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_wait_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub not_found_checks: u32,
    #[serde(default = "default_target_occurrence")]
    pub continuous_target_occurrence: u32,
}

impl WaitManifest {
    pub fn to_spec(&self) -> WaitSpec {
        WaitSpec::until(self.target_states.iter().map(String::as_str))
            .failing_on(self.failure_states.iter().map(String::as_str))
            .pending(self.pending_states.iter().map(String::as_str))
            .with_poll_interval(Duration::from_secs(self.poll_interval_secs))
            .with_timeout(Duration::from_secs(self.timeout_secs))
            .tolerate_not_found(self.not_found_checks)
            .with_continuous_target_occurrence(self.continuous_target_occurrence)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionManifest {
    pub operation: String,
    #[serde(default)]
    pub params: Value,
    #[serde(flatten)]
    pub wait: WaitManifest,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KindManifest {
    pub name: ResourceKind,
    /// Kinds torn down before this one
    #[serde(default)]
    pub after: Vec<ResourceKind>,
    #[serde(default = "default_delete_operation")]
    pub delete_operation: String,
    #[serde(default)]
    pub transitions: Vec<TransitionManifest>,
    /// Extra error codes retried on this kind's delete, e.g. a kind-specific "in use"
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub delete_retry_codes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delete_wait: Option<WaitManifest>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceManifest {
    pub kind: ResourceKind,
    pub id: String,
    #[serde(default)]
    pub delete_params: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default = "default_teardown_workers")]
    pub workers: usize,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub retry: RetryManifest,
    #[serde(default)]
    pub kinds: Vec<KindManifest>,
    #[serde(default)]
    pub resources: Vec<ResourceManifest>,
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        let text = std::fs::read_to_string(path).map_err(|source| ManifestError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, ManifestError> {
        let manifest: Manifest = toml::from_str(text)?;
        manifest.validate()?;
        Ok(manifest)
    }

    fn validate(&self) -> Result<(), ManifestError> {
        if self.workers == 0 {
            return Err(ManifestError::NoWorkers);
        }
        let mut seen = HashSet::new();
        for kind in &self.kinds {
            if !seen.insert(&kind.name) {
                return Err(ManifestError::DuplicateKind(kind.name.clone()));
            }
            for transition in &kind.transitions {
                if transition.wait.target_states.is_empty() {
                    return Err(ManifestError::EmptyTargetStates {
                        kind: kind.name.clone(),
                        operation: transition.operation.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    pub fn kind(&self, name: &ResourceKind) -> Option<&KindManifest> {
        self.kinds.iter().find(|k| &k.name == name)
    }

    pub fn dependency_graph(&self) -> DependencyGraph {
        let mut graph = DependencyGraph::new();
        for kind in &self.kinds {
            graph.add(kind.name.clone(), kind.after.iter().cloned());
        }
        graph
    }

    /// One handle per listed resource, carrying its kind's teardown steps
    pub fn handles(&self) -> Vec<ResourceHandle> {
        self.resources
            .iter()
            .map(|resource| {
                let id = ResourceId::new(resource.kind.clone(), resource.id.clone());
                let mut handle = ResourceHandle::new(id).with_delete_params(resource.delete_params.clone());
                if let Some(kind) = self.kind(&resource.kind) {
                    handle = handle.with_delete_operation(&kind.delete_operation);
                    for t in &kind.transitions {
                        handle = handle.with_transition(
                            Transition::new(&t.operation, t.wait.to_spec()).with_params(t.params.clone()),
                        );
                    }
                    if !kind.delete_retry_codes.is_empty() {
                        handle = handle.with_delete_policy(self.kind_delete_policy(kind));
                    }
                    if let Some(wait) = &kind.delete_wait {
                        handle = handle.with_delete_wait(wait.to_spec().as_delete_wait());
                    }
                }
                handle
            })
            .collect()
    }

    fn kind_delete_policy(&self, kind: &KindManifest) -> RetryPolicy {
        let mut policy = self.retry.apply(RetryPolicy::for_delete());
        for code in &kind.delete_retry_codes {
            policy.classifier = policy.classifier.retry_on_code(code);
        }
        policy
    }

    pub fn plan(&self) -> Result<TeardownPlan, PlanError> {
        TeardownPlanner::plan(self.handles(), &self.dependency_graph())
    }

    /// Check the kind declarations for cycles, whether or not resources are listed
    pub fn check(&self) -> Result<(), PlanError> {
        let mut kinds: Vec<&ResourceKind> = Vec::new();
        for kind in &self.kinds {
            for name in std::iter::once(&kind.name).chain(&kind.after) {
                if !kinds.contains(&name) {
                    kinds.push(name);
                }
            }
        }
        let placeholders = kinds
            .into_iter()
            .map(|kind| ResourceHandle::new(ResourceId::new(kind.clone(), "*")))
            .collect();
        TeardownPlanner::plan(placeholders, &self.dependency_graph()).map(|_| ())
    }

    pub fn teardown_config(&self) -> TeardownConfig {
        TeardownConfig {
            workers: self.workers,
            delete_policy: self.retry.apply(RetryPolicy::for_delete()),
            transition_policy: self.retry.apply(RetryPolicy::for_update()),
            dry_run: self.dry_run,
            ..TeardownConfig::default()
        }
    }
}
