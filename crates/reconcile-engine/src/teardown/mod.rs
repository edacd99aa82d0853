//! Dependency-ordered teardown of interdependent resources
//!
//! - [`planner`]: orders handles so dependents go first, rejecting cycles
//! - [`orchestrator`]: runs the per-resource pipelines with a bounded worker pool
//! - [`types`]: handles, the dependency graph and the aggregated report

pub mod orchestrator;
pub mod planner;
pub mod types;

pub use orchestrator::{TeardownConfig, TeardownOrchestrator};
pub use planner::{PlanError, PlanStep, TeardownPlan, TeardownPlanner};
pub use types::{
    DependencyGraph, ResourceHandle, SkipReason, Step, TeardownEntry, TeardownError,
    TeardownFailed, TeardownOutcome, TeardownReport, TeardownSummary, Transition,
};
