//! reconcile-engine - convergence and teardown against an eventually-consistent control plane
//!
//! The engine sits between resource lifecycle code and a remote control
//! plane that accepts calls long before their effects are observable.
//!
//! ## Modules
//!
//! - [`control_plane`]: the injected `invoke`/`describe` trait and error classification
//! - [`retry`]: classified retries with bounded attempts and elapsed time
//! - [`wait`]: polling until a resource reaches a target state
//! - [`teardown`]: dependency-ordered teardown planning and execution
//! - [`sweep`]: scope-wide discovery and cleanup via per-kind sweepers
//! - [`config`]: teardown manifests for the `reconcile` CLI

pub mod config;
pub mod control_plane;
pub mod retry;
pub mod sweep;
pub mod teardown;
pub mod wait;

#[cfg(test)]
mod testing;

pub use control_plane::{ControlPlane, ControlPlaneError, ErrorClass, ErrorClassifier, Invocation};
pub use retry::{Backoff, RetryError, RetryExecutor, RetryPolicy};
pub use teardown::{
    DependencyGraph, ResourceHandle, TeardownConfig, TeardownOrchestrator, TeardownPlanner,
    TeardownReport,
};
pub use wait::{Converged, StateWaiter, WaitError, WaitSpec};
