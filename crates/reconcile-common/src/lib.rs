//! reconcile-common - Shared types and constants
//!
//! This crate holds the vocabulary shared by the engine, its CLI and the test
//! utilities, without any async runtime dependencies to keep it lightweight.
//!
//! ## Modules
//!
//! - [`defaults`]: Default timing values for retries, waits and teardown
//! - [`resource_kind`]: Resource kinds and fully qualified resource IDs
//! - [`state`]: Observed state values reported by the control plane

pub mod defaults;
pub mod resource_kind;
pub mod state;

// Re-export commonly used types
pub use resource_kind::{ResourceId, ResourceKind};
pub use state::{Observation, ObservedState, OperationKind};
