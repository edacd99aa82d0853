//! Shared test utilities for the reconcile workspace
//!
//! This crate provides test helpers used by the engine's integration tests
//! without pulling test-only code into the engine itself.
//!
//! ## Modules
//!
//! - [`simulated`]: in-memory control plane with per-resource state machines
//! - [`fixtures`]: short retry/wait settings and tracing setup for tests

pub mod fixtures;
pub mod simulated;

// Re-export commonly used items
pub use fixtures::{fast_retry, fast_teardown_config, fast_wait, init_test_tracing};
pub use simulated::{Call, NOT_FOUND_CODE, SimulatedControlPlane};
