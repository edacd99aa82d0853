//! Centralized test fixtures for engine unit tests
//!
//! [`ScriptedControlPlane`] answers `describe` and `invoke` from per-resource
//! scripts. The last entry of a script repeats forever; a resource without a
//! describe script is reported as not found.

use crate::control_plane::{ControlPlane, ControlPlaneError, Invocation};
use reconcile_common::{Observation, ObservedState, ResourceId};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

type DescribeScript = VecDeque<Result<Observation, ControlPlaneError>>;
type InvokeScript = VecDeque<Result<Value, ControlPlaneError>>;

fn next_from<T: Clone>(script: &mut VecDeque<T>) -> Option<T> {
    if script.len() > 1 {
        script.pop_front()
    } else {
        script.front().cloned()
    }
}

pub fn not_found_error() -> ControlPlaneError {
    ControlPlaneError::new("ResourceNotFoundException", "resource does not exist")
}

/// One recorded `invoke` call
#[derive(Debug, Clone)]
pub struct InvokeRecord {
    pub at: Instant,
    pub label: String,
}

#[derive(Default)]
struct Inner {
    describe: HashMap<ResourceId, DescribeScript>,
    invoke: HashMap<(String, Option<ResourceId>), InvokeScript>,
    after_invoke: HashMap<(String, ResourceId), DescribeScript>,
    describe_calls: HashMap<ResourceId, u32>,
    invocations: Vec<InvokeRecord>,
    in_flight: usize,
    max_in_flight: usize,
}

#[derive(Default)]
pub struct ScriptedControlPlane {
    inner: Mutex<Inner>,
    invoke_latency: Duration,
    describe_latency: Duration,
}

impl ScriptedControlPlane {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `invoke` takes this long (virtual time under `start_paused`)
    pub fn with_invoke_latency(mut self, latency: Duration) -> Self {
        self.invoke_latency = latency;
        self
    }

    /// Every `describe` takes this long before answering
    pub fn with_describe_latency(mut self, latency: Duration) -> Self {
        self.describe_latency = latency;
        self
    }

    pub fn script_describe(
        &self,
        resource: &ResourceId,
        answers: Vec<Result<Observation, ControlPlaneError>>,
    ) {
        self.inner
            .lock()
            .unwrap()
            .describe
            .insert(resource.clone(), answers.into());
    }

    pub fn script_states<I, S>(&self, resource: &ResourceId, states: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<ObservedState>,
    {
        let answers = states
            .into_iter()
            .map(|s| Ok(Observation::new(s)))
            .collect();
        self.script_describe(resource, answers);
    }

    pub fn script_invoke(
        &self,
        operation: &str,
        resource: Option<&ResourceId>,
        answers: Vec<Result<Value, ControlPlaneError>>,
    ) {
        self.inner
            .lock()
            .unwrap()
            .invoke
            .insert((operation.to_string(), resource.cloned()), answers.into());
    }

    /// Replace the describe script of `resource` once `operation` on it succeeds
    pub fn after_invoke(
        &self,
        operation: &str,
        resource: &ResourceId,
        answers: Vec<Result<Observation, ControlPlaneError>>,
    ) {
        self.inner
            .lock()
            .unwrap()
            .after_invoke
            .insert((operation.to_string(), resource.clone()), answers.into());
    }

    pub fn describe_count(&self, resource: &ResourceId) -> u32 {
        self.inner
            .lock()
            .unwrap()
            .describe_calls
            .get(resource)
            .copied()
            .unwrap_or(0)
    }

    pub fn invocations(&self) -> Vec<InvokeRecord> {
        self.inner.lock().unwrap().invocations.clone()
    }

    pub fn invocation_labels(&self) -> Vec<String> {
        self.invocations().into_iter().map(|r| r.label).collect()
    }

    /// Position of the first invocation with this label
    pub fn position(&self, label: &str) -> Option<usize> {
        self.invocations().iter().position(|r| r.label == label)
    }

    pub fn max_in_flight(&self) -> usize {
        self.inner.lock().unwrap().max_in_flight
    }
}

impl ControlPlane for ScriptedControlPlane {
    fn invoke(
        &self,
        invocation: &Invocation,
    ) -> impl Future<Output = Result<Value, ControlPlaneError>> + Send {
        async move {
            {
                let mut inner = self.inner.lock().unwrap();
                inner.invocations.push(InvokeRecord {
                    at: Instant::now(),
                    label: invocation.label(),
                });
                inner.in_flight += 1;
                inner.max_in_flight = inner.max_in_flight.max(inner.in_flight);
            }

            if !self.invoke_latency.is_zero() {
                tokio::time::sleep(self.invoke_latency).await;
            }

            let mut inner = self.inner.lock().unwrap();
            inner.in_flight -= 1;
            let key = (invocation.operation.clone(), invocation.resource.clone());
            let result = inner
                .invoke
                .get_mut(&key)
                .and_then(next_from)
                .unwrap_or(Ok(Value::Null));

            if let (Ok(_), Some(resource)) = (&result, &invocation.resource) {
                let key = (invocation.operation.clone(), resource.clone());
                if let Some(script) = inner.after_invoke.remove(&key) {
                    inner.describe.insert(resource.clone(), script);
                }
            }
            result
        }
    }

    fn describe(
        &self,
        resource: &ResourceId,
    ) -> impl Future<Output = Result<Observation, ControlPlaneError>> + Send {
        async move {
            if !self.describe_latency.is_zero() {
                tokio::time::sleep(self.describe_latency).await;
            }
            let mut inner = self.inner.lock().unwrap();
            *inner.describe_calls.entry(resource.clone()).or_default() += 1;
            inner
                .describe
                .get_mut(resource)
                .and_then(next_from)
                .unwrap_or_else(|| Err(not_found_error()))
        }
    }
}
