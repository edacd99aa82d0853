//! In-memory control plane with per-resource state machines
//!
//! Resources carry a current state plus a queue of states they will report
//! on subsequent `describe` calls, which is how eventual consistency is
//! simulated: an accepted call only becomes visible a few polls later.

use reconcile_common::{Observation, ResourceId, ResourceKind};
use reconcile_engine::control_plane::{ControlPlane, ControlPlaneError, Invocation};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Mutex;
use tokio::time::Instant;

/// Code returned for missing resources
pub const NOT_FOUND_CODE: &str = "ResourceNotFoundException";

#[derive(Debug, Clone)]
struct SimResource {
    state: String,
    reason: Option<String>,
    /// States reported by the next `describe` calls, in order
    upcoming: VecDeque<String>,
    /// Polls left before a deleted resource disappears
    deleting_polls: Option<u32>,
}

#[derive(Debug, Clone)]
enum Effect {
    /// Describe walks through these states; the last one sticks
    Transition(Vec<String>),
    /// Resource reports `DELETING` for this many polls, then is gone
    Delete { deleting_polls: u32 },
    /// Resource list for a kind, as a JSON array of ids
    List(ResourceKind),
}

#[derive(Debug, Clone)]
struct DeleteGuard {
    blocker: ResourceKind,
    error: ControlPlaneError,
}

/// One recorded `invoke`
#[derive(Debug, Clone)]
pub struct Call {
    pub at: Instant,
    pub operation: String,
    pub resource: Option<ResourceId>,
}

#[derive(Default)]
struct State {
    resources: HashMap<ResourceId, SimResource>,
    /// Insertion order, so listings are deterministic
    order: Vec<ResourceId>,
    effects: HashMap<(String, Option<ResourceKind>), Effect>,
    guards: HashMap<ResourceKind, Vec<DeleteGuard>>,
    failures: HashMap<(String, Option<ResourceId>), VecDeque<ControlPlaneError>>,
    describe_failures: HashMap<ResourceId, VecDeque<ControlPlaneError>>,
    calls: Vec<Call>,
    describes: HashMap<ResourceId, u32>,
}

/// Simulated control plane for integration tests.
///
/// ```
/// use reconcile_test_utils::SimulatedControlPlane;
/// use reconcile_common::ResourceId;
///
/// let cp = SimulatedControlPlane::new();
/// let queue = ResourceId::new("aws_batch_job_queue", "jq-1");
/// cp.add_resource(&queue, "ENABLED");
/// cp.on_transition("aws_batch_job_queue", "disable", ["UPDATING", "DISABLED"]);
/// cp.on_delete("aws_batch_job_queue", "delete", 1);
/// assert!(cp.exists(&queue));
/// ```
#[derive(Default)]
pub struct SimulatedControlPlane {
    state: Mutex<State>,
}

impl SimulatedControlPlane {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_resource(&self, id: &ResourceId, state: &str) {
        let mut s = self.state.lock().unwrap();
        if s.resources
            .insert(
                id.clone(),
                SimResource {
                    state: state.to_string(),
                    reason: None,
                    upcoming: VecDeque::new(),
                    deleting_polls: None,
                },
            )
            .is_none()
        {
            s.order.push(id.clone());
        }
    }

    /// Make `operation` on resources of `kind` walk them through `states`
    pub fn on_transition<I, S>(&self, kind: &str, operation: &str, states: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let states = states.into_iter().map(Into::into).collect();
        self.state.lock().unwrap().effects.insert(
            (operation.to_string(), Some(kind.into())),
            Effect::Transition(states),
        );
    }

    pub fn on_delete(&self, kind: &str, operation: &str, deleting_polls: u32) {
        self.state.lock().unwrap().effects.insert(
            (operation.to_string(), Some(kind.into())),
            Effect::Delete { deleting_polls },
        );
    }

    /// Scope-wide `operation` lists the live resources of `kind`
    pub fn on_list(&self, operation: &str, kind: &str) {
        self.state
            .lock()
            .unwrap()
            .effects
            .insert((operation.to_string(), None), Effect::List(kind.into()));
    }

    /// Deleting a resource of `kind` fails with `error` while any `blocker` exists
    pub fn block_delete_while(&self, kind: &str, blocker: &str, error: ControlPlaneError) {
        self.state
            .lock()
            .unwrap()
            .guards
            .entry(kind.into())
            .or_default()
            .push(DeleteGuard {
                blocker: blocker.into(),
                error,
            });
    }

    /// The next `times` calls of `operation` on `resource` fail with `error`
    pub fn fail_invoke(
        &self,
        operation: &str,
        resource: Option<&ResourceId>,
        error: ControlPlaneError,
        times: usize,
    ) {
        self.state
            .lock()
            .unwrap()
            .failures
            .entry((operation.to_string(), resource.cloned()))
            .or_default()
            .extend(std::iter::repeat_n(error, times));
    }

    pub fn fail_describe(&self, resource: &ResourceId, error: ControlPlaneError, times: usize) {
        self.state
            .lock()
            .unwrap()
            .describe_failures
            .entry(resource.clone())
            .or_default()
            .extend(std::iter::repeat_n(error, times));
    }

    /// Report `state` with `reason` from now on
    pub fn set_state(&self, id: &ResourceId, state: &str, reason: Option<&str>) {
        if let Some(r) = self.state.lock().unwrap().resources.get_mut(id) {
            r.state = state.to_string();
            r.reason = reason.map(str::to_string);
            r.upcoming.clear();
        }
    }

    pub fn exists(&self, id: &ResourceId) -> bool {
        self.state.lock().unwrap().resources.contains_key(id)
    }

    pub fn current_state(&self, id: &ResourceId) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .resources
            .get(id)
            .map(|r| r.state.clone())
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    /// `"operation kind/id"` labels, in call order
    pub fn call_labels(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .map(|c| match c.resource {
                Some(r) => format!("{} {}", c.operation, r),
                None => c.operation,
            })
            .collect()
    }

    /// Calls of `operation`, optionally restricted to one resource
    pub fn call_count(&self, operation: &str, resource: Option<&ResourceId>) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.operation == operation)
            .filter(|c| resource.is_none() || c.resource.as_ref() == resource)
            .count()
    }

    pub fn describe_count(&self, id: &ResourceId) -> u32 {
        self.state
            .lock()
            .unwrap()
            .describes
            .get(id)
            .copied()
            .unwrap_or(0)
    }

    fn apply(&self, invocation: &Invocation) -> Result<Value, ControlPlaneError> {
        let mut s = self.state.lock().unwrap();
        s.calls.push(Call {
            at: Instant::now(),
            operation: invocation.operation.clone(),
            resource: invocation.resource.clone(),
        });

        let failure_key = (invocation.operation.clone(), invocation.resource.clone());
        if let Some(error) = s.failures.get_mut(&failure_key).and_then(VecDeque::pop_front) {
            return Err(error);
        }

        let kind = invocation.resource.as_ref().map(|r| r.kind.clone());
        let effect = s
            .effects
            .get(&(invocation.operation.clone(), kind))
            .cloned();

        match (effect, &invocation.resource) {
            (Some(Effect::List(kind)), _) => {
                let ids: Vec<Value> = s
                    .order
                    .iter()
                    .filter(|id| id.kind == kind && s.resources.contains_key(*id))
                    .map(|id| Value::String(id.id.clone()))
                    .collect();
                Ok(Value::Array(ids))
            }
            (effect, Some(id)) => {
                if !s.resources.contains_key(id) {
                    return Err(not_found(id));
                }
                match effect {
                    Some(Effect::Transition(states)) => {
                        if let Some(r) = s.resources.get_mut(id) {
                            r.upcoming = states.into();
                        }
                    }
                    Some(Effect::Delete { deleting_polls }) => {
                        let blocked = s.guards.get(&id.kind).and_then(|guards| {
                            guards.iter().find(|g| {
                                s.resources.keys().any(|other| other.kind == g.blocker)
                            })
                        });
                        if let Some(guard) = blocked {
                            return Err(guard.error.clone());
                        }
                        if deleting_polls == 0 {
                            s.resources.remove(id);
                        } else if let Some(r) = s.resources.get_mut(id) {
                            r.state = "DELETING".to_string();
                            r.upcoming.clear();
                            r.deleting_polls = Some(deleting_polls);
                        }
                    }
                    _ => {}
                }
                Ok(Value::Null)
            }
            (_, None) => Err(ControlPlaneError::new(
                "UnsupportedOperation",
                format!("{} is not supported", invocation.operation),
            )),
        }
    }

    fn observe(&self, id: &ResourceId) -> Result<Observation, ControlPlaneError> {
        let mut s = self.state.lock().unwrap();
        *s.describes.entry(id.clone()).or_default() += 1;

        if let Some(error) = s
            .describe_failures
            .get_mut(id)
            .and_then(VecDeque::pop_front)
        {
            return Err(error);
        }

        let Some(r) = s.resources.get_mut(id) else {
            return Err(not_found(id));
        };

        if let Some(polls) = r.deleting_polls {
            if polls == 0 {
                s.resources.remove(id);
                return Err(not_found(id));
            }
            r.deleting_polls = Some(polls - 1);
        } else if let Some(next) = r.upcoming.pop_front() {
            r.state = next;
        }

        let mut observation = Observation::new(r.state.as_str());
        if let Some(reason) = &r.reason {
            observation = observation.with_reason(reason.clone());
        }
        Ok(observation)
    }
}

fn not_found(id: &ResourceId) -> ControlPlaneError {
    ControlPlaneError::new(NOT_FOUND_CODE, format!("{id} does not exist"))
}

impl ControlPlane for SimulatedControlPlane {
    fn invoke(
        &self,
        invocation: &Invocation,
    ) -> impl Future<Output = Result<Value, ControlPlaneError>> + Send {
        let result = self.apply(invocation);
        async move {
            tokio::task::yield_now().await;
            result
        }
    }

    fn describe(
        &self,
        resource: &ResourceId,
    ) -> impl Future<Output = Result<Observation, ControlPlaneError>> + Send {
        let result = self.observe(resource);
        std::future::ready(result)
    }
}
