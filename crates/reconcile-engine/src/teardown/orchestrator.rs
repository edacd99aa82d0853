//! Executes a [`TeardownPlan`] with a bounded worker pool.
//!
//! Each resource runs a strictly sequential pipeline:
//!
//! ```text
//! transition₁ → wait₁ → … → transitionₙ → waitₙ → delete → wait(gone)
//! ```
//!
//! Independent resources run concurrently, up to `workers` at a time. A
//! resource starts only once every step it is ordered after has finished;
//! if one of those did not end up gone, the resource is skipped as blocked.
//! Failures never stop the rest of the plan. The scheduling loop is the only
//! writer of the outcome table.

use super::planner::TeardownPlan;
use super::types::{
    ResourceHandle, SkipReason, Step, TeardownEntry, TeardownError, TeardownOutcome,
    TeardownReport,
};
use crate::control_plane::{ControlPlane, ErrorClassifier, Invocation};
use crate::retry::{RetryError, RetryExecutor, RetryPolicy, cancelled};
use crate::wait::{StateWaiter, WaitError, WaitSpec};
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use reconcile_common::defaults::DEFAULT_TEARDOWN_WORKERS;
use std::collections::{BTreeSet, HashSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct TeardownConfig {
    /// Maximum number of resources torn down concurrently
    pub workers: usize,
    pub delete_policy: RetryPolicy,
    pub transition_policy: RetryPolicy,
    /// Classifies `describe` errors while waiting
    pub describe_classifier: ErrorClassifier,
    /// Delete wait for handles that do not carry their own
    pub delete_wait: WaitSpec,
    /// Plan and report without invoking anything
    pub dry_run: bool,
}

impl Default for TeardownConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_TEARDOWN_WORKERS,
            delete_policy: RetryPolicy::for_delete(),
            transition_policy: RetryPolicy::for_update(),
            describe_classifier: ErrorClassifier::for_describe(),
            delete_wait: WaitSpec::until_deleted(),
            dry_run: false,
        }
    }
}

pub struct TeardownOrchestrator<C> {
    control_plane: C,
    config: TeardownConfig,
}

impl<C: ControlPlane> TeardownOrchestrator<C> {
    pub fn new(control_plane: C, config: TeardownConfig) -> Self {
        Self {
            control_plane,
            config,
        }
    }

    pub fn config(&self) -> &TeardownConfig {
        &self.config
    }

    /// Tear down every resource in `plan`.
    ///
    /// Always returns one entry per planned resource, in input order. Use
    /// [`TeardownReport::into_result`] to turn failures into an error.
    pub async fn run(&self, plan: &TeardownPlan, cancel: Option<&CancellationToken>) -> TeardownReport {
        let count = plan.len();
        let workers = self.config.workers.max(1);
        info!(resources = count, workers, dry_run = self.config.dry_run, "Starting teardown");

        let mut outcomes: Vec<Option<TeardownOutcome>> = vec![None; count];
        let mut waiting_on: Vec<usize> = plan.steps.iter().map(|s| s.after.len()).collect();
        let mut successors: Vec<Vec<usize>> = vec![Vec::new(); count];
        for (i, step) in plan.steps.iter().enumerate() {
            for &before in &step.after {
                successors[before].push(i);
            }
        }

        let mut ready: BTreeSet<usize> = (0..count).filter(|&i| waiting_on[i] == 0).collect();
        let mut in_flight: HashSet<usize> = HashSet::new();
        let mut running = FuturesUnordered::new();
        let cancel_signal = cancelled(cancel);
        tokio::pin!(cancel_signal);

        loop {
            if cancel.is_some_and(|token| token.is_cancelled()) {
                break;
            }

            while in_flight.len() < workers {
                let Some(i) = ready.pop_first() else {
                    break;
                };
                let step = &plan.steps[i];
                let blockers: Vec<_> = step
                    .after
                    .iter()
                    .filter(|&&b| {
                        !outcomes[b]
                            .as_ref()
                            .is_some_and(TeardownOutcome::releases_successors)
                    })
                    .map(|&b| plan.steps[b].handle.id.clone())
                    .collect();

                if !blockers.is_empty() {
                    warn!(resource = %step.handle.id, blocked_by = ?blockers, "Skipping teardown, predecessor not gone");
                    outcomes[i] = Some(TeardownOutcome::Skipped(SkipReason::Blocked { by: blockers }));
                    release(i, &successors, &mut waiting_on, &mut ready);
                    continue;
                }

                in_flight.insert(i);
                running.push(async move { (i, self.teardown_one(&step.handle, cancel).await) });
            }

            if running.is_empty() {
                break;
            }

            tokio::select! {
                Some((i, outcome)) = running.next() => {
                    in_flight.remove(&i);
                    log_outcome(&plan.steps[i].handle, &outcome);
                    outcomes[i] = Some(outcome);
                    release(i, &successors, &mut waiting_on, &mut ready);
                }
                _ = &mut cancel_signal => {
                    break;
                }
            }
        }

        drop(running);
        if !in_flight.is_empty() || outcomes.iter().any(Option::is_none) {
            warn!(in_flight = in_flight.len(), "Teardown cancelled");
        }

        let mut entries: Vec<Option<TeardownEntry>> = vec![None; count];
        for (i, step) in plan.steps.iter().enumerate() {
            let outcome = outcomes[i].take().unwrap_or_else(|| {
                if in_flight.contains(&i) {
                    TeardownOutcome::Cancelled
                } else {
                    TeardownOutcome::Skipped(SkipReason::NotStarted)
                }
            });
            entries[step.input_index] = Some(TeardownEntry {
                resource: step.handle.id.clone(),
                outcome,
            });
        }

        let report = TeardownReport {
            entries: entries.into_iter().flatten().collect(),
        };
        let summary = report.summary();
        info!(
            succeeded = summary.succeeded,
            skipped = summary.skipped,
            failed = summary.failed,
            cancelled = summary.cancelled,
            "Teardown finished"
        );
        report
    }

    async fn teardown_one(
        &self,
        handle: &ResourceHandle,
        cancel: Option<&CancellationToken>,
    ) -> TeardownOutcome {
        if self.config.dry_run {
            info!(resource = %handle.id, transitions = handle.transitions.len(), "[DRY RUN] Would tear down");
            return TeardownOutcome::Skipped(SkipReason::DryRun);
        }

        let executor = RetryExecutor::new(&self.control_plane);
        let waiter = StateWaiter::new(&self.control_plane, self.config.describe_classifier.clone());

        for transition in &handle.transitions {
            let step = Step::Transition(transition.operation.clone());
            info!(resource = %handle.id, operation = %transition.operation, "Applying transition");

            let invocation = Invocation::transition(&transition.operation, handle.id.clone())
                .with_params(transition.params.clone());
            let policy = transition
                .policy
                .as_ref()
                .unwrap_or(&self.config.transition_policy);
            if let Err(e) = executor
                .execute(policy, &invocation, cancel)
                .await
            {
                return invoke_failure(step, e);
            }

            if let Err(e) = waiter.wait(&handle.id, &transition.wait, cancel).await {
                return wait_failure(step, e);
            }
        }

        let step = Step::Delete(handle.delete_operation.clone());
        let invocation = Invocation::delete(&handle.delete_operation, handle.id.clone())
            .with_params(handle.delete_params.clone());
        let policy = handle
            .delete_policy
            .as_ref()
            .unwrap_or(&self.config.delete_policy);
        match executor
            .execute(policy, &invocation, cancel)
            .await
        {
            Ok(Some(_)) => {}
            Ok(None) => return TeardownOutcome::Skipped(SkipReason::AlreadyGone),
            Err(e) => return invoke_failure(step, e),
        }

        let delete_wait = handle
            .delete_wait
            .as_ref()
            .unwrap_or(&self.config.delete_wait)
            .as_delete_wait();
        match waiter.wait(&handle.id, &delete_wait, cancel).await {
            Ok(_) => TeardownOutcome::Succeeded,
            Err(e) => wait_failure(step, e),
        }
    }
}

fn invoke_failure(step: Step, error: RetryError) -> TeardownOutcome {
    match error {
        RetryError::Cancelled { .. } => TeardownOutcome::Cancelled,
        RetryError::NotFound { .. } => TeardownOutcome::Skipped(SkipReason::AlreadyGone),
        source => TeardownOutcome::Failed(TeardownError::Invoke { step, source }),
    }
}

fn wait_failure(step: Step, error: WaitError) -> TeardownOutcome {
    match error {
        WaitError::Cancelled { .. } => TeardownOutcome::Cancelled,
        WaitError::Disappeared { .. } => TeardownOutcome::Skipped(SkipReason::AlreadyGone),
        source => TeardownOutcome::Failed(TeardownError::Wait { step, source }),
    }
}

/// Mark step `i` finished and queue successors with nothing left to wait on
fn release(
    i: usize,
    successors: &[Vec<usize>],
    waiting_on: &mut [usize],
    ready: &mut BTreeSet<usize>,
) {
    for &next in &successors[i] {
        waiting_on[next] -= 1;
        if waiting_on[next] == 0 {
            ready.insert(next);
        }
    }
}

fn log_outcome(handle: &ResourceHandle, outcome: &TeardownOutcome) {
    match outcome {
        TeardownOutcome::Failed(e) => {
            warn!(resource = %handle.id, error = %e, "Teardown failed")
        }
        TeardownOutcome::Cancelled => debug!(resource = %handle.id, "Teardown cancelled"),
        other => info!(resource = %handle.id, outcome = %other, "Teardown step finished"),
    }
}
