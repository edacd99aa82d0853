//! End-to-end teardown against the simulated control plane
//!
//! Run with:
//! ```
//! cargo test -p reconcile-engine --test teardown_integration
//! ```

use reconcile_common::ResourceId;
use reconcile_engine::control_plane::ControlPlaneError;
use reconcile_engine::teardown::{
    DependencyGraph, ResourceHandle, SkipReason, TeardownOrchestrator, TeardownOutcome,
    TeardownPlanner, Transition,
};
use reconcile_test_utils::{SimulatedControlPlane, fast_teardown_config, fast_wait, init_test_tracing};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const JOB_QUEUE: &str = "aws_batch_job_queue";
const COMPUTE_ENV: &str = "aws_batch_compute_environment";

/// Job queues and compute environments must be disabled before deletion,
/// and a compute environment cannot be deleted while a job queue uses it.
fn batch_control_plane() -> Arc<SimulatedControlPlane> {
    let cp = Arc::new(SimulatedControlPlane::new());
    cp.on_transition(JOB_QUEUE, "UpdateJobQueue", ["UPDATING", "UPDATING", "VALID"]);
    cp.on_transition(COMPUTE_ENV, "UpdateComputeEnvironment", ["UPDATING", "VALID"]);
    cp.on_delete(JOB_QUEUE, "DeleteJobQueue", 2);
    cp.on_delete(COMPUTE_ENV, "DeleteComputeEnvironment", 1);
    cp.block_delete_while(
        COMPUTE_ENV,
        JOB_QUEUE,
        ControlPlaneError::new("ClientException", "Cannot delete, found existing JobQueue relationship"),
    );
    cp
}

fn job_queue(id: &str) -> ResourceHandle {
    ResourceHandle::new(ResourceId::new(JOB_QUEUE, id))
        .with_transition(
            Transition::new("UpdateJobQueue", fast_wait(["VALID"]).failing_on(["INVALID"]))
                .with_params(serde_json::json!({ "state": "DISABLED" })),
        )
        .with_delete_operation("DeleteJobQueue")
}

fn compute_env(id: &str) -> ResourceHandle {
    ResourceHandle::new(ResourceId::new(COMPUTE_ENV, id))
        .with_transition(Transition::new(
            "UpdateComputeEnvironment",
            fast_wait(["VALID"]).failing_on(["INVALID"]),
        ))
        .with_delete_operation("DeleteComputeEnvironment")
}

fn batch_graph() -> DependencyGraph {
    let mut graph = DependencyGraph::new();
    graph.depends_on(JOB_QUEUE, COMPUTE_ENV);
    graph
}

#[tokio::test(start_paused = true)]
async fn test_batch_teardown_in_dependency_order() {
    init_test_tracing();
    let cp = batch_control_plane();
    let jq = ResourceId::new(JOB_QUEUE, "jq-1");
    let ce = ResourceId::new(COMPUTE_ENV, "ce-1");
    cp.add_resource(&ce, "VALID");
    cp.add_resource(&jq, "VALID");

    let plan = TeardownPlanner::plan(vec![compute_env("ce-1"), job_queue("jq-1")], &batch_graph())
        .expect("acyclic");
    let report = TeardownOrchestrator::new(cp.clone(), fast_teardown_config(4))
        .run(&plan, None)
        .await;

    let report = report.into_result().expect("teardown should succeed");
    assert!(matches!(report.outcome(&jq), Some(TeardownOutcome::Succeeded)));
    assert!(matches!(report.outcome(&ce), Some(TeardownOutcome::Succeeded)));
    assert!(!cp.exists(&jq));
    assert!(!cp.exists(&ce));

    assert_eq!(
        cp.call_labels(),
        vec![
            format!("UpdateJobQueue {jq}"),
            format!("DeleteJobQueue {jq}"),
            format!("UpdateComputeEnvironment {ce}"),
            format!("DeleteComputeEnvironment {ce}"),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_invalid_job_queue_blocks_compute_environment() {
    init_test_tracing();
    let cp = batch_control_plane();
    let jq = ResourceId::new(JOB_QUEUE, "jq-1");
    let ce = ResourceId::new(COMPUTE_ENV, "ce-1");
    cp.add_resource(&jq, "VALID");
    cp.add_resource(&ce, "VALID");
    cp.on_transition(JOB_QUEUE, "UpdateJobQueue", ["UPDATING", "INVALID"]);

    let plan = TeardownPlanner::plan(vec![job_queue("jq-1"), compute_env("ce-1")], &batch_graph())
        .expect("acyclic");
    let report = TeardownOrchestrator::new(cp.clone(), fast_teardown_config(4))
        .run(&plan, None)
        .await;

    assert!(report.outcome(&jq).is_some_and(TeardownOutcome::is_failed));
    assert!(matches!(
        report.outcome(&ce),
        Some(TeardownOutcome::Skipped(SkipReason::Blocked { .. }))
    ));
    assert_eq!(cp.call_count("UpdateComputeEnvironment", None), 0);
    assert!(cp.exists(&ce));

    let err = report.into_result().unwrap_err();
    assert_eq!(err.failures.len(), 1);
    assert!(err.to_string().contains("INVALID"), "{err}");
}

#[tokio::test(start_paused = true)]
async fn test_denied_job_queue_delete_blocks_compute_environment() {
    init_test_tracing();
    let cp = batch_control_plane();
    let jq = ResourceId::new(JOB_QUEUE, "jq-1");
    let ce = ResourceId::new(COMPUTE_ENV, "ce-1");
    cp.add_resource(&jq, "VALID");
    cp.add_resource(&ce, "VALID");
    cp.fail_invoke(
        "DeleteJobQueue",
        Some(&jq),
        ControlPlaneError::new("AccessDeniedException", "not authorized to perform batch:DeleteJobQueue"),
        1,
    );

    let plan = TeardownPlanner::plan(vec![job_queue("jq-1"), compute_env("ce-1")], &batch_graph())
        .expect("acyclic");
    let report = TeardownOrchestrator::new(cp.clone(), fast_teardown_config(4))
        .run(&plan, None)
        .await;

    assert!(report.outcome(&jq).is_some_and(TeardownOutcome::is_failed));
    match report.outcome(&ce) {
        Some(TeardownOutcome::Skipped(SkipReason::Blocked { by })) => assert_eq!(by, &vec![jq.clone()]),
        other => panic!("expected blocked, got {other:?}"),
    }
    assert_eq!(cp.call_count("DeleteJobQueue", Some(&jq)), 1);
    assert_eq!(cp.call_count("UpdateComputeEnvironment", None), 0);
    assert!(cp.exists(&jq));
    assert!(cp.exists(&ce));

    let err = report.into_result().unwrap_err();
    assert_eq!(err.failures.len(), 1);
    assert_eq!(err.failures[0].0, jq);
    assert!(err.to_string().contains("AccessDeniedException"), "{err}");
}

#[tokio::test(start_paused = true)]
async fn test_already_deleted_resources_are_skipped() {
    init_test_tracing();
    let cp = batch_control_plane();
    // Neither resource exists any more
    let plan = TeardownPlanner::plan(vec![job_queue("jq-gone"), compute_env("ce-gone")], &batch_graph())
        .expect("acyclic");
    let report = TeardownOrchestrator::new(cp.clone(), fast_teardown_config(4))
        .run(&plan, None)
        .await;

    for entry in &report.entries {
        assert!(
            matches!(entry.outcome, TeardownOutcome::Skipped(SkipReason::AlreadyGone)),
            "{}: {}",
            entry.resource,
            entry.outcome
        );
    }
    assert!(report.into_result().is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_dependency_violation_is_retried_until_cleared() {
    init_test_tracing();
    let cp = Arc::new(SimulatedControlPlane::new());
    let instance = ResourceId::new("aws_instance", "i-1");
    let sg = ResourceId::new("aws_security_group", "sg-1");
    cp.add_resource(&instance, "running");
    cp.add_resource(&sg, "available");
    cp.on_delete("aws_instance", "TerminateInstances", 1);
    cp.on_delete("aws_security_group", "DeleteSecurityGroup", 0);
    cp.block_delete_while(
        "aws_security_group",
        "aws_instance",
        ControlPlaneError::new("DependencyViolation", "resource sg-1 has a dependent object"),
    );

    // No ordering declared: both start at once, and the group's delete is
    // retried until the instance has fully terminated.
    let plan = TeardownPlanner::plan(
        vec![
            ResourceHandle::new(sg.clone()).with_delete_operation("DeleteSecurityGroup"),
            ResourceHandle::new(instance.clone()).with_delete_operation("TerminateInstances"),
        ],
        &DependencyGraph::new(),
    )
    .expect("acyclic");
    let report = TeardownOrchestrator::new(cp.clone(), fast_teardown_config(4))
        .run(&plan, None)
        .await;

    assert!(report.into_result().is_ok());
    assert!(cp.call_count("DeleteSecurityGroup", Some(&sg)) > 1);
    assert!(!cp.exists(&sg));
}

#[tokio::test(start_paused = true)]
async fn test_ordering_through_absent_network_interfaces() {
    init_test_tracing();
    let cp = Arc::new(SimulatedControlPlane::new());
    let instance = ResourceId::new("aws_instance", "i-1");
    let sg = ResourceId::new("aws_security_group", "sg-1");
    cp.add_resource(&instance, "running");
    cp.add_resource(&sg, "available");
    cp.on_delete("aws_instance", "delete", 2);
    cp.on_delete("aws_security_group", "delete", 0);

    let mut graph = DependencyGraph::new();
    graph.depends_on("aws_instance", "aws_network_interface");
    graph.depends_on("aws_network_interface", "aws_security_group");

    let plan = TeardownPlanner::plan(
        vec![ResourceHandle::new(sg.clone()), ResourceHandle::new(instance.clone())],
        &graph,
    )
    .expect("acyclic");
    TeardownOrchestrator::new(cp.clone(), fast_teardown_config(4))
        .run(&plan, None)
        .await
        .into_result()
        .expect("teardown should succeed");

    let calls = cp.calls();
    let instance_delete = calls.iter().find(|c| c.resource.as_ref() == Some(&instance)).unwrap();
    let sg_delete = calls.iter().find(|c| c.resource.as_ref() == Some(&sg)).unwrap();
    assert!(sg_delete.at > instance_delete.at);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_mid_teardown() {
    init_test_tracing();
    let cp = batch_control_plane();
    let jq = ResourceId::new(JOB_QUEUE, "jq-1");
    let ce = ResourceId::new(COMPUTE_ENV, "ce-1");
    cp.add_resource(&jq, "VALID");
    cp.add_resource(&ce, "VALID");
    // The queue never leaves UPDATING
    cp.on_transition(JOB_QUEUE, "UpdateJobQueue", ["UPDATING"]);

    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        canceller.cancel();
    });

    let plan = TeardownPlanner::plan(vec![job_queue("jq-1"), compute_env("ce-1")], &batch_graph())
        .expect("acyclic");
    let report = TeardownOrchestrator::new(cp.clone(), fast_teardown_config(4))
        .run(&plan, Some(&token))
        .await;

    assert!(matches!(report.outcome(&jq), Some(TeardownOutcome::Cancelled)));
    assert!(matches!(
        report.outcome(&ce),
        Some(TeardownOutcome::Skipped(SkipReason::NotStarted))
    ));
    assert!(cp.exists(&jq));
    assert!(cp.exists(&ce));
}
