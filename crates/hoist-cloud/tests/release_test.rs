use std::collections::BTreeMap;
use std::time::Duration;

use hoist_cloud::diff::ChangeKind;
use hoist_cloud::release::{
    DeployOutcome, DeploymentRequest, ExecutionMode, ReleaseDriver, ReleaseError, ReleaseState,
};
use hoist_cloud::remote::{
    ControlPlane, DeployedStack, OperationHandle, RemoteError, StackSnapshot, StackStatus,
    StackSubmission, Submission,
};
use hoist_core::{RollbackPolicy, StackTemplate};
use mockall::mock;

mock! {
    Plane {}

    impl ControlPlane for Plane {
        async fn describe_stack(&self, stack_name: &str) -> Result<DeployedStack, RemoteError>;
        async fn create_stack(
            &self,
            submission: &StackSubmission,
        ) -> Result<OperationHandle, RemoteError>;
        async fn update_stack(
            &self,
            submission: &StackSubmission,
        ) -> Result<Submission, RemoteError>;
        async fn poll_operation(
            &self,
            handle: &OperationHandle,
        ) -> Result<StackSnapshot, RemoteError>;
        async fn delete_stack(&self, stack_name: &str) -> Result<(), RemoteError>;
    }
}

const STACK: &str = "shop-prod-api";

fn template() -> StackTemplate {
    StackTemplate::parse("Resources:\n  Queue:\n    Type: AWS::SQS::Queue\n").unwrap()
}

fn request(rollback: RollbackPolicy, mode: ExecutionMode) -> DeploymentRequest {
    DeploymentRequest {
        stack_name: STACK.to_owned(),
        template: template(),
        parameters: BTreeMap::from([("AppName".to_owned(), "shop".to_owned())]),
        tags: BTreeMap::new(),
        rollback,
        mode,
    }
}

fn handle() -> OperationHandle {
    OperationHandle {
        stack_name: STACK.to_owned(),
        stack_id: "arn:stack/shop-prod-api/1".to_owned(),
    }
}

fn deployed(status: StackStatus) -> DeployedStack {
    DeployedStack {
        status,
        reason: None,
        template: Some(template()),
    }
}

/// Poll responses in order; the last one repeats.
fn polls(
    steps: Vec<(StackStatus, Option<&'static str>)>,
) -> impl FnMut(&OperationHandle) -> Result<StackSnapshot, RemoteError> + Send + 'static {
    let snapshots: Vec<StackSnapshot> = steps
        .into_iter()
        .map(|(status, reason)| StackSnapshot {
            status,
            reason: reason.map(str::to_owned),
        })
        .collect();
    let mut next = 0;
    move |_: &OperationHandle| {
        let snapshot = snapshots[next.min(snapshots.len() - 1)].clone();
        next += 1;
        Ok(snapshot)
    }
}

fn driver(plane: MockPlane) -> ReleaseDriver<MockPlane> {
    ReleaseDriver::new(plane).with_poll_interval(Duration::from_secs(5))
}

// ── Create / Update ──

#[tokio::test(start_paused = true)]
async fn absent_stack_is_created_and_observed() {
    let mut plane = MockPlane::new();
    plane
        .expect_describe_stack()
        .returning(|_| Ok(DeployedStack::absent()));
    plane
        .expect_create_stack()
        .withf(|s| s.stack_name == STACK && !s.disable_rollback)
        .times(1)
        .returning(|_| Ok(handle()));
    plane.expect_update_stack().never();
    plane.expect_poll_operation().returning(polls(vec![
        (StackStatus::CreateInProgress, None),
        (StackStatus::CreateInProgress, None),
        (StackStatus::CreateComplete, None),
    ]));

    let driver = driver(plane);
    let mut session = driver.session(STACK).await;
    let diff = session.diff(&template()).await.unwrap();
    assert_eq!(diff.count(ChangeKind::Added), 1);
    assert_eq!(session.state(), ReleaseState::DiffComputed);

    let outcome = session
        .deploy(&request(RollbackPolicy::Auto, ExecutionMode::Attached))
        .await
        .unwrap();

    match outcome {
        DeployOutcome::Succeeded {
            status,
            transitions,
        } => {
            assert_eq!(status, StackStatus::CreateComplete);
            let seen: Vec<StackStatus> = transitions.iter().map(|t| t.status).collect();
            assert_eq!(
                seen,
                [StackStatus::CreateInProgress, StackStatus::CreateComplete]
            );
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(session.state(), ReleaseState::Succeeded);
}

#[tokio::test(start_paused = true)]
async fn existing_stack_is_updated() {
    let mut plane = MockPlane::new();
    plane
        .expect_describe_stack()
        .returning(|_| Ok(deployed(StackStatus::UpdateComplete)));
    plane.expect_create_stack().never();
    plane
        .expect_update_stack()
        .times(1)
        .returning(|_| Ok(Submission::Started(handle())));
    plane.expect_poll_operation().returning(polls(vec![
        (StackStatus::UpdateInProgress, None),
        (StackStatus::UpdateComplete, None),
    ]));

    let outcome = driver(plane)
        .deploy(&request(RollbackPolicy::Auto, ExecutionMode::Attached))
        .await
        .unwrap();

    assert!(matches!(
        outcome,
        DeployOutcome::Succeeded {
            status: StackStatus::UpdateComplete,
            ..
        }
    ));
}

#[tokio::test]
async fn unchanged_stack_reports_no_changes() {
    let mut plane = MockPlane::new();
    plane
        .expect_describe_stack()
        .returning(|_| Ok(deployed(StackStatus::CreateComplete)));
    plane
        .expect_update_stack()
        .returning(|_| Ok(Submission::NoChanges));
    plane.expect_poll_operation().never();

    let driver = driver(plane);
    let diff = driver.diff(STACK, &template()).await.unwrap();
    assert!(!diff.has_changes());
    assert_eq!(diff.exit_code(), 0);

    let outcome = driver
        .deploy(&request(RollbackPolicy::Auto, ExecutionMode::Attached))
        .await
        .unwrap();
    assert_eq!(outcome, DeployOutcome::NoChanges);
}

#[tokio::test]
async fn detached_mode_returns_after_acceptance() {
    let mut plane = MockPlane::new();
    plane
        .expect_describe_stack()
        .returning(|_| Ok(deployed(StackStatus::UpdateComplete)));
    plane
        .expect_update_stack()
        .returning(|_| Ok(Submission::Started(handle())));
    plane.expect_poll_operation().never();

    let outcome = driver(plane)
        .deploy(&request(RollbackPolicy::Auto, ExecutionMode::Detached))
        .await
        .unwrap();

    assert_eq!(
        outcome,
        DeployOutcome::Detached {
            operation: handle()
        }
    );
}

// ── Failure handling ──

fn never_created(status: StackStatus) -> DeployedStack {
    DeployedStack {
        status,
        reason: Some("The following resource(s) failed to create: [Service]".to_owned()),
        template: None,
    }
}

#[tokio::test(start_paused = true)]
async fn rolled_back_first_create_is_replaced() {
    let mut plane = MockPlane::new();
    let mut seq = mockall::Sequence::new();
    plane
        .expect_describe_stack()
        .returning(|_| Ok(never_created(StackStatus::CreateRolledBack)));
    plane.expect_update_stack().never();
    plane
        .expect_delete_stack()
        .withf(|name| name == STACK)
        .times(1)
        .in_sequence(&mut seq)
        .returning(|_| Ok(()));
    plane
        .expect_create_stack()
        .times(1)
        .in_sequence(&mut seq)
        .returning(|_| Ok(handle()));
    plane.expect_poll_operation().returning(polls(vec![
        (StackStatus::CreateInProgress, None),
        (StackStatus::CreateComplete, None),
    ]));

    let driver = driver(plane);
    let mut session = driver.session(STACK).await;
    let diff = session.diff(&template()).await.unwrap();
    assert_eq!(diff.count(ChangeKind::Added), 1);

    let outcome = session
        .deploy(&request(RollbackPolicy::Auto, ExecutionMode::Attached))
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        DeployOutcome::Succeeded {
            status: StackStatus::CreateComplete,
            ..
        }
    ));
}

#[tokio::test(start_paused = true)]
async fn failed_first_create_is_replaced_after_recovery() {
    let mut plane = MockPlane::new();
    plane
        .expect_describe_stack()
        .returning(|_| Ok(never_created(StackStatus::CreateFailed)));
    plane.expect_update_stack().never();
    plane.expect_delete_stack().times(1).returning(|_| Ok(()));
    plane
        .expect_create_stack()
        .times(1)
        .returning(|_| Ok(handle()));

    let driver = driver(plane);
    let paused = request(RollbackPolicy::Auto, ExecutionMode::Detached);
    let refused = driver.deploy(&paused).await.unwrap_err();
    assert!(matches!(refused, ReleaseError::RecoveryRequired { .. }));

    driver.confirm_recovery(STACK).await;
    let outcome = driver.deploy(&paused).await.unwrap();
    assert!(matches!(outcome, DeployOutcome::Detached { .. }));
}

#[tokio::test(start_paused = true)]
async fn first_create_rolling_back_is_a_deployment_failure() {
    let mut plane = MockPlane::new();
    plane
        .expect_describe_stack()
        .returning(|_| Ok(DeployedStack::absent()));
    plane.expect_create_stack().returning(|_| Ok(handle()));
    plane.expect_poll_operation().returning(polls(vec![
        (StackStatus::CreateInProgress, None),
        (StackStatus::RollbackInProgress, Some("Service failed to stabilize")),
        (StackStatus::CreateRolledBack, None),
    ]));

    let driver = driver(plane);
    let err = driver
        .deploy(&request(RollbackPolicy::Auto, ExecutionMode::Attached))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ReleaseError::DeploymentFailed { ref reason, .. } if reason == "Service failed to stabilize"
    ));
    assert!(!driver.is_quarantined(STACK).await);
}

#[tokio::test(start_paused = true)]
async fn auto_rollback_reports_remote_reason_and_stays_deployable() {
    let mut plane = MockPlane::new();
    plane
        .expect_describe_stack()
        .returning(|_| Ok(deployed(StackStatus::UpdateComplete)));
    plane
        .expect_update_stack()
        .times(2)
        .returning(|_| Ok(Submission::Started(handle())));
    plane.expect_poll_operation().returning(polls(vec![
        (StackStatus::UpdateInProgress, Some("User Initiated")),
        (
            StackStatus::RollbackInProgress,
            Some("Resource Service failed to stabilize"),
        ),
        (StackStatus::RollbackComplete, None),
    ]));

    let driver = driver(plane);
    let err = driver
        .deploy(&request(RollbackPolicy::Auto, ExecutionMode::Attached))
        .await
        .unwrap_err();

    match err {
        ReleaseError::DeploymentFailed { stack, reason } => {
            assert_eq!(stack, STACK);
            assert_eq!(reason, "Resource Service failed to stabilize");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(!driver.is_quarantined(STACK).await);

    // The last poll response repeats, so the retry also rolls back.
    let retry = driver
        .deploy(&request(RollbackPolicy::Auto, ExecutionMode::Attached))
        .await;
    assert!(matches!(retry, Err(ReleaseError::DeploymentFailed { .. })));
}

#[tokio::test(start_paused = true)]
async fn disabled_rollback_requires_recovery_before_next_deploy() {
    let mut plane = MockPlane::new();
    let mut describes = 0;
    plane.expect_describe_stack().times(2).returning(move |_| {
        describes += 1;
        if describes == 1 {
            Ok(deployed(StackStatus::UpdateComplete))
        } else {
            Ok(deployed(StackStatus::UpdateFailed))
        }
    });
    plane
        .expect_update_stack()
        .withf(|s| s.disable_rollback)
        .times(2)
        .returning(|_| Ok(Submission::Started(handle())));
    plane.expect_poll_operation().returning(polls(vec![
        (StackStatus::UpdateInProgress, None),
        (StackStatus::UpdateFailed, Some("Container exited with code 1")),
    ]));

    let driver = driver(plane);
    let paused = request(RollbackPolicy::Disabled, ExecutionMode::Attached);

    let err = driver.deploy(&paused).await.unwrap_err();
    assert!(matches!(
        err,
        ReleaseError::RollbackFailed {
            status: StackStatus::UpdateFailed,
            ref reason,
            ..
        } if reason == "Container exited with code 1"
    ));
    assert!(driver.is_quarantined(STACK).await);

    // Refused without contacting the control plane.
    let refused = driver.deploy(&paused).await.unwrap_err();
    assert!(matches!(refused, ReleaseError::RecoveryRequired { .. }));

    driver.confirm_recovery(STACK).await;
    assert!(!driver.is_quarantined(STACK).await);
    let again = driver.deploy(&paused).await.unwrap_err();
    assert!(matches!(again, ReleaseError::RollbackFailed { .. }));
}

#[tokio::test]
async fn stack_paused_by_another_run_is_quarantined() {
    let mut plane = MockPlane::new();
    plane
        .expect_describe_stack()
        .returning(|_| Ok(deployed(StackStatus::UpdateFailed)));
    plane.expect_update_stack().never();
    plane.expect_create_stack().never();

    let driver = driver(plane);
    let mut session = driver.session(STACK).await;
    let err = session
        .deploy(&request(RollbackPolicy::Auto, ExecutionMode::Attached))
        .await
        .unwrap_err();

    assert!(matches!(err, ReleaseError::RecoveryRequired { .. }));
    assert_eq!(session.state(), ReleaseState::Failed);
    drop(session);
    assert!(driver.is_quarantined(STACK).await);
}

#[tokio::test(start_paused = true)]
async fn failed_rollback_is_reported() {
    let mut plane = MockPlane::new();
    plane
        .expect_describe_stack()
        .returning(|_| Ok(deployed(StackStatus::UpdateComplete)));
    plane
        .expect_update_stack()
        .returning(|_| Ok(Submission::Started(handle())));
    plane.expect_poll_operation().returning(polls(vec![
        (StackStatus::RollbackInProgress, Some("Service failed")),
        (StackStatus::RollbackFailed, Some("Role deleted")),
    ]));

    let driver = driver(plane);
    let mut session = driver.session(STACK).await;
    let err = session
        .deploy(&request(RollbackPolicy::Auto, ExecutionMode::Attached))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ReleaseError::RollbackFailed {
            status: StackStatus::RollbackFailed,
            ..
        }
    ));
    assert_eq!(session.state(), ReleaseState::RollbackFailed);
}

#[tokio::test]
async fn operation_in_progress_is_busy() {
    let mut plane = MockPlane::new();
    plane
        .expect_describe_stack()
        .returning(|_| Ok(deployed(StackStatus::UpdateInProgress)));
    plane.expect_update_stack().never();

    let err = driver(plane)
        .deploy(&request(RollbackPolicy::Auto, ExecutionMode::Attached))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ReleaseError::StackBusy {
            status: StackStatus::UpdateInProgress,
            ..
        }
    ));
}

#[tokio::test]
async fn diff_failure_is_a_diff_computation_error() {
    let mut plane = MockPlane::new();
    plane
        .expect_describe_stack()
        .returning(|_| Err(RemoteError::NoBucket));

    let err = driver(plane).diff(STACK, &template()).await.unwrap_err();

    assert!(matches!(err, ReleaseError::DiffComputation { .. }));
}

#[tokio::test]
async fn session_rejects_other_stacks() {
    let plane = MockPlane::new();
    let driver = driver(plane);
    let mut session = driver.session("shop-prod-worker").await;

    let err = session
        .deploy(&request(RollbackPolicy::Auto, ExecutionMode::Attached))
        .await
        .unwrap_err();

    assert!(matches!(err, ReleaseError::SessionMismatch { .. }));
}

// ── Cancellation ──

#[tokio::test(start_paused = true)]
async fn cancellation_stops_observation_only() {
    let mut plane = MockPlane::new();
    plane
        .expect_describe_stack()
        .returning(|_| Ok(DeployedStack::absent()));
    plane
        .expect_create_stack()
        .returning(|_| Ok(handle()));
    plane.expect_poll_operation().never();

    let (cancel, watcher) = tokio::sync::watch::channel(false);
    cancel.send(true).unwrap();
    let driver = driver(plane).with_cancellation(watcher);

    let outcome = driver
        .deploy(&request(RollbackPolicy::Auto, ExecutionMode::Attached))
        .await
        .unwrap();

    assert_eq!(
        outcome,
        DeployOutcome::Cancelled {
            operation: handle(),
            transitions: vec![],
        }
    );
}
