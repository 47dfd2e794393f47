//! Diff and deploy state machine for one stack identity.
//!
//! ```text
//! absent ──diff──▶ diff-computed ──deploy──▶ deploying ─┬─▶ succeeded
//!                                                       ├─▶ rolled-back
//!                                                       ├─▶ rollback-failed
//!                                                       └─▶ failed
//! ```
//!
//! A stack that ends in `rollback-failed` (or is found paused in a failed
//! state) is quarantined: deploys are refused until
//! [`ReleaseDriver::confirm_recovery`] is called for it.
//!
//! A stack whose first create never completed cannot be updated. The next
//! deploy deletes it and creates it again.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use hoist_core::{RollbackPolicy, StackTemplate};
use tokio::sync::{Mutex, OwnedMutexGuard, watch};

use crate::diff::{StructuredDiff, diff_templates};
use crate::lock::StackLocks;
use crate::remote::{
    ControlPlane, OperationHandle, RemoteError, StackStatus, StackSubmission, Submission,
};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseState {
    Absent,
    DiffComputed,
    Deploying,
    Succeeded,
    Failed,
    RolledBack,
    RollbackFailed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Poll until the operation reaches a terminal state.
    #[default]
    Attached,
    /// Return as soon as the control plane accepts the operation.
    Detached,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeploymentRequest {
    pub stack_name: String,
    pub template: StackTemplate,
    pub parameters: BTreeMap<String, String>,
    pub tags: BTreeMap<String, String>,
    pub rollback: RollbackPolicy,
    pub mode: ExecutionMode,
}

/// A status change observed while polling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub status: StackStatus,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeployOutcome {
    Succeeded {
        status: StackStatus,
        transitions: Vec<Transition>,
    },
    /// The control plane reported nothing to update.
    NoChanges,
    Detached {
        operation: OperationHandle,
    },
    /// Observation stopped; the remote operation keeps running.
    Cancelled {
        operation: OperationHandle,
        transitions: Vec<Transition>,
    },
}

/// Drives diff and deploy against a [`ControlPlane`].
pub struct ReleaseDriver<C: ControlPlane> {
    plane: C,
    locks: StackLocks,
    quarantined: Mutex<HashSet<String>>,
    confirmed: Mutex<HashSet<String>>,
    poll_interval: Duration,
    cancel: Option<watch::Receiver<bool>>,
}

impl<C: ControlPlane> ReleaseDriver<C> {
    pub fn new(plane: C) -> Self {
        Self {
            plane,
            locks: StackLocks::new(),
            quarantined: Mutex::new(HashSet::new()),
            confirmed: Mutex::new(HashSet::new()),
            poll_interval: DEFAULT_POLL_INTERVAL,
            cancel: None,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(Duration::from_secs(1));
        self
    }

    /// Stop observing an attached deploy once `cancel` turns true.
    pub fn with_cancellation(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn control_plane(&self) -> &C {
        &self.plane
    }

    /// Take the per-stack lock for one diff and deploy run.
    pub async fn session(&self, stack: &str) -> ReleaseSession<'_, C> {
        let guard = self.locks.acquire(stack).await;
        ReleaseSession {
            driver: self,
            stack: stack.to_owned(),
            state: ReleaseState::Absent,
            _guard: guard,
        }
    }

    pub async fn diff(
        &self,
        stack: &str,
        template: &StackTemplate,
    ) -> Result<StructuredDiff, ReleaseError> {
        self.session(stack).await.diff(template).await
    }

    pub async fn deploy(&self, request: &DeploymentRequest) -> Result<DeployOutcome, ReleaseError> {
        self.session(&request.stack_name).await.deploy(request).await
    }

    /// Record that a quarantined stack has been repaired by hand.
    pub async fn confirm_recovery(&self, stack: &str) {
        self.quarantined.lock().await.remove(stack);
        self.confirmed.lock().await.insert(stack.to_owned());
        tracing::info!(%stack, "recovery confirmed");
    }

    pub async fn is_quarantined(&self, stack: &str) -> bool {
        self.quarantined.lock().await.contains(stack)
    }

    async fn quarantine(&self, stack: &str) {
        self.confirmed.lock().await.remove(stack);
        self.quarantined.lock().await.insert(stack.to_owned());
        tracing::warn!(%stack, "stack needs manual recovery before the next deploy");
    }

    async fn observe(
        &self,
        handle: &OperationHandle,
        rollback: RollbackPolicy,
    ) -> Result<DeployOutcome, ReleaseError> {
        let stack = handle.stack_name.as_str();
        let mut cancel = self.cancel.clone();
        let mut transitions: Vec<Transition> = Vec::new();

        loop {
            tokio::select! {
                () = tokio::time::sleep(self.poll_interval) => {}
                () = cancelled(&mut cancel) => {
                    tracing::warn!(%stack, "stopped watching; the operation continues remotely");
                    return Ok(DeployOutcome::Cancelled {
                        operation: handle.clone(),
                        transitions,
                    });
                }
            }

            let snapshot = self
                .plane
                .poll_operation(handle)
                .await
                .map_err(|e| ReleaseError::Remote {
                    stack: stack.to_owned(),
                    source: e,
                })?;

            if transitions.last().map(|t| t.status) != Some(snapshot.status) {
                tracing::info!(
                    %stack,
                    status = %snapshot.status,
                    reason = snapshot.reason.as_deref().unwrap_or(""),
                    "stack status changed"
                );
                transitions.push(Transition {
                    status: snapshot.status,
                    reason: snapshot.reason.clone(),
                });
            }

            match snapshot.status {
                StackStatus::CreateComplete | StackStatus::UpdateComplete => {
                    return Ok(DeployOutcome::Succeeded {
                        status: snapshot.status,
                        transitions,
                    });
                }
                StackStatus::RollbackComplete
                | StackStatus::CreateRolledBack
                | StackStatus::NotCreated => {
                    return Err(ReleaseError::DeploymentFailed {
                        stack: stack.to_owned(),
                        reason: failure_reason(&transitions),
                    });
                }
                StackStatus::RollbackFailed | StackStatus::DeleteFailed => {
                    self.quarantine(stack).await;
                    return Err(ReleaseError::RollbackFailed {
                        stack: stack.to_owned(),
                        status: snapshot.status,
                        reason: failure_reason(&transitions),
                    });
                }
                StackStatus::CreateFailed | StackStatus::UpdateFailed
                    if rollback == RollbackPolicy::Disabled =>
                {
                    self.quarantine(stack).await;
                    return Err(ReleaseError::RollbackFailed {
                        stack: stack.to_owned(),
                        status: snapshot.status,
                        reason: failure_reason(&transitions),
                    });
                }
                _ => {}
            }
        }
    }
}

/// Holds the stack lock; created by [`ReleaseDriver::session`].
pub struct ReleaseSession<'d, C: ControlPlane> {
    driver: &'d ReleaseDriver<C>,
    stack: String,
    state: ReleaseState,
    _guard: OwnedMutexGuard<()>,
}

impl<C: ControlPlane> ReleaseSession<'_, C> {
    pub fn stack(&self) -> &str {
        &self.stack
    }

    pub fn state(&self) -> ReleaseState {
        self.state
    }

    /// Compare `template` with what is deployed. A stack that does not exist
    /// compares against an empty template.
    pub async fn diff(&mut self, template: &StackTemplate) -> Result<StructuredDiff, ReleaseError> {
        let deployed = self
            .driver
            .plane
            .describe_stack(&self.stack)
            .await
            .map_err(|e| ReleaseError::DiffComputation {
                stack: self.stack.clone(),
                source: e,
            })?;
        let current = deployed.template.unwrap_or_else(StackTemplate::new);
        let diff = diff_templates(&current, template);
        tracing::debug!(
            stack = %self.stack,
            changes = diff.changes().count(),
            "diff computed"
        );
        self.state = ReleaseState::DiffComputed;
        Ok(diff)
    }

    /// Create the stack when absent, update it otherwise.
    pub async fn deploy(
        &mut self,
        request: &DeploymentRequest,
    ) -> Result<DeployOutcome, ReleaseError> {
        if request.stack_name != self.stack {
            return Err(ReleaseError::SessionMismatch {
                session: self.stack.clone(),
                requested: request.stack_name.clone(),
            });
        }
        let result = self.run(request).await;
        self.state = match &result {
            Ok(DeployOutcome::Succeeded { .. } | DeployOutcome::NoChanges) => {
                ReleaseState::Succeeded
            }
            Ok(DeployOutcome::Detached { .. } | DeployOutcome::Cancelled { .. }) => {
                ReleaseState::Deploying
            }
            Err(e) => e.resulting_state(),
        };
        result
    }

    async fn run(&mut self, request: &DeploymentRequest) -> Result<DeployOutcome, ReleaseError> {
        let driver = self.driver;
        let stack = self.stack.as_str();

        if driver.is_quarantined(stack).await {
            return Err(ReleaseError::RecoveryRequired {
                stack: stack.to_owned(),
            });
        }

        let remote_error = |e| ReleaseError::Remote {
            stack: stack.to_owned(),
            source: e,
        };
        let deployed = driver
            .plane
            .describe_stack(stack)
            .await
            .map_err(remote_error)?;

        if deployed.status.is_failed() && !driver.confirmed.lock().await.contains(stack) {
            tracing::warn!(
                %stack,
                status = %deployed.status,
                "stack is paused in a failed state"
            );
            driver.quarantine(stack).await;
            return Err(ReleaseError::RecoveryRequired {
                stack: stack.to_owned(),
            });
        }
        if deployed.status.is_in_progress() {
            return Err(ReleaseError::StackBusy {
                stack: stack.to_owned(),
                status: deployed.status,
            });
        }

        let submission = StackSubmission {
            stack_name: stack.to_owned(),
            template: request.template.clone(),
            parameters: request.parameters.clone(),
            tags: request.tags.clone(),
            disable_rollback: request.rollback == RollbackPolicy::Disabled,
        };

        self.state = ReleaseState::Deploying;
        let handle = if deployed.status == StackStatus::NotCreated
            || deployed.status.never_deployed()
        {
            if deployed.status.never_deployed() {
                tracing::info!(
                    %stack,
                    status = %deployed.status,
                    "deleting stack that was never created"
                );
                driver
                    .plane
                    .delete_stack(stack)
                    .await
                    .map_err(remote_error)?;
            }
            tracing::info!(%stack, "creating stack");
            driver
                .plane
                .create_stack(&submission)
                .await
                .map_err(remote_error)?
        } else {
            tracing::info!(%stack, status = %deployed.status, "updating stack");
            match driver
                .plane
                .update_stack(&submission)
                .await
                .map_err(remote_error)?
            {
                Submission::Started(handle) => handle,
                Submission::NoChanges => return Ok(DeployOutcome::NoChanges),
            }
        };
        driver.confirmed.lock().await.remove(stack);

        match request.mode {
            ExecutionMode::Detached => {
                tracing::info!(%stack, id = %handle.stack_id, "detached after acceptance");
                Ok(DeployOutcome::Detached { operation: handle })
            }
            ExecutionMode::Attached => driver.observe(&handle, request.rollback).await,
        }
    }
}

/// Resolves once cancellation is requested; never resolves without a receiver.
async fn cancelled(cancel: &mut Option<watch::Receiver<bool>>) {
    let Some(rx) = cancel else {
        return std::future::pending().await;
    };
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if let Err(e) = rx.changed().await {
            tracing::debug!(error = %e, "cancellation sender dropped");
            return std::future::pending().await;
        }
    }
}

/// First reason reported by a failing status, or the latest reason seen.
fn failure_reason(transitions: &[Transition]) -> String {
    transitions
        .iter()
        .find(|t| {
            t.reason.is_some()
                && (t.status.is_failed() || t.status == StackStatus::RollbackInProgress)
        })
        .or_else(|| transitions.iter().rev().find(|t| t.reason.is_some()))
        .and_then(|t| t.reason.clone())
        .unwrap_or_else(|| "no reason reported".to_owned())
}

#[derive(Debug, thiserror::Error)]
pub enum ReleaseError {
    #[error("failed to compute diff for {stack}")]
    DiffComputation { stack: String, source: RemoteError },

    #[error("deployment of {stack} failed and was rolled back: {reason}")]
    DeploymentFailed { stack: String, reason: String },

    #[error("{stack} is {status} and needs manual intervention: {reason}")]
    RollbackFailed {
        stack: String,
        status: StackStatus,
        reason: String,
    },

    #[error("{stack} needs recovery; fix it by hand, then deploy with --recovered")]
    RecoveryRequired { stack: String },

    #[error("{stack} has an operation in progress ({status})")]
    StackBusy { stack: String, status: StackStatus },

    #[error("session for {session} cannot deploy {requested}")]
    SessionMismatch { session: String, requested: String },

    #[error("control plane request for {stack} failed")]
    Remote { stack: String, source: RemoteError },
}

impl ReleaseError {
    fn resulting_state(&self) -> ReleaseState {
        match self {
            ReleaseError::DeploymentFailed { .. } => ReleaseState::RolledBack,
            ReleaseError::RollbackFailed { .. } => ReleaseState::RollbackFailed,
            _ => ReleaseState::Failed,
        }
    }
}
