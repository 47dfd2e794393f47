//! Seams to the remote control plane and object store.

use std::collections::BTreeMap;
use std::fmt;

use hoist_core::StackTemplate;

use crate::awscli::AwsCliError;

/// Lifecycle status of a remote stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StackStatus {
    NotCreated,
    CreateInProgress,
    CreateComplete,
    CreateFailed,
    /// The first create failed and was rolled back. The stack exists but has
    /// never been deployed; it can only be deleted.
    CreateRolledBack,
    UpdateInProgress,
    UpdateComplete,
    UpdateFailed,
    RollbackInProgress,
    RollbackComplete,
    RollbackFailed,
    DeleteInProgress,
    DeleteFailed,
}

impl StackStatus {
    /// Map a CloudFormation status string.
    pub fn from_remote(status: &str) -> Option<Self> {
        let status = match status {
            "REVIEW_IN_PROGRESS" | "DELETE_COMPLETE" => StackStatus::NotCreated,
            "CREATE_IN_PROGRESS" => StackStatus::CreateInProgress,
            "CREATE_COMPLETE" => StackStatus::CreateComplete,
            "CREATE_FAILED" => StackStatus::CreateFailed,
            "UPDATE_IN_PROGRESS"
            | "UPDATE_COMPLETE_CLEANUP_IN_PROGRESS"
            | "IMPORT_IN_PROGRESS" => StackStatus::UpdateInProgress,
            "UPDATE_COMPLETE" | "IMPORT_COMPLETE" => StackStatus::UpdateComplete,
            "UPDATE_FAILED" => StackStatus::UpdateFailed,
            "ROLLBACK_IN_PROGRESS"
            | "UPDATE_ROLLBACK_IN_PROGRESS"
            | "UPDATE_ROLLBACK_COMPLETE_CLEANUP_IN_PROGRESS"
            | "IMPORT_ROLLBACK_IN_PROGRESS" => StackStatus::RollbackInProgress,
            "ROLLBACK_COMPLETE" => StackStatus::CreateRolledBack,
            "UPDATE_ROLLBACK_COMPLETE" | "IMPORT_ROLLBACK_COMPLETE" => StackStatus::RollbackComplete,
            "ROLLBACK_FAILED" | "UPDATE_ROLLBACK_FAILED" | "IMPORT_ROLLBACK_FAILED" => {
                StackStatus::RollbackFailed
            }
            "DELETE_IN_PROGRESS" => StackStatus::DeleteInProgress,
            "DELETE_FAILED" => StackStatus::DeleteFailed,
            _ => return None,
        };
        Some(status)
    }

    pub fn is_in_progress(self) -> bool {
        matches!(
            self,
            StackStatus::CreateInProgress
                | StackStatus::UpdateInProgress
                | StackStatus::RollbackInProgress
                | StackStatus::DeleteInProgress
        )
    }

    /// Failed states that leave the stack paused for manual intervention.
    pub fn is_failed(self) -> bool {
        matches!(
            self,
            StackStatus::CreateFailed
                | StackStatus::UpdateFailed
                | StackStatus::RollbackFailed
                | StackStatus::DeleteFailed
        )
    }

    /// The stack record exists but no create ever completed, so it cannot be
    /// updated and has no deployed template.
    pub fn never_deployed(self) -> bool {
        matches!(
            self,
            StackStatus::CreateFailed | StackStatus::CreateRolledBack
        )
    }
}

impl fmt::Display for StackStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StackStatus::NotCreated => "not created",
            StackStatus::CreateInProgress => "create in progress",
            StackStatus::CreateComplete => "create complete",
            StackStatus::CreateFailed => "create failed",
            StackStatus::CreateRolledBack => "create rolled back",
            StackStatus::UpdateInProgress => "update in progress",
            StackStatus::UpdateComplete => "update complete",
            StackStatus::UpdateFailed => "update failed",
            StackStatus::RollbackInProgress => "rollback in progress",
            StackStatus::RollbackComplete => "rollback complete",
            StackStatus::RollbackFailed => "rollback failed",
            StackStatus::DeleteInProgress => "delete in progress",
            StackStatus::DeleteFailed => "delete failed",
        };
        f.write_str(s)
    }
}

/// Remote record of a stack.
#[derive(Debug, Clone, PartialEq)]
pub struct DeployedStack {
    pub status: StackStatus,
    pub reason: Option<String>,
    /// Last deployed template; `None` when the stack does not exist or was
    /// never successfully created.
    pub template: Option<StackTemplate>,
}

impl DeployedStack {
    pub fn absent() -> Self {
        Self {
            status: StackStatus::NotCreated,
            reason: None,
            template: None,
        }
    }
}

/// Point-in-time status of a stack operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackSnapshot {
    pub status: StackStatus,
    pub reason: Option<String>,
}

/// A create or update sent to the control plane.
#[derive(Debug, Clone, PartialEq)]
pub struct StackSubmission {
    pub stack_name: String,
    pub template: StackTemplate,
    pub parameters: BTreeMap<String, String>,
    pub tags: BTreeMap<String, String>,
    /// Leave the stack in its failed state instead of rolling back.
    pub disable_rollback: bool,
}

/// Identifies an accepted operation for polling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationHandle {
    pub stack_name: String,
    pub stack_id: String,
}

/// Result of submitting an update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submission {
    Started(OperationHandle),
    /// The control plane found nothing to change.
    NoChanges,
}

/// Where an uploaded object lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectLocation {
    pub bucket: String,
    pub key: String,
    pub region: String,
}

impl ObjectLocation {
    pub fn s3_uri(&self) -> String {
        format!("s3://{}/{}", self.bucket, self.key)
    }

    pub fn https_url(&self) -> String {
        format!(
            "https://{}.s3.{}.amazonaws.com/{}",
            self.bucket, self.region, self.key
        )
    }
}

/// Stack operations against the deployment control plane.
#[allow(async_fn_in_trait)]
pub trait ControlPlane: Send + Sync {
    async fn describe_stack(&self, stack_name: &str) -> Result<DeployedStack, RemoteError>;

    async fn create_stack(
        &self,
        submission: &StackSubmission,
    ) -> Result<OperationHandle, RemoteError>;

    async fn update_stack(&self, submission: &StackSubmission) -> Result<Submission, RemoteError>;

    async fn poll_operation(&self, handle: &OperationHandle) -> Result<StackSnapshot, RemoteError>;

    /// Delete the stack and wait until it is gone.
    async fn delete_stack(&self, stack_name: &str) -> Result<(), RemoteError>;
}

/// Content-addressed object storage for assets.
#[allow(async_fn_in_trait)]
pub trait ObjectStore: Send + Sync {
    /// Where `key` is or would be stored, without contacting the store.
    fn location(&self, key: &str) -> Result<ObjectLocation, RemoteError>;

    /// Upload `body` under `key` unless an object already exists there.
    async fn put_object_if_absent(
        &self,
        key: &str,
        body: &[u8],
    ) -> Result<ObjectLocation, RemoteError>;
}

#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error(transparent)]
    Cli(#[from] AwsCliError),

    #[error("unexpected response from {operation}: {reason}")]
    Response {
        operation: &'static str,
        reason: String,
    },

    #[error("deployed template could not be parsed")]
    Template { source: hoist_core::Error },

    #[error("no asset bucket configured; set [assets].bucket in hoist.toml")]
    NoBucket,
}
