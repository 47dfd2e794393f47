//! Remote side of hoist: the `aws` CLI executor, the [`ControlPlane`] and
//! [`ObjectStore`] seams, asset publishing and the release state machine.

pub mod awscli;
pub mod client;
pub mod diff;
pub mod executor;
pub mod lock;
pub mod publish;
pub mod release;
pub mod remote;

pub use awscli::AwsCliError;
pub use client::AwsClient;
pub use diff::{ChangeKind, DiffEntry, StructuredDiff, diff_templates};
pub use executor::{AwsExecutor, RealExecutor};
pub use lock::StackLocks;
pub use publish::{AssetPublisher, AssetReference, PublishError};
pub use release::{
    DeployOutcome, DeploymentRequest, ExecutionMode, ReleaseDriver, ReleaseError, ReleaseSession,
    ReleaseState, Transition,
};
pub use remote::{
    ControlPlane, DeployedStack, ObjectLocation, ObjectStore, OperationHandle, RemoteError,
    StackSnapshot, StackStatus, StackSubmission, Submission,
};
