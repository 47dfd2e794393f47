use hoist_core::StackTemplate;
use serde::Deserialize;

use crate::awscli::AwsCliError;
use crate::executor::{AwsExecutor, RealExecutor};
use crate::remote::{
    ControlPlane, DeployedStack, ObjectLocation, ObjectStore, OperationHandle, RemoteError,
    StackSnapshot, StackStatus, StackSubmission, Submission,
};

const CAPABILITIES: [&str; 3] = [
    "CAPABILITY_IAM",
    "CAPABILITY_NAMED_IAM",
    "CAPABILITY_AUTO_EXPAND",
];

/// AWS operations client, parameterized over the executor for testability.
pub struct AwsClient<E: AwsExecutor = RealExecutor> {
    executor: E,
    region: String,
    bucket: Option<String>,
}

impl AwsClient<RealExecutor> {
    pub fn new(region: &str) -> Self {
        Self::with_executor(RealExecutor, region)
    }
}

impl<E: AwsExecutor> AwsClient<E> {
    pub fn with_executor(executor: E, region: &str) -> Self {
        Self {
            executor,
            region: region.to_owned(),
            bucket: None,
        }
    }

    /// Bucket used by the [`ObjectStore`] implementation.
    pub fn with_bucket(mut self, bucket: Option<String>) -> Self {
        self.bucket = bucket;
        self
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    fn cloudformation<const N: usize>(&self, a: [&str; N]) -> Vec<String> {
        let mut cmd = args(["cloudformation"]);
        cmd.extend(a.iter().map(|s| (*s).to_owned()));
        cmd.extend(args(["--region", &self.region, "--output", "json"]));
        cmd
    }

    // ── Stacks ──

    async fn fetch_template(&self, stack_name: &str) -> Result<StackTemplate, RemoteError> {
        let output = self
            .executor
            .exec(&self.cloudformation([
                "get-template",
                "--stack-name",
                stack_name,
                "--template-stage",
                "Original",
            ]))
            .await?;

        let response: GetTemplateOutput =
            serde_json::from_str(&output).map_err(|e| RemoteError::Response {
                operation: "get-template",
                reason: e.to_string(),
            })?;

        // YAML bodies come back as a string, JSON bodies as a parsed object.
        let body = match response.template_body {
            serde_json::Value::String(body) => body,
            other => other.to_string(),
        };
        StackTemplate::parse(&body).map_err(|e| RemoteError::Template { source: e })
    }

    async fn submit(
        &self,
        verb: &str,
        submission: &StackSubmission,
    ) -> Result<OperationHandle, RemoteError> {
        let body = submission
            .template
            .to_json()
            .map_err(|e| RemoteError::Template { source: e })?;
        let parameters = serde_json::to_string(
            &submission
                .parameters
                .iter()
                .map(|(k, v)| ParameterArg {
                    parameter_key: k,
                    parameter_value: v,
                })
                .collect::<Vec<_>>(),
        )
        .map_err(|e| RemoteError::Response {
            operation: "encode parameters",
            reason: e.to_string(),
        })?;

        let mut cmd = vec![
            verb,
            "--stack-name",
            &submission.stack_name,
            "--template-body",
            &body,
            "--parameters",
            &parameters,
            "--capabilities",
        ];
        cmd.extend(CAPABILITIES);

        let tags;
        if !submission.tags.is_empty() {
            tags = serde_json::to_string(
                &submission
                    .tags
                    .iter()
                    .map(|(k, v)| TagArg { key: k, value: v })
                    .collect::<Vec<_>>(),
            )
            .map_err(|e| RemoteError::Response {
                operation: "encode tags",
                reason: e.to_string(),
            })?;
            cmd.push("--tags");
            cmd.push(&tags);
        }
        if submission.disable_rollback {
            cmd.push("--disable-rollback");
        }

        let mut full = args(["cloudformation"]);
        full.extend(cmd.iter().map(|s| (*s).to_owned()));
        full.extend(args(["--region", &self.region, "--output", "json"]));

        let output = self.executor.exec(&full).await?;
        let response: StackIdOutput =
            serde_json::from_str(&output).map_err(|e| RemoteError::Response {
                operation: "submit stack",
                reason: e.to_string(),
            })?;

        tracing::info!(stack = %submission.stack_name, %verb, "stack operation accepted");
        Ok(OperationHandle {
            stack_name: submission.stack_name.clone(),
            stack_id: response.stack_id,
        })
    }

    async fn snapshot(&self, stack: &str) -> Result<Option<StackSnapshot>, RemoteError> {
        let output = match self
            .executor
            .exec(&self.cloudformation(["describe-stacks", "--stack-name", stack]))
            .await
        {
            Ok(output) => output,
            Err(e) if is_missing_stack(&e) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let response: DescribeStacksOutput =
            serde_json::from_str(&output).map_err(|e| RemoteError::Response {
                operation: "describe-stacks",
                reason: e.to_string(),
            })?;
        let Some(description) = response.stacks.into_iter().next() else {
            return Ok(None);
        };
        let status =
            StackStatus::from_remote(&description.stack_status).ok_or_else(|| {
                RemoteError::Response {
                    operation: "describe-stacks",
                    reason: format!("unknown stack status {}", description.stack_status),
                }
            })?;

        Ok(Some(StackSnapshot {
            status,
            reason: description.stack_status_reason,
        }))
    }

    // ── Objects ──

    async fn object_exists(&self, location: &ObjectLocation) -> Result<bool, RemoteError> {
        let result = self
            .executor
            .exec(&args([
                "s3api",
                "head-object",
                "--bucket",
                &location.bucket,
                "--key",
                &location.key,
                "--region",
                &self.region,
            ]))
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(e) if e.stderr().is_some_and(|s| s.contains("404") || s.contains("Not Found")) => {
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl<E: AwsExecutor> ControlPlane for AwsClient<E> {
    async fn describe_stack(&self, stack_name: &str) -> Result<DeployedStack, RemoteError> {
        let Some(snapshot) = self.snapshot(stack_name).await? else {
            return Ok(DeployedStack::absent());
        };
        if snapshot.status == StackStatus::NotCreated {
            return Ok(DeployedStack::absent());
        }
        if snapshot.status.never_deployed() {
            return Ok(DeployedStack {
                status: snapshot.status,
                reason: snapshot.reason,
                template: None,
            });
        }

        let template = self.fetch_template(stack_name).await?;
        Ok(DeployedStack {
            status: snapshot.status,
            reason: snapshot.reason,
            template: Some(template),
        })
    }

    async fn create_stack(
        &self,
        submission: &StackSubmission,
    ) -> Result<OperationHandle, RemoteError> {
        self.submit("create-stack", submission).await
    }

    async fn update_stack(&self, submission: &StackSubmission) -> Result<Submission, RemoteError> {
        match self.submit("update-stack", submission).await {
            Ok(handle) => Ok(Submission::Started(handle)),
            Err(RemoteError::Cli(e))
                if e
                    .stderr()
                    .is_some_and(|s| s.contains("No updates are to be performed")) =>
            {
                tracing::info!(stack = %submission.stack_name, "no updates to perform");
                Ok(Submission::NoChanges)
            }
            Err(e) => Err(e),
        }
    }

    async fn poll_operation(&self, handle: &OperationHandle) -> Result<StackSnapshot, RemoteError> {
        Ok(self
            .snapshot(&handle.stack_id)
            .await?
            .unwrap_or(StackSnapshot {
                status: StackStatus::NotCreated,
                reason: None,
            }))
    }

    async fn delete_stack(&self, stack_name: &str) -> Result<(), RemoteError> {
        self.executor
            .exec(&self.cloudformation(["delete-stack", "--stack-name", stack_name]))
            .await?;
        tracing::info!(stack = %stack_name, "waiting for stack deletion");
        self.executor
            .exec(&self.cloudformation([
                "wait",
                "stack-delete-complete",
                "--stack-name",
                stack_name,
            ]))
            .await?;
        Ok(())
    }
}

impl<E: AwsExecutor> ObjectStore for AwsClient<E> {
    fn location(&self, key: &str) -> Result<ObjectLocation, RemoteError> {
        let bucket = self.bucket.as_deref().ok_or(RemoteError::NoBucket)?;
        Ok(ObjectLocation {
            bucket: bucket.to_owned(),
            key: key.to_owned(),
            region: self.region.clone(),
        })
    }

    async fn put_object_if_absent(
        &self,
        key: &str,
        body: &[u8],
    ) -> Result<ObjectLocation, RemoteError> {
        let location = self.location(key)?;
        if self.object_exists(&location).await? {
            tracing::debug!(%key, "asset already uploaded");
            return Ok(location);
        }

        self.executor
            .exec_with_stdin(
                &args([
                    "s3",
                    "cp",
                    "-",
                    &location.s3_uri(),
                    "--region",
                    &self.region,
                    "--only-show-errors",
                ]),
                body,
            )
            .await?;
        tracing::info!(%key, bytes = body.len(), "uploaded asset");
        Ok(location)
    }
}

fn is_missing_stack(error: &AwsCliError) -> bool {
    error
        .stderr()
        .is_some_and(|s| s.contains("does not exist"))
}

fn args<const N: usize>(a: [&str; N]) -> Vec<String> {
    a.iter().map(|s| (*s).to_owned()).collect()
}

// ── Wire types ──

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeStacksOutput {
    #[serde(default)]
    stacks: Vec<StackDescription>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StackDescription {
    stack_status: String,
    #[serde(default)]
    stack_status_reason: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct GetTemplateOutput {
    template_body: serde_json::Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StackIdOutput {
    stack_id: String,
}

#[derive(serde::Serialize)]
#[serde(rename_all = "PascalCase")]
struct ParameterArg<'a> {
    parameter_key: &'a str,
    parameter_value: &'a str,
}

#[derive(serde::Serialize)]
#[serde(rename_all = "PascalCase")]
struct TagArg<'a> {
    key: &'a str,
    value: &'a str,
}
