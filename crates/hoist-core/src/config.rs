use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// hoist.toml configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HoistConfig {
    #[serde(default)]
    pub project: ProjectConfig,
    #[serde(default)]
    pub workload: WorkloadConfig,
    #[serde(default)]
    pub deploy: DeployConfig,
    #[serde(default)]
    pub assets: AssetsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    /// Application name
    pub app: Option<String>,
    /// Environment name (e.g. "test", "prod")
    pub env: Option<String>,
    /// AWS region (defaults to us-east-1)
    #[serde(default = "default_region")]
    pub region: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadConfig {
    /// Workload name, unique within the application
    pub name: Option<String>,
    /// Container image URI, already built and pushed
    pub image: Option<String>,
    /// Port the container listens on
    #[serde(default = "default_port")]
    pub port: u16,
    /// Task CPU units
    #[serde(default = "default_cpu")]
    pub cpu: u32,
    /// Task memory in MiB
    #[serde(default = "default_memory")]
    pub memory: u32,
    /// Desired task count when `scaling` is not set
    #[serde(default = "default_count")]
    pub count: u32,
    /// Target-tracking autoscaling range
    #[serde(default)]
    pub scaling: Option<ScalingConfig>,
    /// Plain environment variables for the container
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    /// Environment variables sourced from SSM parameters or secrets (name → ARN)
    #[serde(default)]
    pub secrets: BTreeMap<String, String>,
    #[serde(default)]
    pub health_check: Option<HealthCheckConfig>,
    /// Subnet placement of the tasks
    #[serde(default)]
    pub placement: Placement,
    #[serde(default = "default_log_retention")]
    pub log_retention_days: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalingConfig {
    pub min: u32,
    pub max: u32,
    /// Average CPU utilization to track
    #[serde(default = "default_cpu_target")]
    pub cpu_percentage: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    /// Container health check command, e.g. `["CMD-SHELL", "curl -f http://localhost/ || exit 1"]`
    pub command: Vec<String>,
    #[serde(default = "default_hc_interval")]
    pub interval_secs: u32,
    #[serde(default = "default_hc_retries")]
    pub retries: u32,
    #[serde(default = "default_hc_timeout")]
    pub timeout_secs: u32,
    #[serde(default)]
    pub start_period_secs: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Placement {
    #[default]
    Public,
    Private,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployConfig {
    /// What the control plane does when a deployment fails partway
    #[serde(default)]
    pub rollback: RollbackPolicy,
    /// Return as soon as the operation is accepted
    #[serde(default)]
    pub detach: bool,
    /// Seconds between status polls in attached mode
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Stack-level tags
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

/// Behavior when a deployment fails partway through.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RollbackPolicy {
    /// The control plane reverts to the last good state.
    #[default]
    Auto,
    /// The stack is left in its failed state for manual recovery.
    Disabled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetsConfig {
    /// Bucket receiving uploaded assets
    pub bucket: Option<String>,
    /// Key prefix for uploaded objects
    #[serde(default = "default_asset_prefix")]
    pub prefix: String,
    /// Maximum number of concurrent uploads
    #[serde(default = "default_upload_concurrency")]
    pub concurrency: usize,
    /// Replaces the built-in table of uploadable properties when set
    #[serde(default)]
    pub allow: Option<Vec<AssetRule>>,
}

/// One resource property that may hold a local file reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetRule {
    pub resource_type: String,
    /// `/`-delimited path below the resource's `Properties`
    pub property: String,
    pub rewrite: RewriteStyle,
}

/// How an uploaded object is written back into the template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "style", rename_all = "snake_case")]
pub enum RewriteStyle {
    /// `{<bucket_field>: bucket, <key_field>: key}`
    Object {
        bucket_field: String,
        key_field: String,
    },
    /// `s3://bucket/key`
    S3Uri,
    /// `https://bucket.s3.region.amazonaws.com/key`
    HttpsUrl,
}

/// Names identifying one deployed workload stack.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StackIdentity {
    pub app: String,
    pub env: String,
    pub workload: String,
}

impl StackIdentity {
    /// Stack name on the control plane, `<app>-<env>-<workload>`.
    pub fn stack_name(&self) -> String {
        format!("{}-{}-{}", self.app, self.env, self.workload)
    }
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            app: None,
            env: None,
            region: default_region(),
        }
    }
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            name: None,
            image: None,
            port: default_port(),
            cpu: default_cpu(),
            memory: default_memory(),
            count: default_count(),
            scaling: None,
            variables: BTreeMap::new(),
            secrets: BTreeMap::new(),
            health_check: None,
            placement: Placement::default(),
            log_retention_days: default_log_retention(),
        }
    }
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            rollback: RollbackPolicy::default(),
            detach: false,
            poll_interval_secs: default_poll_interval(),
            tags: BTreeMap::new(),
        }
    }
}

impl Default for AssetsConfig {
    fn default() -> Self {
        Self {
            bucket: None,
            prefix: default_asset_prefix(),
            concurrency: default_upload_concurrency(),
            allow: None,
        }
    }
}

impl HoistConfig {
    /// Load from hoist.toml at the given path, or return defaults if not found.
    pub fn load(project_dir: &std::path::Path) -> crate::Result<Self> {
        let config_path = project_dir.join("hoist.toml");
        if config_path.exists() {
            let content =
                std::fs::read_to_string(&config_path).map_err(|e| crate::Error::ConfigLoad {
                    path: config_path.clone(),
                    source: e,
                })?;
            toml::from_str(&content).map_err(|e| crate::Error::ConfigParse {
                path: config_path,
                source: e,
            })
        } else {
            tracing::debug!(path = %config_path.display(), "no hoist.toml, using defaults");
            Ok(Self::default())
        }
    }

    /// Resolve the stack identity, validating each name.
    pub fn identity(&self) -> crate::Result<StackIdentity> {
        let app = require(self.project.app.as_deref(), "[project].app")?;
        let env = require(self.project.env.as_deref(), "[project].env")?;
        let workload = require(self.workload.name.as_deref(), "[workload].name")?;
        Ok(StackIdentity {
            app: app.to_owned(),
            env: env.to_owned(),
            workload: workload.to_owned(),
        })
    }

    /// The container image, which must be set before composing parameters.
    pub fn image(&self) -> crate::Result<&str> {
        self.workload
            .image
            .as_deref()
            .ok_or(crate::Error::MissingField {
                field: "[workload].image",
            })
    }
}

impl DeployConfig {
    /// Poll interval, never shorter than one second.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }
}

impl AssetsConfig {
    /// The configured allow-list, or the built-in table.
    pub fn allow_list(&self) -> Vec<AssetRule> {
        self.allow.clone().unwrap_or_else(default_asset_rules)
    }

    pub fn upload_concurrency(&self) -> usize {
        self.concurrency.max(1)
    }
}

/// Resource properties known to accept local file references.
pub fn default_asset_rules() -> Vec<AssetRule> {
    let object = |bucket: &str, key: &str| RewriteStyle::Object {
        bucket_field: bucket.to_owned(),
        key_field: key.to_owned(),
    };
    let rule = |resource_type: &str, property: &str, rewrite: RewriteStyle| AssetRule {
        resource_type: resource_type.to_owned(),
        property: property.to_owned(),
        rewrite,
    };

    vec![
        rule("AWS::Lambda::Function", "Code", object("S3Bucket", "S3Key")),
        rule("AWS::Lambda::LayerVersion", "Content", object("S3Bucket", "S3Key")),
        rule("AWS::Serverless::Function", "CodeUri", object("Bucket", "Key")),
        rule("AWS::Serverless::LayerVersion", "ContentUri", object("Bucket", "Key")),
        rule(
            "AWS::StepFunctions::StateMachine",
            "DefinitionS3Location",
            object("Bucket", "Key"),
        ),
        rule(
            "AWS::ApiGateway::RestApi",
            "BodyS3Location",
            object("Bucket", "Key"),
        ),
        rule("AWS::Glue::Job", "Command/ScriptLocation", RewriteStyle::S3Uri),
        rule(
            "AWS::AppSync::GraphQLSchema",
            "DefinitionS3Location",
            RewriteStyle::S3Uri,
        ),
        rule(
            "AWS::CloudFormation::Stack",
            "TemplateURL",
            RewriteStyle::HttpsUrl,
        ),
    ]
}

fn require<'a>(value: Option<&'a str>, field: &'static str) -> crate::Result<&'a str> {
    let value = value.ok_or(crate::Error::MissingField { field })?;
    validate_name(value, field)?;
    Ok(value)
}

/// Names become part of stack names: ASCII letters, digits and hyphens,
/// starting with a letter.
fn validate_name(value: &str, field: &'static str) -> crate::Result<()> {
    let starts_with_letter = value.chars().next().is_some_and(|c| c.is_ascii_alphabetic());
    let allowed = value.chars().all(|c| c.is_ascii_alphanumeric() || c == '-');
    if !starts_with_letter || !allowed {
        return Err(crate::Error::InvalidField {
            field,
            reason: format!(
                "{value:?} must start with a letter and contain only letters, digits and '-'"
            ),
        });
    }
    Ok(())
}

fn default_region() -> String {
    "us-east-1".to_owned()
}

fn default_port() -> u16 {
    8080
}

fn default_cpu() -> u32 {
    256
}

fn default_memory() -> u32 {
    512
}

fn default_count() -> u32 {
    1
}

fn default_cpu_target() -> u32 {
    70
}

fn default_hc_interval() -> u32 {
    10
}

fn default_hc_retries() -> u32 {
    2
}

fn default_hc_timeout() -> u32 {
    5
}

fn default_log_retention() -> u32 {
    30
}

fn default_poll_interval() -> u64 {
    5
}

fn default_asset_prefix() -> String {
    "assets".to_owned()
}

fn default_upload_concurrency() -> usize {
    4
}
