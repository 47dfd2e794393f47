use std::path::{Path, PathBuf};

use hoist_build::compose::ADDONS_TEMPLATE_PATH;
use hoist_build::package::write_addons_template;
use hoist_build::{Synthesis, synthesize};
use hoist_cloud::{AssetPublisher, AwsClient, DeploymentRequest, ExecutionMode};
use hoist_core::{HoistConfig, RollbackPolicy, StackTemplate};

/// A synthesized workload stack and the client that will publish it.
pub(crate) struct Pipeline {
    pub project_dir: PathBuf,
    pub config: HoistConfig,
    pub synthesis: Synthesis,
    pub client: AwsClient,
}

/// Load hoist.toml and run the local stages: addons → compose → patch rules.
pub(crate) fn prepare(project_dir: &Path) -> anyhow::Result<Pipeline> {
    let config = HoistConfig::load(project_dir)?;
    let synthesis = synthesize(project_dir, &config)?;
    tracing::debug!(
        stack = %synthesis.identity.stack_name(),
        addons = synthesis.bundle.sources.len(),
        "synthesized stack"
    );
    let client = AwsClient::new(&config.project.region).with_bucket(config.assets.bucket.clone());

    Ok(Pipeline {
        project_dir: project_dir.to_path_buf(),
        config,
        synthesis,
        client,
    })
}

impl Pipeline {
    pub fn stack_name(&self) -> String {
        self.synthesis.identity.stack_name()
    }

    /// Write the bundled addons template under `.hoist/build/`.
    pub fn write_addons(&self) -> anyhow::Result<Option<PathBuf>> {
        Ok(write_addons_template(&self.project_dir, &self.synthesis.bundle)?)
    }

    /// Publisher that reads the addons template from the synthesis rather
    /// than from disk.
    fn publisher(&self) -> AssetPublisher<'_, AwsClient> {
        let publisher = AssetPublisher::new(&self.client, &self.project_dir, &self.config.assets);
        if self.synthesis.bundle.is_empty() {
            publisher
        } else {
            publisher.with_nested_template(
                ADDONS_TEMPLATE_PATH,
                self.synthesis.bundle.template.clone(),
            )
        }
    }

    /// Upload assets and return the final template.
    pub async fn publish(&self) -> anyhow::Result<StackTemplate> {
        Ok(self.publisher().publish(&self.synthesis.template).await?)
    }

    /// The final template as it would look after publishing, without uploading.
    pub async fn plan(&self) -> anyhow::Result<StackTemplate> {
        Ok(self.publisher().plan(&self.synthesis.template).await?)
    }

    pub fn request(
        &self,
        template: StackTemplate,
        no_rollback: bool,
        detach: bool,
    ) -> DeploymentRequest {
        let rollback = if no_rollback {
            RollbackPolicy::Disabled
        } else {
            self.config.deploy.rollback
        };
        let mode = if detach || self.config.deploy.detach {
            ExecutionMode::Detached
        } else {
            ExecutionMode::Attached
        };
        DeploymentRequest {
            stack_name: self.stack_name(),
            template,
            parameters: self.synthesis.parameters.clone(),
            tags: self.config.deploy.tags.clone(),
            rollback,
            mode,
        }
    }
}
