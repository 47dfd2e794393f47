use std::path::Path;

use hoist_build::package::write_artifacts;

use super::deploy_pipeline;

/// Write `<stack>.stack.yml` and `<stack>.params.json` instead of deploying.
pub async fn package(
    project_dir: &Path,
    output_dir: &Path,
    upload_assets: bool,
) -> anyhow::Result<()> {
    let pipeline = deploy_pipeline::prepare(project_dir)?;
    pipeline.write_addons()?;
    let template = if upload_assets {
        println!("Publishing assets...");
        pipeline.publish().await?
    } else {
        pipeline.synthesis.template.clone()
    };

    let output_dir = if output_dir.is_absolute() {
        output_dir.to_path_buf()
    } else {
        project_dir.join(output_dir)
    };
    let artifacts = write_artifacts(
        &output_dir,
        &pipeline.stack_name(),
        &template,
        &pipeline.synthesis.parameters,
        &pipeline.config.deploy.tags,
    )?;

    println!("Template:   {}", artifacts.template.display());
    println!("Parameters: {}", artifacts.parameters.display());
    Ok(())
}
