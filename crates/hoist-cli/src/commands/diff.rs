use std::path::Path;

use hoist_cloud::ReleaseDriver;

use super::deploy_pipeline;

/// Print the diff against the deployed stack and return the process exit code.
pub async fn diff(project_dir: &Path) -> anyhow::Result<i32> {
    let pipeline = deploy_pipeline::prepare(project_dir)?;
    let stack = pipeline.stack_name();
    let template = pipeline.plan().await?;

    let driver = ReleaseDriver::new(pipeline.client);
    let diff = driver.diff(&stack, &template).await?;

    println!("{diff}");
    Ok(diff.exit_code())
}
