use std::path::Path;

use hoist_cloud::{AwsClient, ControlPlane};
use hoist_core::HoistConfig;

pub async fn status(project_dir: &Path) -> anyhow::Result<()> {
    let config = HoistConfig::load(project_dir)?;
    let stack = config.identity()?.stack_name();

    let client = AwsClient::new(&config.project.region);
    let deployed = client.describe_stack(&stack).await?;

    println!("{stack}: {}", deployed.status);
    if let Some(reason) = deployed.reason {
        println!("  {reason}");
    }
    Ok(())
}
