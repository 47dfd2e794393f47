use std::path::Path;

use hoist_cloud::{DeployOutcome, ReleaseDriver, ReleaseError};
use tokio::sync::watch;

use super::deploy_pipeline;

/// Flags of `hoist deploy`.
pub struct DeployOptions {
    pub no_rollback: bool,
    pub detach: bool,
    pub recovered: bool,
}

/// Execute the full deploy pipeline.
pub async fn deploy(project_dir: &Path, options: DeployOptions) -> anyhow::Result<()> {
    println!("Synthesizing stack...");
    let pipeline = deploy_pipeline::prepare(project_dir)?;
    let stack = pipeline.stack_name();
    pipeline.write_addons()?;

    println!("Publishing assets...");
    let template = pipeline.publish().await?;
    let request = pipeline.request(template, options.no_rollback, options.detach);

    // Ctrl-C stops watching; the stack operation keeps running remotely.
    let (cancel, cancelled) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "could not listen for ctrl-c");
            return;
        }
        if cancel.send(true).is_err() {
            tracing::debug!("deploy finished before ctrl-c");
        }
    });

    let driver = ReleaseDriver::new(pipeline.client)
        .with_poll_interval(pipeline.config.deploy.poll_interval())
        .with_cancellation(cancelled);
    if options.recovered {
        driver.confirm_recovery(&stack).await;
    }

    let mut session = driver.session(&stack).await;
    let diff = session.diff(&request.template).await?;
    println!("{diff}");

    println!("Deploying {stack}...");
    let outcome = match session.deploy(&request).await {
        Ok(outcome) => outcome,
        Err(e @ ReleaseError::RollbackFailed { .. }) => {
            anyhow::bail!(
                "{e}\nRepair the stack, then run `hoist deploy --recovered` to deploy again."
            )
        }
        Err(e) => return Err(e.into()),
    };

    println!();
    match outcome {
        DeployOutcome::Succeeded {
            status,
            transitions,
        } => {
            for transition in &transitions {
                println!("  {}", transition.status);
            }
            println!("Deployed: {stack} ({status})");
        }
        DeployOutcome::NoChanges => println!("No changes: {stack} is up to date"),
        DeployOutcome::Detached { operation } => {
            println!("Deployment accepted: {}", operation.stack_id);
            println!("Check progress with `hoist status`.");
        }
        DeployOutcome::Cancelled { operation, .. } => {
            println!(
                "Stopped watching {}; the deployment continues remotely.",
                operation.stack_name
            );
        }
    }

    Ok(())
}
