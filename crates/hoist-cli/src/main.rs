mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "hoist",
    about = "Deploy container workloads to ECS with CloudFormation"
)]
#[command(version)]
struct Cli {
    /// Project directory containing hoist.toml
    #[arg(long, short = 'C', global = true, default_value = ".")]
    project_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Synthesize, publish assets and deploy the workload stack
    Deploy {
        /// Leave a failed deployment paused instead of rolling back
        #[arg(long)]
        no_rollback: bool,
        /// Return once the deployment has been accepted
        #[arg(long)]
        detach: bool,
        /// Confirm that a paused stack was repaired by hand
        #[arg(long)]
        recovered: bool,
    },
    /// Compare the synthesized stack with the deployed one (exit 0: same, 1: different, 2: error)
    Diff,
    /// Write the stack template and parameters instead of deploying
    Package {
        /// Directory receiving <stack>.stack.yml and <stack>.params.json
        #[arg(long, default_value = ".hoist/build")]
        output_dir: PathBuf,
        /// Upload local assets and reference them in the template
        #[arg(long)]
        upload_assets: bool,
    },
    /// Show the remote stack status
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let project_dir = cli.project_dir;

    match cli.command {
        Commands::Deploy {
            no_rollback,
            detach,
            recovered,
        } => {
            let options = commands::DeployOptions {
                no_rollback,
                detach,
                recovered,
            };
            commands::deploy(&project_dir, options).await?
        }
        Commands::Diff => {
            let code = match commands::diff(&project_dir).await {
                Ok(code) => code,
                Err(e) => {
                    eprintln!("Error: {e:?}");
                    2
                }
            };
            std::process::exit(code);
        }
        Commands::Package {
            output_dir,
            upload_assets,
        } => commands::package(&project_dir, &output_dir, upload_assets).await?,
        Commands::Status => commands::status(&project_dir).await?,
    }

    Ok(())
}
