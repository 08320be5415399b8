//! Trade-store delivery pipeline CLI.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

use commands::run::{ApprovalMode, ExecutorKind, PipelineKind};

#[derive(Parser)]
#[command(name = "tradestore")]
#[command(about = "Trade-store delivery pipeline CLI", long_about = None)]
struct Cli {
    /// Environment configuration; the built-in environments are used when omitted
    #[arg(long, global = true, env = "TRADESTORE_ENVIRONMENTS")]
    environments: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a pipeline configuration
    Validate {
        /// Path to the configuration file
        #[arg(default_value = "pipeline.kdl")]
        path: PathBuf,
    },
    /// Print the pipeline environment and the deployment targets
    Environments,
    /// Write every stack template to a directory
    Synth {
        /// Output directory
        #[arg(long, default_value = "cdk.out")]
        out: PathBuf,
    },
    /// Print a pipeline definition as JSON
    Show {
        #[arg(long, value_enum, default_value = "delivery")]
        pipeline: PipelineKind,
        /// Pipeline parameters as a JSON file
        #[arg(long)]
        parameters: Option<PathBuf>,
    },
    /// Run a pipeline locally
    Run {
        #[arg(long, value_enum, default_value = "delivery")]
        pipeline: PipelineKind,
        /// Pipeline parameters as a JSON file
        #[arg(long)]
        parameters: Option<PathBuf>,
        /// Backend build actions run on
        #[arg(long, value_enum, default_value = "docker")]
        executor: ExecutorKind,
        /// How approval actions are decided
        #[arg(long, value_enum, default_value = "prompt")]
        approvals: ApprovalMode,
        /// Serve a repository from a local checkout instead of cloning it (`owner/repo=path`)
        #[arg(long = "source", value_name = "REPO=PATH")]
        sources: Vec<String>,
        /// Directory build workspaces are created in
        #[arg(long)]
        workspace_root: Option<PathBuf>,
        /// Timeout of validation requests in seconds
        #[arg(long, default_value = "10")]
        probe_timeout: u64,
    },
    /// Check which pipelines a GitHub push webhook starts
    Webhook {
        /// File holding the webhook request body
        payload: PathBuf,
        /// Value of the X-Hub-Signature-256 header
        #[arg(long)]
        signature: Option<String>,
        /// Webhook secret
        #[arg(long, env = "TRADESTORE_WEBHOOK_SECRET", hide_env_values = true)]
        secret: String,
        /// Pipeline parameters as a JSON file
        #[arg(long)]
        parameters: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let environments = commands::load_environment_config(cli.environments.as_deref())?;

    match cli.command {
        Commands::Validate { path } => {
            commands::validate(&path)?;
        }
        Commands::Environments => {
            commands::environments(&environments);
        }
        Commands::Synth { out } => {
            commands::synth(&environments, &out)?;
        }
        Commands::Show {
            pipeline,
            parameters,
        } => {
            let parameters = commands::load_parameters(parameters.as_deref())?;
            commands::show(pipeline, &parameters, &environments)?;
        }
        Commands::Run {
            pipeline,
            parameters,
            executor,
            approvals,
            sources,
            workspace_root,
            probe_timeout,
        } => {
            let parameters = commands::load_parameters(parameters.as_deref())?;
            commands::run::run_local(commands::run::RunOptions {
                pipeline,
                parameters,
                environments,
                executor,
                approvals,
                sources,
                workspace_root,
                probe_timeout,
            })
            .await?;
        }
        Commands::Webhook {
            payload,
            signature,
            secret,
            parameters,
        } => {
            let parameters = commands::load_parameters(parameters.as_deref())?;
            commands::webhook::check(
                &payload,
                signature.as_deref(),
                &secret,
                &parameters,
                &environments,
            )?;
        }
    }

    Ok(())
}
