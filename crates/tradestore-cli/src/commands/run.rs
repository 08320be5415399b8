//! Local pipeline execution command.

use anyhow::{Context, Result};
use clap::ValueEnum;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::info;
use tradestore_core::EnvironmentConfig;
use tradestore_core::artifact::InMemoryArtifactStore;
use tradestore_core::executor::{Executor, LogStream};
use tradestore_core::pipeline::{ActionStatus, PipelineStatus, StageStatus};
use tradestore_core::secret::StaticSecretStore;
use tradestore_core::source::Trigger;
use tradestore_deployer::LocalDeployer;
use tradestore_executor::{LocalDockerExecutor, LocalShellExecutor};
use tradestore_scheduler::{
    ApprovalDecision, ApprovalGate, ApprovalInbox, AutoApprove, ChannelApprovalGate,
    DirectorySourceFetcher, GitSourceFetcher, HttpProbe, PipelineEvent, PipelineOrchestrator,
    Services, SourceFetcher, StaticDecision,
};
use tradestore_stacks::BuildPipelineParameters;

/// Prefix of process environment variables served as secrets.
pub const SECRET_ENV_PREFIX: &str = "TRADESTORE_SECRET";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PipelineKind {
    /// Build the image and deploy it into the pipeline environment
    Build,
    /// Synthesize once and deploy to every target
    Delivery,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ExecutorKind {
    Docker,
    Shell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ApprovalMode {
    /// Ask on the terminal
    Prompt,
    Approve,
    Reject,
}

pub struct RunOptions {
    pub pipeline: PipelineKind,
    pub parameters: BuildPipelineParameters,
    pub environments: EnvironmentConfig,
    pub executor: ExecutorKind,
    pub approvals: ApprovalMode,
    pub sources: Vec<String>,
    pub workspace_root: Option<PathBuf>,
    pub probe_timeout: u64,
}

/// Split a `owner/repo=path` source override.
fn parse_source_override(value: &str) -> Result<(String, PathBuf)> {
    let (repository, path) = value
        .split_once('=')
        .with_context(|| format!("Invalid source '{}', expected owner/repo=path", value))?;
    if repository.split('/').filter(|p| !p.is_empty()).count() != 2 {
        anyhow::bail!("Invalid repository '{}', expected owner/repo", repository);
    }
    if path.is_empty() {
        anyhow::bail!("Missing path for source '{}'", repository);
    }
    Ok((repository.to_string(), PathBuf::from(path)))
}

fn source_fetcher(overrides: &[String]) -> Result<Arc<dyn SourceFetcher>> {
    if overrides.is_empty() {
        return Ok(Arc::new(GitSourceFetcher::new()));
    }
    let mut fetcher = DirectorySourceFetcher::new();
    for value in overrides {
        let (repository, path) = parse_source_override(value)?;
        let path = path
            .canonicalize()
            .with_context(|| format!("Failed to resolve source path for {}", repository))?;
        info!(repository = %repository, path = %path.display(), "Using local source");
        fetcher = fetcher.with_repository(repository, path);
    }
    Ok(Arc::new(fetcher))
}

/// Answer approval requests from the terminal.
async fn prompt_approvals(mut inbox: ApprovalInbox) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(request) = inbox.requests.recv().await {
        let prompt = format!(
            "\n? Approve '{}' in stage '{}' of {}? [y/N] ",
            request.action, request.stage, request.pipeline
        );
        if stdout.write_all(prompt.as_bytes()).await.is_err() || stdout.flush().await.is_err() {
            break;
        }
        let decision = match lines.next_line().await {
            Ok(Some(answer)) if matches!(answer.trim(), "y" | "Y" | "yes") => {
                ApprovalDecision::approve()
            }
            Ok(Some(_)) => ApprovalDecision::reject("rejected on the terminal"),
            _ => ApprovalDecision::reject("no answer"),
        };
        if inbox.decisions.send(decision).is_err() {
            break;
        }
    }
}

/// Run a pipeline locally against the local deployer.
pub async fn run_local(options: RunOptions) -> Result<()> {
    let definition =
        super::pipeline_definition(options.pipeline, &options.parameters, &options.environments)?;

    println!("Running pipeline: {}", definition.name);
    println!("Stages: {}", definition.stages.len());

    let executor: Arc<dyn Executor> = match options.executor {
        ExecutorKind::Docker => {
            Arc::new(LocalDockerExecutor::new().context("Failed to connect to Docker")?)
        }
        ExecutorKind::Shell => Arc::new(LocalShellExecutor::new()),
    };

    let approvals: Arc<dyn ApprovalGate> = match options.approvals {
        ApprovalMode::Approve => Arc::new(AutoApprove),
        ApprovalMode::Reject => Arc::new(StaticDecision(ApprovalDecision::reject(
            "rejected from the command line",
        ))),
        ApprovalMode::Prompt => {
            let (gate, inbox) = ChannelApprovalGate::new();
            tokio::spawn(prompt_approvals(inbox));
            Arc::new(gate)
        }
    };

    let secrets = StaticSecretStore::from_env(SECRET_ENV_PREFIX);
    if secrets.is_empty() {
        println!(
            "No secrets found; set {}_<NAME> to provide source tokens",
            SECRET_ENV_PREFIX
        );
    }

    let services = Services {
        executor,
        deployer: Arc::new(LocalDeployer::new()),
        artifacts: Arc::new(InMemoryArtifactStore::new()),
        secrets: Arc::new(secrets),
        approvals,
        sources: source_fetcher(&options.sources)?,
        probe: Arc::new(
            HttpProbe::new(Duration::from_secs(options.probe_timeout))
                .context("Failed to create HTTP client")?,
        ),
    };

    let orchestrator = match options.workspace_root {
        Some(root) => {
            std::fs::create_dir_all(&root)
                .with_context(|| format!("Failed to create {}", root.display()))?;
            PipelineOrchestrator::with_workspace_root(services, root)
        }
        None => PipelineOrchestrator::new(services),
    };

    println!("\n--- Starting pipeline execution ---\n");

    let (mut rx, result_handle) = orchestrator.execute(&definition, Trigger::Manual);

    while let Some(event) = rx.recv().await {
        match event {
            PipelineEvent::RunStarted { run_id, pipeline } => {
                println!("Run {} of {}", run_id, pipeline);
            }
            PipelineEvent::StageStarted { stage } => {
                println!("▶ Stage '{}' started", stage);
            }
            PipelineEvent::ActionStarted { action, .. } => {
                println!("  ▷ {}", action);
            }
            PipelineEvent::ActionLog { action, line } => {
                let stream_marker = match line.stream {
                    LogStream::Stdout => " ",
                    LogStream::Stderr => "!",
                    LogStream::System => "*",
                };
                println!("  [{}]{} {}", action, stream_marker, line.content);
            }
            PipelineEvent::ActionCompleted { action, status, .. } => match status {
                ActionStatus::Succeeded => println!("  ✓ {}", action),
                ActionStatus::Failed { reason } => println!("  ✗ {}", reason),
            },
            PipelineEvent::AwaitingApproval { action, .. } => {
                println!("  ? '{}' is waiting for approval", action);
            }
            PipelineEvent::StageCompleted { stage, status } => match status {
                StageStatus::Succeeded => println!("✓ Stage '{}' completed successfully\n", stage),
                _ => println!("✗ Stage '{}' failed\n", stage),
            },
            PipelineEvent::RunCompleted { status } => {
                if status == PipelineStatus::Succeeded {
                    println!("--- Pipeline completed successfully ---");
                } else {
                    println!("--- Pipeline failed ---");
                }
            }
        }
    }

    let run = result_handle
        .await
        .context("Pipeline execution task failed")?;

    println!("\n--- Stage Summary ---");
    for stage in &run.stages {
        let status = match &stage.status {
            StageStatus::Succeeded => "✓ succeeded".to_string(),
            StageStatus::Failed { message } => format!("✗ failed: {}", message),
            StageStatus::Skipped { reason } => format!("⊘ skipped: {}", reason),
            StageStatus::WaitingApproval => "? waiting for approval".to_string(),
            StageStatus::Pending => "○ pending".to_string(),
            StageStatus::Running => "▶ running".to_string(),
        };
        println!("  {} - {}", stage.name, status);
    }

    for (namespace, variables) in &run.variables {
        for (name, value) in variables {
            println!("  #{{{}.{}}} = {}", namespace, name, value);
        }
    }

    match run.status {
        PipelineStatus::Succeeded => {
            println!("\n✓ Pipeline succeeded!");
            Ok(())
        }
        PipelineStatus::Failed { stage, reason } => {
            anyhow::bail!("Pipeline failed in stage '{}': {}", stage, reason)
        }
        other => anyhow::bail!("Pipeline ended in state {:?}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_source_override() {
        let (repository, path) =
            parse_source_override("cvlsrivatsa/TradeStoreApp=../app").unwrap();
        assert_eq!(repository, "cvlsrivatsa/TradeStoreApp");
        assert_eq!(path, PathBuf::from("../app"));

        assert!(parse_source_override("cvlsrivatsa/TradeStoreApp").is_err());
        assert!(parse_source_override("TradeStoreApp=../app").is_err());
        assert!(parse_source_override("cvlsrivatsa/TradeStoreApp=").is_err());
    }
}
