//! Webhook check command.

use anyhow::{Context, Result};
use std::path::Path;
use tracing::warn;
use tradestore_core::EnvironmentConfig;
use tradestore_core::pipeline::PipelineDefinition;
use tradestore_core::source::{PushEvent, verify_github_signature};
use tradestore_stacks::BuildPipelineParameters;

use super::pipeline_definition;
use super::run::PipelineKind;

/// Names of the pipelines `body` starts, after checking its signature.
fn triggered_pipelines<'a>(
    body: &[u8],
    signature: Option<&str>,
    secret: &str,
    pipelines: &'a [PipelineDefinition],
) -> Result<Option<(PushEvent, Vec<&'a str>)>> {
    if !verify_github_signature(secret, body, signature) {
        anyhow::bail!("Invalid webhook signature");
    }
    let payload: serde_json::Value =
        serde_json::from_slice(body).context("Webhook body is not JSON")?;
    let Some(event) = PushEvent::from_github_payload(&payload) else {
        return Ok(None);
    };
    let names = pipelines
        .iter()
        .filter(|p| p.triggered_by(&event))
        .map(|p| p.name.as_str())
        .collect();
    Ok(Some((event, names)))
}

pub fn check(
    payload: &Path,
    signature: Option<&str>,
    secret: &str,
    parameters: &BuildPipelineParameters,
    environments: &EnvironmentConfig,
) -> Result<()> {
    let body = std::fs::read(payload)
        .with_context(|| format!("Failed to read payload: {}", payload.display()))?;
    let pipelines = vec![
        pipeline_definition(PipelineKind::Build, parameters, environments)?,
        pipeline_definition(PipelineKind::Delivery, parameters, environments)?,
    ];

    match triggered_pipelines(&body, signature, secret, &pipelines)? {
        None => {
            warn!("Payload is not a push event");
            println!("Ignored: not a push event");
        }
        Some((event, names)) => {
            println!(
                "Push to {} ({}) by {}",
                event.repository_full_name, event.r#ref, event.pusher
            );
            if names.is_empty() {
                println!("No pipeline is triggered");
            }
            for name in names {
                println!("Triggers {}", name);
            }
        }
    }
    Ok(())
}
