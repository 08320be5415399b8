//! CLI command implementations.

pub mod run;
pub mod webhook;

use anyhow::{Context, Result};
use std::path::Path;
use tradestore_core::EnvironmentConfig;
use tradestore_core::pipeline::PipelineDefinition;
use tradestore_stacks::{
    BuildPipelineParameters, build_pipeline, default_environments, delivery_pipeline,
};

use run::PipelineKind;

pub fn load_environment_config(path: Option<&Path>) -> Result<EnvironmentConfig> {
    match path {
        Some(path) => tradestore_config::load_environments(path)
            .with_context(|| format!("Failed to load environments: {}", path.display())),
        None => Ok(default_environments()),
    }
}

pub fn load_parameters(path: Option<&Path>) -> Result<BuildPipelineParameters> {
    let Some(path) = path else {
        return Ok(BuildPipelineParameters::default());
    };
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read parameters: {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse parameters: {}", path.display()))
}

pub fn pipeline_definition(
    kind: PipelineKind,
    parameters: &BuildPipelineParameters,
    environments: &EnvironmentConfig,
) -> Result<PipelineDefinition> {
    let definition = match kind {
        PipelineKind::Build => build_pipeline(parameters, environments)?,
        PipelineKind::Delivery => delivery_pipeline(parameters, environments)?,
    };
    Ok(definition)
}

pub fn validate(path: &Path) -> Result<()> {
    let pipeline = tradestore_config::load_pipeline(path)
        .with_context(|| format!("Invalid pipeline configuration: {}", path.display()))?;
    println!(
        "Configuration is valid: {} ({} stages, {} actions)",
        pipeline.name,
        pipeline.stages.len(),
        pipeline.actions().count()
    );
    Ok(())
}

pub fn environments(config: &EnvironmentConfig) {
    println!("pipeline  {}", config.pipeline);
    for target in &config.targets {
        let mut flags = Vec::new();
        if target.validate {
            flags.push("validate");
        }
        if target.post_approval {
            flags.push("post-approval");
        }
        println!("{:<9} {} {}", target.name, target.environment, flags.join(" "));
    }
}

pub fn synth(config: &EnvironmentConfig, out: &Path) -> Result<()> {
    let templates = tradestore_stacks::synthesize_all(config).context("Failed to synthesize")?;
    std::fs::create_dir_all(out)
        .with_context(|| format!("Failed to create {}", out.display()))?;
    for (name, template) in &templates {
        let path = out.join(name);
        let content = serde_json::to_string_pretty(template)?;
        std::fs::write(&path, content)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        println!("{}", path.display());
    }
    Ok(())
}

pub fn show(
    kind: PipelineKind,
    parameters: &BuildPipelineParameters,
    environments: &EnvironmentConfig,
) -> Result<()> {
    let definition = pipeline_definition(kind, parameters, environments)?;
    println!("{}", serde_json::to_string_pretty(&definition)?);
    Ok(())
}
