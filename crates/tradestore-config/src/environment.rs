//! Deployment environment configuration.
//!
//! ```kdl
//! pipeline account="123456789012" region="us-east-1"
//!
//! target "Devo" account="123456789012" region="us-west-2" validate=#true
//! target "PreProd" account="123456789012" region="us-east-1" post-approval=#true
//! ```

use kdl::{KdlDocument, KdlNode};
use std::path::Path;
use tradestore_core::{DeploymentTarget, Environment, EnvironmentConfig};

use crate::nodes::{get_bool_prop, get_first_string_arg, require_string_prop};
use crate::{ConfigError, ConfigResult};

/// Parse the environment configuration from KDL text.
pub fn parse_environments(kdl: &str) -> ConfigResult<EnvironmentConfig> {
    let doc: KdlDocument = kdl.parse()?;

    let mut pipeline = None;
    let mut targets = Vec::new();

    for node in doc.nodes() {
        match node.name().value() {
            "pipeline" => {
                if pipeline.is_some() {
                    return Err(ConfigError::Duplicate("pipeline environment".to_string()));
                }
                pipeline = Some(parse_environment(node, "pipeline")?);
            }
            "target" => {
                let name = get_first_string_arg(node)
                    .ok_or_else(|| ConfigError::MissingField("target name".to_string()))?;
                let environment = parse_environment(node, &name)?;
                let mut target = DeploymentTarget::new(name, environment);
                target.validate = get_bool_prop(node, "validate").unwrap_or(false);
                target.post_approval = get_bool_prop(node, "post-approval").unwrap_or(false);
                targets.push(target);
            }
            _ => {}
        }
    }

    let pipeline =
        pipeline.ok_or_else(|| ConfigError::MissingField("pipeline environment".to_string()))?;
    let config = EnvironmentConfig { pipeline, targets };
    config.validate().map_err(|e| ConfigError::InvalidValue {
        field: "environments".to_string(),
        message: e.to_string(),
    })?;
    Ok(config)
}

/// Read and parse an environment configuration file.
pub fn load_environments(path: impl AsRef<Path>) -> ConfigResult<EnvironmentConfig> {
    let text = std::fs::read_to_string(path)?;
    parse_environments(&text)
}

fn parse_environment(node: &KdlNode, owner: &str) -> ConfigResult<Environment> {
    let account = require_string_prop(node, "account", owner)?;
    let region = require_string_prop(node, "region", owner)?;
    Ok(Environment::new(account, region))
}
