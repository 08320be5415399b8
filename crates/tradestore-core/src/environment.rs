//! Target environments (account/region pairs).
//!
//! Every account and region used by the pipeline comes from a single
//! [`EnvironmentConfig`] loaded at the entry point and passed down explicitly.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::{Error, Result};

/// An AWS account and region pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Environment {
    pub account: String,
    pub region: String,
}

impl Environment {
    pub fn new(account: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            region: region.into(),
        }
    }

    /// Suffix used to make physical resource names unique per environment.
    pub fn qualifier(&self) -> String {
        format!("{}-{}", self.region, self.account)
    }

    fn validate(&self, what: &str) -> Result<()> {
        if self.account.len() != 12 || !self.account.chars().all(|c| c.is_ascii_digit()) {
            return Err(Error::InvalidInput(format!(
                "{}: account '{}' must be a 12-digit account id",
                what, self.account
            )));
        }
        if self.region.is_empty() {
            return Err(Error::InvalidInput(format!("{}: region is empty", what)));
        }
        Ok(())
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.account, self.region)
    }
}

/// A named deployment of the application stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentTarget {
    /// Stage name, e.g. "Devo" or "PreProd".
    pub name: String,
    pub environment: Environment,
    /// Run a reachability check against the load balancer after deploying.
    pub validate: bool,
    /// Require manual approval after this target is deployed.
    pub post_approval: bool,
}

impl DeploymentTarget {
    pub fn new(name: impl Into<String>, environment: Environment) -> Self {
        Self {
            name: name.into(),
            environment,
            validate: false,
            post_approval: false,
        }
    }

    pub fn with_validation(mut self) -> Self {
        self.validate = true;
        self
    }

    pub fn with_post_approval(mut self) -> Self {
        self.post_approval = true;
        self
    }
}

/// The full set of environments a pipeline touches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    /// Where the pipeline itself, its build projects and the image registry live.
    pub pipeline: Environment,
    /// Application targets, in deployment order.
    pub targets: Vec<DeploymentTarget>,
}

impl EnvironmentConfig {
    pub fn new(pipeline: Environment) -> Self {
        Self {
            pipeline,
            targets: Vec::new(),
        }
    }

    pub fn with_target(mut self, target: DeploymentTarget) -> Self {
        self.targets.push(target);
        self
    }

    pub fn target(&self, name: &str) -> Option<&DeploymentTarget> {
        self.targets.iter().find(|t| t.name == name)
    }

    pub fn validate(&self) -> Result<()> {
        self.pipeline.validate("pipeline environment")?;

        let mut seen = HashSet::new();
        for target in &self.targets {
            if target.name.is_empty() {
                return Err(Error::InvalidInput("target name is empty".to_string()));
            }
            if !seen.insert(target.name.as_str()) {
                return Err(Error::InvalidInput(format!(
                    "duplicate target name: {}",
                    target.name
                )));
            }
            target
                .environment
                .validate(&format!("target '{}'", target.name))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> EnvironmentConfig {
        EnvironmentConfig::new(Environment::new("111111111111", "us-east-1"))
            .with_target(DeploymentTarget::new(
                "Devo",
                Environment::new("111111111111", "us-west-2"),
            ))
            .with_target(DeploymentTarget::new(
                "PreProd",
                Environment::new("111111111111", "us-east-1"),
            ))
    }

    #[test]
    fn test_valid_config() {
        assert!(config().validate().is_ok());
        assert_eq!(config().target("PreProd").unwrap().environment.region, "us-east-1");
    }

    #[test]
    fn test_duplicate_target_rejected() {
        let cfg = config().with_target(DeploymentTarget::new(
            "Devo",
            Environment::new("222222222222", "eu-west-1"),
        ));
        assert!(matches!(cfg.validate(), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_bad_account_rejected() {
        let cfg = EnvironmentConfig::new(Environment::new("1234", "us-east-1"));
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("12-digit"));
    }

    #[test]
    fn test_qualifier() {
        let env = Environment::new("111111111111", "us-west-2");
        assert_eq!(env.qualifier(), "us-west-2-111111111111");
        assert_eq!(env.to_string(), "111111111111/us-west-2");
    }
}
