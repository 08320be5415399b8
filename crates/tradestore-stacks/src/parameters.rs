//! Deploy-time parameters of the build pipeline and the default environments.

use serde::{Deserialize, Serialize};
use tradestore_core::{DeploymentTarget, Environment, EnvironmentConfig};

/// Account the trade-store pipeline and its environments live in.
pub const DEFAULT_ACCOUNT: &str = "191296374569";

/// Repository coordinates and the secret holding the GitHub token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BuildPipelineParameters {
    /// GitHub user owning both repositories.
    pub github_user_name: String,
    /// Repository holding the infrastructure definitions.
    pub github_cdk_repository: String,
    /// Repository holding the application source.
    pub github_repository: String,
    /// Name of the secret holding the GitHub personal access token.
    pub github_personal_token_secret_name: String,
}

impl Default for BuildPipelineParameters {
    fn default() -> Self {
        Self {
            github_user_name: "cvlsrivatsa".to_string(),
            github_cdk_repository: "TradeStoreCdk".to_string(),
            github_repository: "TradeStoreApp".to_string(),
            github_personal_token_secret_name: "github-token".to_string(),
        }
    }
}

/// The pipeline environment plus the `Devo` and `PreProd` targets.
pub fn default_environments() -> EnvironmentConfig {
    EnvironmentConfig::new(Environment::new(DEFAULT_ACCOUNT, "us-east-1"))
        .with_target(
            DeploymentTarget::new("Devo", Environment::new(DEFAULT_ACCOUNT, "us-west-2"))
                .with_validation(),
        )
        .with_target(
            DeploymentTarget::new("PreProd", Environment::new(DEFAULT_ACCOUNT, "us-east-1"))
                .with_post_approval(),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let params = BuildPipelineParameters::default();
        assert_eq!(params.github_user_name, "cvlsrivatsa");
        assert_eq!(params.github_cdk_repository, "TradeStoreCdk");
        assert_eq!(params.github_repository, "TradeStoreApp");
        assert_eq!(params.github_personal_token_secret_name, "github-token");
    }

    #[test]
    fn test_partial_override() {
        let params: BuildPipelineParameters =
            serde_json::from_str(r#"{"githubUserName":"someone"}"#).unwrap();
        assert_eq!(params.github_user_name, "someone");
        assert_eq!(params.github_repository, "TradeStoreApp");
    }

    #[test]
    fn test_default_environments_are_valid() {
        let config = default_environments();
        config.validate().unwrap();
        assert!(config.target("Devo").unwrap().validate);
        assert!(config.target("PreProd").unwrap().post_approval);
    }
}
