//! In-memory stack deployer.
//!
//! Keeps one stack per `(environment, stack name)` and applies templates
//! atomically: a deployment either replaces the whole stack state or leaves the
//! previous state in place and records the rollback.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;
use tracing::{info, warn};
use tradestore_core::deployer::*;
use tradestore_core::environment::Environment;
use tradestore_core::{Error, Result};

use crate::template::BoundTemplate;

type StackKey = (Environment, String);

/// Deployer keeping stacks in memory.
#[derive(Default)]
pub struct LocalDeployer {
    stacks: RwLock<HashMap<StackKey, DeploymentState>>,
}

struct Applied {
    parameters: BTreeMap<String, String>,
    outputs: BTreeMap<String, String>,
    resources: Value,
}

impl LocalDeployer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every known stack with its current status.
    pub async fn stacks(&self) -> Vec<(Environment, String, DeploymentStatus)> {
        let stacks = self.stacks.read().await;
        let mut all: Vec<_> = stacks
            .iter()
            .map(|((env, name), state)| (env.clone(), name.clone(), state.status.clone()))
            .collect();
        all.sort_by(|a, b| (&a.1, a.0.to_string()).cmp(&(&b.1, b.0.to_string())));
        all
    }

    fn apply(spec: &StackDeploymentSpec) -> Result<Applied> {
        let bound = BoundTemplate::bind(
            &spec.stack_name,
            &spec.environment,
            &spec.template,
            &spec.parameters,
        )?;
        let resources = bound.resources(&spec.template)?;
        let outputs = bound.outputs(&spec.template)?;
        Ok(Applied {
            parameters: bound.parameters().clone(),
            outputs,
            resources,
        })
    }

    fn handle(spec: &StackDeploymentSpec) -> DeploymentHandle {
        DeploymentHandle {
            id: spec.id,
            stack_name: spec.stack_name.clone(),
            environment: spec.environment.clone(),
            deployer_name: "local".to_string(),
        }
    }
}

#[async_trait]
impl Deployer for LocalDeployer {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn validate(&self, spec: &StackDeploymentSpec) -> Result<Vec<ValidationWarning>> {
        Self::apply(spec)?;

        let mut warnings = Vec::new();
        if spec.admin_permissions {
            warnings.push(ValidationWarning {
                field: "admin_permissions".to_string(),
                message: format!("stack {} is deployed with administrator permissions", spec.stack_name),
            });
        }
        if spec
            .template
            .get("Outputs")
            .and_then(Value::as_object)
            .is_none_or(|o| o.is_empty())
        {
            warnings.push(ValidationWarning {
                field: "Outputs".to_string(),
                message: format!("stack {} declares no outputs", spec.stack_name),
            });
        }
        Ok(warnings)
    }

    async fn deploy(&self, spec: StackDeploymentSpec) -> Result<DeploymentHandle> {
        let key = (spec.environment.clone(), spec.stack_name.clone());
        info!(
            stack = %spec.stack_name,
            environment = %spec.environment,
            deployment = %spec.id,
            "Deploying stack"
        );

        let mut stacks = self.stacks.write().await;
        let previous = stacks
            .get(&key)
            .filter(|s| !matches!(s.status, DeploymentStatus::Failed { .. }))
            .cloned();

        match Self::apply(&spec) {
            Ok(applied) => {
                let status = if previous.is_some() {
                    DeploymentStatus::UpdateComplete
                } else {
                    DeploymentStatus::CreateComplete
                };
                info!(stack = %spec.stack_name, status = ?status, "Stack deployed");
                stacks.insert(
                    key,
                    DeploymentState {
                        status,
                        parameters: applied.parameters,
                        outputs: applied.outputs,
                        resources: applied.resources,
                        last_updated: Utc::now(),
                    },
                );
                Ok(Self::handle(&spec))
            }
            Err(e) => {
                let reason = e.to_string();
                warn!(stack = %spec.stack_name, error = %reason, "Stack deployment failed");
                let state = match previous {
                    Some(previous) => DeploymentState {
                        status: DeploymentStatus::RollbackComplete {
                            reason: reason.clone(),
                        },
                        last_updated: Utc::now(),
                        ..previous
                    },
                    None => DeploymentState {
                        status: DeploymentStatus::Failed {
                            reason: reason.clone(),
                        },
                        parameters: BTreeMap::new(),
                        outputs: BTreeMap::new(),
                        resources: Value::Null,
                        last_updated: Utc::now(),
                    },
                };
                stacks.insert(key, state);
                Err(Error::DeploymentFailed(format!(
                    "stack {}: {}",
                    spec.stack_name, reason
                )))
            }
        }
    }

    async fn state(&self, handle: &DeploymentHandle) -> Result<DeploymentState> {
        self.stacks
            .read()
            .await
            .get(&(handle.environment.clone(), handle.stack_name.clone()))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("stack {}", handle.stack_name)))
    }

    async fn outputs(
        &self,
        environment: &Environment,
        stack_name: &str,
    ) -> Result<BTreeMap<String, String>> {
        let stacks = self.stacks.read().await;
        let state = stacks
            .get(&(environment.clone(), stack_name.to_string()))
            .ok_or_else(|| Error::NotFound(format!("stack {} in {}", stack_name, environment)))?;
        if let DeploymentStatus::Failed { reason } = &state.status {
            return Err(Error::NotFound(format!(
                "stack {} in {} was never created: {}",
                stack_name, environment, reason
            )));
        }
        Ok(state.outputs.clone())
    }

    async fn destroy(&self, handle: &DeploymentHandle) -> Result<()> {
        info!(stack = %handle.stack_name, environment = %handle.environment, "Destroying stack");
        self.stacks
            .write()
            .await
            .remove(&(handle.environment.clone(), handle.stack_name.clone()))
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("stack {}", handle.stack_name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tradestore_core::ResourceId;

    fn env() -> Environment {
        Environment::new("111111111111", "us-west-2")
    }

    fn spec(tag: Option<&str>) -> StackDeploymentSpec {
        StackDeploymentSpec {
            id: ResourceId::new(),
            stack_name: "Devo-WebService".to_string(),
            environment: env(),
            template: json!({
                "Parameters": { "ImageTag": { "Type": "String" } },
                "Resources": {
                    "WebLoadBalancer": {
                        "Type": "AWS::ElasticLoadBalancingV2::LoadBalancer",
                        "Properties": { "Name": "web" },
                    },
                    "WebTask": {
                        "Type": "AWS::ECS::TaskDefinition",
                        "Properties": {
                            "Image": { "Fn::Join": ["", ["repo:", { "Ref": "ImageTag" }]] },
                        },
                    },
                },
                "Outputs": {
                    "loadBalancerUrl": { "Value": { "Fn::GetAtt": ["WebLoadBalancer", "DNSName"] } },
                },
            }),
            parameters: tag
                .map(|t| BTreeMap::from([("ImageTag".to_string(), t.to_string())]))
                .unwrap_or_default(),
            admin_permissions: true,
        }
    }

    #[tokio::test]
    async fn test_create_then_update() {
        let deployer = LocalDeployer::new();

        let handle = deployer.deploy(spec(Some("v1"))).await.unwrap();
        let state = deployer.state(&handle).await.unwrap();
        assert_eq!(state.status, DeploymentStatus::CreateComplete);
        assert_eq!(
            state.resources["WebTask"]["Properties"]["Image"],
            "repo:v1"
        );

        deployer.deploy(spec(Some("v2"))).await.unwrap();
        let state = deployer.state(&handle).await.unwrap();
        assert_eq!(state.status, DeploymentStatus::UpdateComplete);
        assert_eq!(state.parameters["ImageTag"], "v2");

        let outputs = deployer.outputs(&env(), "Devo-WebService").await.unwrap();
        assert_eq!(outputs["loadBalancerUrl"], "web.us-west-2.elb.amazonaws.com");
    }

    #[tokio::test]
    async fn test_failed_update_keeps_previous_state() {
        let deployer = LocalDeployer::new();
        let handle = deployer.deploy(spec(Some("v1"))).await.unwrap();

        let err = deployer.deploy(spec(None)).await.unwrap_err();
        assert!(matches!(err, Error::DeploymentFailed(_)));

        let state = deployer.state(&handle).await.unwrap();
        assert!(matches!(state.status, DeploymentStatus::RollbackComplete { .. }));
        assert_eq!(state.parameters["ImageTag"], "v1");
        assert_eq!(
            state.resources["WebTask"]["Properties"]["Image"],
            "repo:v1"
        );
    }

    #[tokio::test]
    async fn test_failed_create() {
        let deployer = LocalDeployer::new();
        assert!(deployer.deploy(spec(None)).await.is_err());
        assert!(deployer.outputs(&env(), "Devo-WebService").await.is_err());

        let stacks = deployer.stacks().await;
        assert!(matches!(stacks[0].2, DeploymentStatus::Failed { .. }));

        // A later successful deployment is a create.
        let handle = deployer.deploy(spec(Some("v1"))).await.unwrap();
        let state = deployer.state(&handle).await.unwrap();
        assert_eq!(state.status, DeploymentStatus::CreateComplete);
    }

    #[tokio::test]
    async fn test_validate_warnings() {
        let deployer = LocalDeployer::new();
        let warnings = deployer.validate(&spec(Some("v1"))).await.unwrap();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].field, "admin_permissions");
        assert!(deployer.validate(&spec(None)).await.is_err());
    }

    #[tokio::test]
    async fn test_destroy() {
        let deployer = LocalDeployer::new();
        let handle = deployer.deploy(spec(Some("v1"))).await.unwrap();
        deployer.destroy(&handle).await.unwrap();
        assert!(matches!(
            deployer.state(&handle).await,
            Err(Error::NotFound(_))
        ));
        assert!(deployer.destroy(&handle).await.is_err());
    }
}
