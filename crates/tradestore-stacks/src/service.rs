//! The trade-store web service stack.

use std::collections::BTreeMap;
use tradestore_core::image::{ContainerImage, DeferredImage};
use tradestore_core::stack::*;
use tradestore_core::{DeploymentTarget, Environment};

/// Name of the container, also used in `imagedefinitions.json`.
pub const CONTAINER_NAME: &str = "trade-store-app";
/// Image repository the application build pushes to.
pub const IMAGE_REPOSITORY_NAME: &str = "trade-store-app";
/// Template parameter carrying the image tag of a deferred image.
pub const IMAGE_TAG_PARAMETER: &str = "TradeStoreAppImageTag";
/// Name of the stack inside every deployable unit.
pub const WEB_SERVICE_STACK: &str = "WebService";
/// Output carrying the ARN of the trade-store function.
pub const FUNCTION_ARN_OUTPUT: &str = "lambdaFunctionArn";

const SERVICE_ID: &str = "FargateService";

/// URI of the `trade-store-app` image repository in `environment`.
pub fn ecr_repository(environment: &Environment) -> String {
    format!(
        "{}.dkr.ecr.{}.amazonaws.com/{}",
        environment.account, environment.region, IMAGE_REPOSITORY_NAME
    )
}

/// The service image whose tag is bound by the deploy action.
pub fn deferred_image(pipeline: &Environment) -> DeferredImage {
    DeferredImage::new(ecr_repository(pipeline), IMAGE_TAG_PARAMETER)
}

/// Queue, function, trade record table, network and the load-balanced
/// service.
pub fn trade_store_stack(
    name: impl Into<String>,
    environment: Environment,
    image: ContainerImage,
) -> EnvironmentStack {
    EnvironmentStack::new(name, environment)
        .with_queue(QueueSpec {
            logical_id: "TradeStoreCdkQueue".to_string(),
            visibility_timeout_secs: 300,
        })
        .with_function(FunctionSpec {
            logical_id: "Lambda".to_string(),
            runtime: "nodejs14.x".to_string(),
            handler: "handler.handler".to_string(),
            code_asset: "lambda".to_string(),
        })
        .with_table(TableSpec {
            logical_id: "TradeRecordTable".to_string(),
            table_name: "TradeRecordTable".to_string(),
            partition_key: KeySpec::new("TradeId", AttributeType::String),
            sort_key: Some(KeySpec::new("Version", AttributeType::Number)),
            billing: BillingMode::PayPerRequest,
            removal: RemovalPolicy::Destroy,
        })
        .with_network(NetworkSpec {
            logical_id: "Vpc".to_string(),
            max_azs: 2,
            nat_gateways: 1,
        })
        .with_service(ServiceSpec {
            logical_id: SERVICE_ID.to_string(),
            container_name: CONTAINER_NAME.to_string(),
            container_port: 8080,
            cpu: 512,
            memory_mib: 2048,
            desired_count: 1,
            listener_port: 80,
            public_load_balancer: true,
            environment: BTreeMap::from([("myVar".to_string(), "variable01".to_string())]),
            image,
            health_check_path: HEALTH_CHECK_PATH.to_string(),
            execution_role_policies: vec!["AmazonEC2ContainerRegistryPowerUser".to_string()],
            scaling: Some(ScalingSpec {
                min_capacity: 1,
                max_capacity: 2,
                target_cpu_percent: 50,
                scale_in_cooldown_secs: 60,
                scale_out_cooldown_secs: 60,
            }),
        })
        .with_grant(Grant {
            principal: Principal::TaskRole(SERVICE_ID.to_string()),
            resource: "TradeRecordTable".to_string(),
            access: Access::ReadWriteData,
        })
        .with_output(StackOutput {
            name: LOAD_BALANCER_URL_OUTPUT.to_string(),
            export_name: Some(LOAD_BALANCER_URL_OUTPUT.to_string()),
            value: OutputValue::LoadBalancerDns {
                service: SERVICE_ID.to_string(),
            },
        })
        .with_output(StackOutput {
            name: FUNCTION_ARN_OUTPUT.to_string(),
            export_name: None,
            value: OutputValue::FunctionArn {
                function: "Lambda".to_string(),
            },
        })
}

/// Deployable unit holding the web service stack.
#[derive(Debug, Clone)]
pub struct TradeStoreStage {
    image: ContainerImage,
}

impl TradeStoreStage {
    pub fn new(image: ContainerImage) -> Self {
        Self { image }
    }

    /// Stack name of the web service for `target`.
    pub fn stack_name(target: &DeploymentTarget) -> String {
        format!("{}-{}", target.name, WEB_SERVICE_STACK)
    }
}

impl DeployableUnit for TradeStoreStage {
    fn name(&self) -> &str {
        "TradeStoreStage"
    }

    fn instantiate(&self, target: &DeploymentTarget) -> Vec<EnvironmentStack> {
        vec![trade_store_stack(
            Self::stack_name(target),
            target.environment.clone(),
            self.image.clone(),
        )]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn env(region: &str) -> Environment {
        Environment::new("191296374569", region)
    }

    #[test]
    fn test_service_configuration() {
        let image = ContainerImage::TagParameter(deferred_image(&env("us-east-1")));
        let template = trade_store_stack("EcsStackDeployedInPipeline", env("us-east-1"), image)
            .synthesize()
            .unwrap();
        let resources = &template["Resources"];

        assert_eq!(
            resources["TradeStoreCdkQueue"]["Properties"]["VisibilityTimeout"],
            300
        );
        assert_eq!(resources["TradeRecordTable"]["Properties"]["BillingMode"], "PAY_PER_REQUEST");

        let container = &resources["FargateServiceTaskDefinition"]["Properties"]
            ["ContainerDefinitions"][0];
        assert_eq!(container["Name"], "trade-store-app");
        assert_eq!(container["PortMappings"][0]["ContainerPort"], 8080);
        assert_eq!(container["Environment"][0]["Name"], "myVar");

        assert_eq!(resources["Lambda"]["Properties"]["Runtime"], "nodejs14.x");
        assert_eq!(resources["Lambda"]["Properties"]["Handler"], "handler.handler");

        assert!(template["Parameters"].get(IMAGE_TAG_PARAMETER).is_some());
        assert!(template["Outputs"].get(LOAD_BALANCER_URL_OUTPUT).is_some());
        assert!(template["Outputs"].get(FUNCTION_ARN_OUTPUT).is_some());
    }

    #[test]
    fn test_stage_instances_do_not_collide() {
        let stage = TradeStoreStage::new(ContainerImage::Registry(format!(
            "{}:latest",
            ecr_repository(&env("us-east-1"))
        )));
        let devo = DeploymentTarget::new("Devo", env("us-west-2"));
        let preprod = DeploymentTarget::new("PreProd", env("us-east-1"));

        let ids = |target: &DeploymentTarget| -> BTreeSet<String> {
            stage
                .instantiate(target)
                .iter()
                .flat_map(|s| s.resource_ids().unwrap())
                .collect()
        };
        let devo_ids = ids(&devo);
        assert!(!devo_ids.is_empty());
        assert!(devo_ids.is_disjoint(&ids(&preprod)));
        assert_eq!(TradeStoreStage::stack_name(&devo), "Devo-WebService");
    }

    #[test]
    fn test_ecr_repository() {
        assert_eq!(
            ecr_repository(&env("us-east-1")),
            "191296374569.dkr.ecr.us-east-1.amazonaws.com/trade-store-app"
        );
    }
}
