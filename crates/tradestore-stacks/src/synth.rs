//! Synthesizing every stack template the pipelines deploy.

use serde_json::Value;
use std::collections::BTreeMap;
use tradestore_core::EnvironmentConfig;
use tradestore_core::Result;
use tradestore_core::image::ContainerImage;
use tradestore_core::stack::DeployableUnit;

use crate::build_stack::build_stack;
use crate::pipelines::PIPELINE_STACK_TEMPLATE;
use crate::service::{TradeStoreStage, deferred_image, ecr_repository, trade_store_stack};

/// Image the delivery pipeline deploys to its targets.
pub fn delivery_image(environments: &EnvironmentConfig) -> ContainerImage {
    ContainerImage::Registry(format!("{}:latest", ecr_repository(&environments.pipeline)))
}

/// Every template keyed by file name.
///
/// Holds the build stack with the image repository, the pipeline-environment
/// stack whose image tag is a parameter, and one web service stack per
/// deployment target.
pub fn synthesize_all(environments: &EnvironmentConfig) -> Result<BTreeMap<String, Value>> {
    environments.validate()?;
    let mut templates = BTreeMap::new();

    let build = build_stack(&environments.pipeline);
    templates.insert(format!("{}.template.json", build.name), build.synthesize()?);

    let pipeline_stack = trade_store_stack(
        "EcsStackDeployedInPipeline",
        environments.pipeline.clone(),
        ContainerImage::TagParameter(deferred_image(&environments.pipeline)),
    );
    templates.insert(PIPELINE_STACK_TEMPLATE.to_string(), pipeline_stack.synthesize()?);

    let stage = TradeStoreStage::new(delivery_image(environments));
    for target in &environments.targets {
        for stack in stage.instantiate(target) {
            templates.insert(format!("{}.template.json", stack.name), stack.synthesize()?);
        }
    }
    Ok(templates)
}
