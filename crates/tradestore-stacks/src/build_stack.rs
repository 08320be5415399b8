//! The build pipeline's own resources.

use tradestore_core::Environment;
use tradestore_core::stack::*;

use crate::projects::{APP_BUILD_PROJECT, INFRA_BUILD_PROJECT};
use crate::service::IMAGE_REPOSITORY_NAME;

/// Stack holding the image repository and the build project roles.
pub const BUILD_STACK: &str = "TradeStoreBuildStack";
/// Output carrying the `latest` image of the repository.
pub const IMAGE_OUTPUT: &str = "image";

const REPOSITORY_ID: &str = "ecrRepo";

/// The image repository the application build pushes to, with pull and push
/// access for the application build project.
pub fn build_stack(pipeline: &Environment) -> EnvironmentStack {
    EnvironmentStack::new(BUILD_STACK, pipeline.clone())
        .with_repository(RepositorySpec {
            logical_id: REPOSITORY_ID.to_string(),
            repository_name: IMAGE_REPOSITORY_NAME.to_string(),
            removal: RemovalPolicy::Retain,
        })
        .with_build_role(BuildRoleSpec::new(INFRA_BUILD_PROJECT))
        .with_build_role(BuildRoleSpec::new(APP_BUILD_PROJECT))
        .with_grant(Grant {
            principal: Principal::BuildProject(APP_BUILD_PROJECT.to_string()),
            resource: REPOSITORY_ID.to_string(),
            access: Access::PullPush,
        })
        .with_output(StackOutput {
            name: IMAGE_OUTPUT.to_string(),
            export_name: None,
            value: OutputValue::RepositoryImage {
                repository: REPOSITORY_ID.to_string(),
                tag: "latest".to_string(),
            },
        })
}
