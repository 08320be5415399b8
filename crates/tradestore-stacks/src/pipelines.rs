//! The trade-store build and delivery pipelines.

use std::collections::BTreeMap;
use tradestore_core::artifact::ArtifactName;
use tradestore_core::pipeline::{
    Action, ActionKind, BuildAction, DeployAction, OutputRef, PipelineBuilder, PipelineDefinition,
    ReachabilityCheck, Stage, ValidateAction,
};
use tradestore_core::source::GitHubSource;
use tradestore_core::stack::{HEALTH_CHECK_PATH, LOAD_BALANCER_URL_OUTPUT};
use tradestore_core::topology::TopologyError;
use tradestore_core::{DeploymentTarget, EnvironmentConfig};

use crate::parameters::BuildPipelineParameters;
use crate::projects::{
    IMAGE_TAG_VARIABLE, app_build_project, infra_build_project, prebuild_project,
};
use crate::service::{TradeStoreStage, deferred_image, ecr_repository};

/// Template the infrastructure build synthesizes for the pipeline deployment.
pub const PIPELINE_STACK_TEMPLATE: &str = "EcsStackDeployedInPipeline.template.json";
/// Stack the build pipeline deploys.
pub const PIPELINE_DEPLOY_STACK: &str = "SampleEcsStackDeployedFromCodePipeline";

fn sources(params: &BuildPipelineParameters) -> (GitHubSource, GitHubSource) {
    let source = |repo: &str| {
        GitHubSource::new(
            &params.github_user_name,
            repo,
            "main",
            &params.github_personal_token_secret_name,
        )
    };
    (
        source(&params.github_cdk_repository),
        source(&params.github_repository),
    )
}

/// Source, build, approve and deploy the web service into the pipeline
/// environment with the freshly built image.
pub fn build_pipeline(
    params: &BuildPipelineParameters,
    environments: &EnvironmentConfig,
) -> Result<PipelineDefinition, TopologyError> {
    let (cdk_source, app_source) = sources(params);
    let image = deferred_image(&environments.pipeline);

    let cdk_build = Action::build(
        "cdk_build",
        infra_build_project(),
        "cdk_source_output",
        vec!["cdk_build_output".into()],
    );
    let app_build = Action::build(
        "app_build",
        app_build_project(&ecr_repository(&environments.pipeline)),
        "app_source_output",
        vec!["app_build_output".into()],
    );

    let overrides = BTreeMap::from([image.parameter_override(app_build.variable(IMAGE_TAG_VARIABLE))]);
    let deploy = Action::deploy(
        "CFN_Deploy",
        DeployAction {
            stack_name: PIPELINE_DEPLOY_STACK.to_string(),
            environment: environments.pipeline.clone(),
            template: ArtifactName::new("cdk_build_output").at_path(PIPELINE_STACK_TEMPLATE),
            parameter_overrides: overrides,
            admin_permissions: true,
        },
    );

    PipelineBuilder::new("TradeStoreBuild")
        .add_stage(
            Stage::new("source")
                .with_action(Action::source("github_cdk_source", cdk_source, "cdk_source_output"))
                .with_action(Action::source("github_app_source", app_source, "app_source_output")),
        )
        .add_stage(
            Stage::new("build")
                .with_action(cdk_build)
                .with_action(app_build),
        )
        .add_stage(Stage::new("approve").with_action(Action::approval("approve")))
        .add_stage(Stage::new("deploy-to-ecs").with_action(deploy))
        .build()
}

fn target_stages(target: &DeploymentTarget) -> Vec<Stage> {
    let stack_name = TradeStoreStage::stack_name(target);
    let deploy_name = format!("{}-deploy", target.name);

    let mut stage = Stage::new(&target.name).with_action(Action::deploy(
        &deploy_name,
        DeployAction {
            stack_name: stack_name.clone(),
            environment: target.environment.clone(),
            template: ArtifactName::new("synth_output").at_path(format!("{}.template.json", stack_name)),
            parameter_overrides: BTreeMap::new(),
            admin_permissions: false,
        },
    ));

    if target.validate {
        stage = stage.with_action(
            Action::validate(
                format!("{}-validate", target.name),
                ValidateAction {
                    env_from_outputs: BTreeMap::from([(
                        "lb_addr".to_string(),
                        OutputRef {
                            action: deploy_name,
                            output: LOAD_BALANCER_URL_OUTPUT.to_string(),
                        },
                    )]),
                    check: Some(ReachabilityCheck {
                        env_var: "lb_addr".to_string(),
                        path: HEALTH_CHECK_PATH.to_string(),
                    }),
                },
            )
            .with_run_order(2),
        );
    }

    let mut stages = vec![stage];
    if target.post_approval {
        stages.push(
            Stage::new(format!("{}-approval", target.name))
                .with_action(Action::approval(format!("{}-approval", target.name))),
        );
    }
    stages
}

/// Source, prebuild and synth once, then deploy to every target in order.
pub fn delivery_pipeline(
    params: &BuildPipelineParameters,
    environments: &EnvironmentConfig,
) -> Result<PipelineDefinition, TopologyError> {
    let (cdk_source, app_source) = sources(params);

    let mut synth = Action::build(
        "Synth",
        infra_build_project(),
        "cdk_source_output",
        vec!["synth_output".into()],
    );
    if let ActionKind::Build(BuildAction { extra_inputs, .. }) = &mut synth.kind {
        extra_inputs.push("prebuild_output".into());
    }

    let mut builder = PipelineBuilder::new("TradeStorePipeline")
        .add_stage(
            Stage::new("source")
                .with_action(Action::source("cdk_source", cdk_source, "cdk_source_output"))
                .with_action(Action::source("app_source", app_source, "app_source_output")),
        )
        .add_stage(Stage::new("prebuild").with_action(Action::build(
            "Prebuild",
            prebuild_project(),
            "app_source_output",
            vec!["prebuild_output".into()],
        )))
        .add_stage(Stage::new("synth").with_action(synth));

    for target in &environments.targets {
        for stage in target_stages(target) {
            builder = builder.add_stage(stage);
        }
    }
    builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parameters::default_environments;
    use tradestore_core::pipeline::{ParameterValue, VariableRef};
    use tradestore_core::source::Trigger;

    #[test]
    fn test_build_pipeline_topology() {
        let pipeline =
            build_pipeline(&BuildPipelineParameters::default(), &default_environments()).unwrap();

        let stages: Vec<&str> = pipeline.stages.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(stages, vec!["source", "build", "approve", "deploy-to-ecs"]);

        // Each build reads its own repository's checkout.
        let (_, app_build) = pipeline.find_action("app_build").unwrap();
        assert_eq!(app_build.inputs()[0].as_str(), "app_source_output");
        let (_, cdk_build) = pipeline.find_action("cdk_build").unwrap();
        assert_eq!(cdk_build.inputs()[0].as_str(), "cdk_source_output");

        let (_, deploy) = pipeline.find_action("CFN_Deploy").unwrap();
        let ActionKind::Deploy(deploy) = &deploy.kind else {
            panic!("expected deploy action");
        };
        assert_eq!(deploy.template.path, PIPELINE_STACK_TEMPLATE);
        assert_eq!(deploy.template.artifact.as_str(), "cdk_build_output");
        assert_eq!(
            deploy.parameter_overrides["TradeStoreAppImageTag"],
            ParameterValue::Variable(VariableRef::new("app_build", "imageTag"))
        );

        assert_eq!(pipeline.triggers.len(), 2);
        assert!(pipeline.triggers.iter().all(|t| matches!(t, Trigger::Push { .. })));
    }

    #[test]
    fn test_delivery_pipeline_targets() {
        let pipeline =
            delivery_pipeline(&BuildPipelineParameters::default(), &default_environments())
                .unwrap();

        let stages: Vec<&str> = pipeline.stages.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(
            stages,
            vec!["source", "prebuild", "synth", "Devo", "PreProd", "PreProd-approval"]
        );

        let devo = pipeline.stage("Devo").unwrap();
        assert_eq!(devo.run_groups().len(), 2);
        assert!(pipeline.find_action("Devo-validate").is_some());
        assert!(pipeline.find_action("PreProd-validate").is_none());

        let (_, synth) = pipeline.find_action("Synth").unwrap();
        let inputs: Vec<&str> = synth.inputs().iter().map(|a| a.as_str()).collect();
        assert_eq!(inputs, vec!["cdk_source_output", "prebuild_output"]);
    }
}
