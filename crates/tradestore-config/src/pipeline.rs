//! Pipeline configuration parsing.
//!
//! ```kdl
//! pipeline "TradeStoreBuild"
//!
//! stage "source" {
//!     source "app_source" owner="cvlsrivatsa" repo="TradeStoreApp" branch="main" \
//!         token-secret="github-token" output="app_src"
//! }
//!
//! stage "build" {
//!     build "app_build" input="app_src" output="app_out" {
//!         image "aws/codebuild/amazonlinux2-x86_64-standard:4.0"
//!         privileged #true
//!         phase "build" {
//!             run "docker build -t $ecr_repo_uri:$tag ."
//!         }
//!         export "imageTag"
//!         artifacts "imagedefinitions.json"
//!     }
//! }
//!
//! stage "deploy" {
//!     deploy "deploy" stack="WebService" template="app_out::stack.template.json" \
//!         account="123456789012" region="us-east-1" {
//!         parameter "tagParam" variable="#{app_build.imageTag}"
//!     }
//! }
//! ```

use kdl::{KdlDocument, KdlNode};
use std::collections::BTreeMap;
use std::path::Path;
use tradestore_core::Environment;
use tradestore_core::artifact::{ArtifactName, ArtifactPath};
use tradestore_core::executor::{BuildEnvironment, BuildProject, BuildSpec, CacheMode, PhaseKind};
use tradestore_core::pipeline::{
    Action, ActionKind, BuildAction, DeployAction, OutputRef, ParameterValue, PipelineBuilder,
    PipelineDefinition, ReachabilityCheck, Stage, ValidateAction, VariableRef,
};
use tradestore_core::source::{GitHubSource, Trigger};

use crate::nodes::{
    get_all_string_args, get_bool_prop, get_first_string_arg, get_string_list_prop,
    get_string_prop, get_u32_prop, require_string_prop,
};
use crate::{ConfigError, ConfigResult};

/// Parse a pipeline definition from KDL text and validate its topology.
pub fn parse_pipeline(kdl: &str) -> ConfigResult<PipelineDefinition> {
    let doc: KdlDocument = kdl.parse()?;

    let mut name = String::new();
    let mut triggers = Vec::new();
    let mut stages = Vec::new();

    for node in doc.nodes() {
        match node.name().value() {
            "pipeline" => {
                name = get_first_string_arg(node)
                    .ok_or_else(|| ConfigError::MissingField("pipeline name".to_string()))?;
            }
            "on" => {
                triggers.push(parse_trigger(node)?);
            }
            "stage" => {
                stages.push(parse_stage(node)?);
            }
            _ => {} // Ignore unknown nodes
        }
    }

    if name.is_empty() {
        return Err(ConfigError::MissingField("pipeline name".to_string()));
    }

    let mut builder = PipelineBuilder::new(name);
    for trigger in triggers {
        builder = builder.trigger(trigger);
    }
    for stage in stages {
        builder = builder.add_stage(stage);
    }
    Ok(builder.build()?)
}

/// Read and parse a pipeline definition file.
pub fn load_pipeline(path: impl AsRef<Path>) -> ConfigResult<PipelineDefinition> {
    let text = std::fs::read_to_string(path)?;
    parse_pipeline(&text)
}

fn parse_trigger(node: &KdlNode) -> ConfigResult<Trigger> {
    let trigger_type = get_first_string_arg(node).unwrap_or_default();

    match trigger_type.as_str() {
        "push" => {
            let repository = require_string_prop(node, "repository", "push trigger")?;
            let branches = get_string_list_prop(node, "branches");
            Ok(Trigger::Push {
                repository,
                branches: if branches.is_empty() {
                    vec!["*".to_string()]
                } else {
                    branches
                },
            })
        }
        "manual" | "" => Ok(Trigger::Manual),
        _ => Err(ConfigError::InvalidValue {
            field: "trigger type".to_string(),
            message: format!("unknown trigger type: {}", trigger_type),
        }),
    }
}

fn parse_stage(node: &KdlNode) -> ConfigResult<Stage> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("stage name".to_string()))?;

    let mut stage = Stage::new(name);
    if let Some(children) = node.children() {
        for child in children.nodes() {
            let kind = child.name().value();
            let action_name = get_first_string_arg(child)
                .ok_or_else(|| ConfigError::MissingField(format!("{} action name", kind)))?;

            let action = match kind {
                "source" => parse_source(child, action_name)?,
                "build" => parse_build(child, action_name)?,
                "approval" => {
                    let mut action = Action::approval(action_name);
                    action.kind = ActionKind::ManualApproval {
                        notify: get_string_prop(child, "notify"),
                    };
                    action
                }
                "deploy" => parse_deploy(child, action_name)?,
                "validate" => parse_validate(child, action_name)?,
                other => {
                    return Err(ConfigError::InvalidValue {
                        field: format!("stage '{}'", stage.name),
                        message: format!("unknown action type: {}", other),
                    });
                }
            };

            let run_order = get_u32_prop(child, "run-order")?.unwrap_or(1);
            stage = stage.with_action(action.with_run_order(run_order));
        }
    }

    Ok(stage)
}

fn parse_source(node: &KdlNode, name: String) -> ConfigResult<Action> {
    let mut source = GitHubSource::new(
        require_string_prop(node, "owner", &name)?,
        require_string_prop(node, "repo", &name)?,
        require_string_prop(node, "branch", &name)?,
        require_string_prop(node, "token-secret", &name)?,
    );
    source.webhook = get_bool_prop(node, "webhook").unwrap_or(true);
    let output = require_string_prop(node, "output", &name)?;
    Ok(Action::source(name, source, output))
}

fn parse_build(node: &KdlNode, name: String) -> ConfigResult<Action> {
    let input = require_string_prop(node, "input", &name)?;
    let outputs: Vec<ArtifactName> = get_string_list_prop(node, "output")
        .into_iter()
        .map(ArtifactName::from)
        .collect();
    let extra_inputs: Vec<ArtifactName> = get_string_list_prop(node, "extra-input")
        .into_iter()
        .map(ArtifactName::from)
        .collect();

    let mut image = String::new();
    let mut privileged = false;
    let mut env = BTreeMap::new();
    let mut cache = Vec::new();
    let mut spec = BuildSpec::new();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "image" => {
                    image = get_first_string_arg(child).unwrap_or_default();
                }
                "privileged" => {
                    privileged = child
                        .entries()
                        .first()
                        .and_then(|e| e.value().as_bool())
                        .unwrap_or(true);
                }
                "env" => {
                    let args = get_all_string_args(child);
                    match args.as_slice() {
                        [key, value] => {
                            env.insert(key.clone(), value.clone());
                        }
                        _ => {
                            return Err(ConfigError::InvalidValue {
                                field: format!("env for build '{}'", name),
                                message: "expected a name and a value".to_string(),
                            });
                        }
                    }
                }
                "cache" => {
                    for mode in get_all_string_args(child) {
                        cache.push(parse_cache_mode(&mode)?);
                    }
                }
                "phase" => {
                    let kind = parse_phase_kind(&get_first_string_arg(child).unwrap_or_default())?;
                    let commands: Vec<String> = child
                        .children()
                        .map(|c| {
                            c.nodes()
                                .iter()
                                .filter(|n| n.name().value() == "run")
                                .filter_map(get_first_string_arg)
                                .collect()
                        })
                        .unwrap_or_default();
                    spec = spec.phase(kind, commands);
                }
                "export" => {
                    for var in get_all_string_args(child) {
                        spec = spec.export(var);
                    }
                }
                "artifacts" => {
                    let base = get_string_prop(child, "base-directory");
                    spec = spec.artifacts(base.as_deref(), get_all_string_args(child));
                }
                _ => {}
            }
        }
    }

    if image.is_empty() {
        return Err(ConfigError::MissingField(format!(
            "image for build '{}'",
            name
        )));
    }
    if !outputs.is_empty() && spec.artifacts.files.is_empty() {
        return Err(ConfigError::MissingField(format!(
            "artifacts for build '{}'",
            name
        )));
    }

    let mut project = BuildProject::new(
        name.clone(),
        BuildEnvironment { image, privileged },
        spec,
    );
    project.env = env;
    project.cache = cache;

    let namespace = get_string_prop(node, "namespace");
    let mut action = Action::build(name, project, input, outputs);
    if let ActionKind::Build(BuildAction {
        extra_inputs: inputs,
        namespace: ns,
        ..
    }) = &mut action.kind
    {
        *inputs = extra_inputs;
        *ns = namespace;
    }
    Ok(action)
}

fn parse_deploy(node: &KdlNode, name: String) -> ConfigResult<Action> {
    let stack_name = require_string_prop(node, "stack", &name)?;
    let template = parse_artifact_path(&require_string_prop(node, "template", &name)?)?;
    let environment = Environment::new(
        require_string_prop(node, "account", &name)?,
        require_string_prop(node, "region", &name)?,
    );
    let admin_permissions = get_bool_prop(node, "admin-permissions").unwrap_or(false);

    let mut parameter_overrides = BTreeMap::new();
    if let Some(children) = node.children() {
        for child in children.nodes().iter().filter(|c| c.name().value() == "parameter") {
            let param = get_first_string_arg(child)
                .ok_or_else(|| ConfigError::MissingField(format!("parameter name in '{}'", name)))?;
            let value = parse_parameter_value(child, &param)?;
            if parameter_overrides.insert(param.clone(), value).is_some() {
                return Err(ConfigError::Duplicate(format!(
                    "parameter '{}' in '{}'",
                    param, name
                )));
            }
        }
    }

    Ok(Action::deploy(
        name,
        DeployAction {
            stack_name,
            environment,
            template,
            parameter_overrides,
            admin_permissions,
        },
    ))
}

fn parse_parameter_value(node: &KdlNode, param: &str) -> ConfigResult<ParameterValue> {
    if let Some(variable) = get_string_prop(node, "variable") {
        let reference: VariableRef =
            variable
                .parse()
                .map_err(|message| ConfigError::InvalidValue {
                    field: format!("parameter '{}'", param),
                    message,
                })?;
        return Ok(ParameterValue::Variable(reference));
    }
    if let Some(template) = get_string_prop(node, "template") {
        return Ok(ParameterValue::Template(template));
    }
    if let Some(value) = get_string_prop(node, "value") {
        return Ok(ParameterValue::Literal(value));
    }
    Err(ConfigError::MissingField(format!(
        "value, variable or template for parameter '{}'",
        param
    )))
}

fn parse_validate(node: &KdlNode, name: String) -> ConfigResult<Action> {
    let mut env_from_outputs = BTreeMap::new();
    let mut check = None;

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "env" => {
                    let var = get_first_string_arg(child)
                        .ok_or_else(|| ConfigError::MissingField(format!("env name in '{}'", name)))?;
                    let output = OutputRef {
                        action: require_string_prop(child, "from", &name)?,
                        output: require_string_prop(child, "output", &name)?,
                    };
                    env_from_outputs.insert(var, output);
                }
                "check" => {
                    let env_var = get_first_string_arg(child).ok_or_else(|| {
                        ConfigError::MissingField(format!("check variable in '{}'", name))
                    })?;
                    if !env_from_outputs.contains_key(&env_var) {
                        return Err(ConfigError::InvalidValue {
                            field: format!("check in '{}'", name),
                            message: format!("'{}' is not bound by an env node", env_var),
                        });
                    }
                    check = Some(ReachabilityCheck {
                        env_var,
                        path: get_string_prop(child, "path").unwrap_or_else(|| "/".to_string()),
                    });
                }
                _ => {}
            }
        }
    }

    Ok(Action::validate(
        name,
        ValidateAction {
            env_from_outputs,
            check,
        },
    ))
}

fn parse_artifact_path(value: &str) -> ConfigResult<ArtifactPath> {
    match value.split_once("::") {
        Some((artifact, path)) if !artifact.is_empty() && !path.is_empty() => {
            Ok(ArtifactName::from(artifact).at_path(path))
        }
        _ => Err(ConfigError::InvalidValue {
            field: "template".to_string(),
            message: format!("expected '<artifact>::<path>', got '{}'", value),
        }),
    }
}

fn parse_phase_kind(value: &str) -> ConfigResult<PhaseKind> {
    match value {
        "install" => Ok(PhaseKind::Install),
        "pre_build" | "pre-build" => Ok(PhaseKind::PreBuild),
        "build" => Ok(PhaseKind::Build),
        "post_build" | "post-build" => Ok(PhaseKind::PostBuild),
        other => Err(ConfigError::InvalidValue {
            field: "phase".to_string(),
            message: format!("unknown phase: {}", other),
        }),
    }
}

fn parse_cache_mode(value: &str) -> ConfigResult<CacheMode> {
    match value {
        "docker_layer" | "docker-layer" => Ok(CacheMode::DockerLayer),
        "source" => Ok(CacheMode::Source),
        "custom" => Ok(CacheMode::Custom),
        other => Err(ConfigError::InvalidValue {
            field: "cache".to_string(),
            message: format!("unknown cache mode: {}", other),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tradestore_core::topology::TopologyError;

    const BUILD_PIPELINE: &str = r##"
        pipeline "TradeStoreBuild"

        on "manual"

        stage "source" {
            source "github_app_source" owner="cvlsrivatsa" repo="TradeStoreApp" branch="main" token-secret="github-token" output="app_source"
            source "github_cdk_source" owner="cvlsrivatsa" repo="TradeStoreCdk" branch="main" token-secret="github-token" output="cdk_source" webhook=#false
        }

        stage "build" {
            build "cdk_build" input="cdk_source" output="cdk_output" {
                image "aws/codebuild/amazonlinux2-x86_64-standard:4.0"
                phase "install" {
                    run "npm install"
                }
                phase "build" {
                    run "tradestore synth --out cdk.out"
                }
                artifacts "**/*" base-directory="cdk.out"
            }
            build "app_build" input="app_source" output="app_output" {
                image "aws/codebuild/amazonlinux2-x86_64-standard:4.0"
                privileged #true
                env "ecr_repo_uri" "191296374569.dkr.ecr.us-east-1.amazonaws.com/trade-store-app"
                cache "docker_layer" "custom"
                phase "post_build" {
                    run "export imageTag=$tag"
                }
                phase "pre_build" {
                    run "export tag=latest"
                }
                export "imageTag"
                artifacts "imagedefinitions.json"
            }
        }

        stage "approve" {
            approval "approve" notify="ops@example.com"
        }

        stage "deploy-to-ecs" {
            deploy "CFN_Deploy" stack="SampleEcsStackDeployedFromCodePipeline" template="cdk_output::EcsStackDeployedInPipeline.template.json" account="191296374569" region="us-east-1" admin-permissions=#true {
                parameter "tagParam" variable="#{app_build.imageTag}"
            }
            validate "smoke" run-order=2 {
                env "lb_addr" from="CFN_Deploy" output="loadBalancerUrl"
                check "lb_addr" path="/health"
            }
        }
    "##;

    #[test]
    fn test_parse_build_pipeline() {
        let pipeline = parse_pipeline(BUILD_PIPELINE).unwrap();
        assert_eq!(pipeline.name, "TradeStoreBuild");
        assert_eq!(pipeline.stages.len(), 4);
        // Manual plus the webhook of the app source.
        assert_eq!(pipeline.triggers.len(), 2);

        let (_, app_build) = pipeline.find_action("app_build").unwrap();
        let ActionKind::Build(build) = &app_build.kind else {
            panic!("expected build action");
        };
        assert!(build.project.environment.privileged);
        assert_eq!(build.project.cache.len(), 2);
        assert_eq!(build.project.spec.phases[0].kind, PhaseKind::PreBuild);
        assert_eq!(build.project.spec.exported_variables, vec!["imageTag"]);

        let (_, cdk_build) = pipeline.find_action("cdk_build").unwrap();
        let ActionKind::Build(build) = &cdk_build.kind else {
            panic!("expected build action");
        };
        assert_eq!(build.project.spec.artifacts.base_directory.as_deref(), Some("cdk.out"));

        let (stage_idx, deploy) = pipeline.find_action("CFN_Deploy").unwrap();
        assert_eq!(stage_idx, 3);
        assert_eq!(
            deploy.variable_refs(),
            vec![VariableRef::new("app_build", "imageTag")]
        );

        let (_, smoke) = pipeline.find_action("smoke").unwrap();
        assert_eq!(smoke.run_order, 2);
    }

    #[test]
    fn test_dangling_artifact_is_config_error() {
        let kdl = r#"
            pipeline "p"
            stage "build" {
                build "b" input="nowhere" output="out" {
                    image "alpine"
                    artifacts "**/*"
                }
            }
        "#;
        assert!(matches!(
            parse_pipeline(kdl),
            Err(ConfigError::Topology(TopologyError::DanglingArtifact { .. }))
        ));
    }

    #[test]
    fn test_unknown_variable_is_config_error() {
        let kdl = BUILD_PIPELINE.replace("#{app_build.imageTag}", "#{app_build.commit}");
        assert!(matches!(
            parse_pipeline(&kdl),
            Err(ConfigError::Topology(TopologyError::UnknownVariable { .. }))
        ));
    }

    #[test]
    fn test_missing_image() {
        let kdl = r#"
            pipeline "p"
            stage "source" {
                source "s" owner="o" repo="r" branch="main" token-secret="t" output="src"
            }
            stage "build" {
                build "b" input="src" {
                    phase "build" {
                        run "make"
                    }
                }
            }
        "#;
        assert!(matches!(parse_pipeline(kdl), Err(ConfigError::MissingField(_))));
    }

    #[test]
    fn test_bad_template_path() {
        assert!(parse_artifact_path("no-separator").is_err());
        let path = parse_artifact_path("cdk_output::a/b.json").unwrap();
        assert_eq!(path.artifact.as_str(), "cdk_output");
        assert_eq!(path.path, "a/b.json");
    }

    #[test]
    fn test_unknown_action_type() {
        let kdl = r#"
            pipeline "p"
            stage "s" {
                lambda "l"
            }
        "#;
        assert!(matches!(
            parse_pipeline(kdl),
            Err(ConfigError::InvalidValue { .. })
        ));
    }
}
