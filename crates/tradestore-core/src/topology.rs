//! Definition-time validation of a pipeline's stage and artifact topology.

use std::collections::{HashMap, HashSet};
use thiserror::Error;

use crate::pipeline::{ActionKind, PipelineDefinition};

/// A configuration error in a pipeline definition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopologyError {
    #[error("pipeline '{0}' has no stages")]
    Empty(String),

    #[error("duplicate stage name: {0}")]
    DuplicateStage(String),

    #[error("duplicate action name: {0}")]
    DuplicateAction(String),

    #[error("stage '{0}' has no actions")]
    EmptyStage(String),

    #[error("invalid {kind} name: '{name}'")]
    InvalidName { kind: &'static str, name: String },

    #[error("artifact '{artifact}' is produced by both '{first}' and '{second}'")]
    DuplicateArtifact {
        artifact: String,
        first: String,
        second: String,
    },

    #[error("action '{action}' consumes artifact '{artifact}' which no action produces")]
    DanglingArtifact { action: String, artifact: String },

    #[error(
        "action '{action}' consumes artifact '{artifact}' which is produced by '{producer}' in the same or a later stage"
    )]
    ArtifactNotYetProduced {
        action: String,
        artifact: String,
        producer: String,
    },

    #[error("actions '{first}' and '{second}' share variable namespace '{namespace}'")]
    DuplicateNamespace {
        namespace: String,
        first: String,
        second: String,
    },

    #[error("action '{action}' references {variable} which no earlier action exports")]
    UnknownVariable { action: String, variable: String },

    #[error("action '{action}' reads output '{output}' of '{deploy}' which is not an earlier deploy action")]
    UnknownOutput {
        action: String,
        deploy: String,
        output: String,
    },
}

/// Check a pipeline definition for configuration errors.
///
/// Every consumed artifact must be produced by an action in a strictly
/// earlier stage, and every variable reference must name a variable exported
/// by an action in a strictly earlier stage.
pub fn validate_topology(pipeline: &PipelineDefinition) -> Result<(), TopologyError> {
    if pipeline.stages.is_empty() {
        return Err(TopologyError::Empty(pipeline.name.clone()));
    }

    let mut stage_names = HashSet::new();
    let mut action_names = HashSet::new();
    for stage in &pipeline.stages {
        if !stage_names.insert(stage.name.as_str()) {
            return Err(TopologyError::DuplicateStage(stage.name.clone()));
        }
        if stage.actions.is_empty() {
            return Err(TopologyError::EmptyStage(stage.name.clone()));
        }
        for action in &stage.actions {
            check_name("action", &action.name, is_valid_identifier)?;
            check_name("namespace", action.namespace(), is_valid_identifier)?;
            for var in action.exported_variables() {
                check_name("variable", var, is_valid_variable_name)?;
            }
            if !action_names.insert(action.name.as_str()) {
                return Err(TopologyError::DuplicateAction(action.name.clone()));
            }
        }
    }

    // artifact name -> (stage index, producer)
    let mut producers: HashMap<&str, (usize, &str)> = HashMap::new();
    for (idx, action) in pipeline.actions() {
        for output in action.outputs() {
            if let Some((_, first)) = producers.insert(output.as_str(), (idx, action.name.as_str())) {
                return Err(TopologyError::DuplicateArtifact {
                    artifact: output.to_string(),
                    first: first.to_string(),
                    second: action.name.clone(),
                });
            }
        }
    }

    // namespace -> (stage index, exported variables)
    let mut namespaces: HashMap<&str, (usize, &[String])> = HashMap::new();
    let mut namespace_owners: HashMap<&str, &str> = HashMap::new();
    for (idx, action) in pipeline.actions() {
        if let Some(first) = namespace_owners.insert(action.namespace(), action.name.as_str()) {
            return Err(TopologyError::DuplicateNamespace {
                namespace: action.namespace().to_string(),
                first: first.to_string(),
                second: action.name.clone(),
            });
        }
        namespaces.insert(action.namespace(), (idx, action.exported_variables()));
    }

    for (idx, action) in pipeline.actions() {
        for input in action.inputs() {
            match producers.get(input.as_str()) {
                None => {
                    return Err(TopologyError::DanglingArtifact {
                        action: action.name.clone(),
                        artifact: input.to_string(),
                    });
                }
                Some((producer_idx, producer)) if *producer_idx >= idx => {
                    return Err(TopologyError::ArtifactNotYetProduced {
                        action: action.name.clone(),
                        artifact: input.to_string(),
                        producer: producer.to_string(),
                    });
                }
                Some(_) => {}
            }
        }

        for reference in action.variable_refs() {
            let exported = namespaces
                .get(reference.namespace.as_str())
                .is_some_and(|(producer_idx, vars)| {
                    *producer_idx < idx && vars.contains(&reference.name)
                });
            if !exported {
                return Err(TopologyError::UnknownVariable {
                    action: action.name.clone(),
                    variable: reference.to_string(),
                });
            }
        }

        if let ActionKind::Validate(validate) = &action.kind {
            for output in validate.env_from_outputs.values() {
                let deployed_before = pipeline
                    .find_action(&output.action)
                    .is_some_and(|(source_idx, source)| {
                        matches!(source.kind, ActionKind::Deploy(_))
                            && (source_idx < idx
                                || (source_idx == idx && source.run_order < action.run_order))
                    });
                if !deployed_before {
                    return Err(TopologyError::UnknownOutput {
                        action: action.name.clone(),
                        deploy: output.action.clone(),
                        output: output.output.clone(),
                    });
                }
            }
        }
    }

    Ok(())
}

fn check_name(
    kind: &'static str,
    name: &str,
    valid: fn(&str) -> bool,
) -> Result<(), TopologyError> {
    if valid(name) {
        Ok(())
    } else {
        Err(TopologyError::InvalidName {
            kind,
            name: name.to_string(),
        })
    }
}

fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn is_valid_variable_name(name: &str) -> bool {
    let mut chars = name.chars();
    chars.next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::ArtifactName;
    use crate::environment::Environment;
    use crate::executor::{BuildEnvironment, BuildProject, BuildSpec, PhaseKind};
    use crate::pipeline::{
        Action, DeployAction, OutputRef, ParameterValue, PipelineBuilder, ReachabilityCheck,
        Stage, ValidateAction,
    };
    use crate::source::GitHubSource;
    use std::collections::BTreeMap;

    fn source(name: &str, output: &str) -> Action {
        Action::source(
            name,
            GitHubSource::new("cvlsrivatsa", "TradeStoreApp", "main", "github-token"),
            output,
        )
    }

    fn build(name: &str, input: &str, output: &str, exports: &[&str]) -> Action {
        let mut spec = BuildSpec::new().phase(PhaseKind::Build, ["make"]);
        for e in exports {
            spec = spec.export(*e);
        }
        let project = BuildProject::new(
            name,
            BuildEnvironment {
                image: "amazonlinux:2".into(),
                privileged: false,
            },
            spec,
        );
        Action::build(name, project, input, vec![ArtifactName::new(output)])
    }

    fn deploy(name: &str, template: &str, tag: ParameterValue) -> Action {
        let mut overrides = BTreeMap::new();
        overrides.insert("tagParam".to_string(), tag);
        Action::deploy(
            name,
            DeployAction {
                stack_name: "WebService".into(),
                environment: Environment::new("111111111111", "us-east-1"),
                template: ArtifactName::new(template).at_path("stack.template.json"),
                parameter_overrides: overrides,
                admin_permissions: true,
            },
        )
    }

    fn image_tag() -> ParameterValue {
        ParameterValue::Variable(crate::pipeline::VariableRef::new("app_build", "imageTag"))
    }

    #[test]
    fn test_valid_pipeline() {
        let pipeline = PipelineBuilder::new("p")
            .add_stage(Stage::new("source").with_action(source("app_source", "app_src")))
            .add_stage(Stage::new("build").with_action(build(
                "app_build",
                "app_src",
                "app_out",
                &["imageTag"],
            )))
            .add_stage(Stage::new("approve").with_action(Action::approval("approve")))
            .add_stage(Stage::new("deploy").with_action(deploy("deploy", "app_out", image_tag())))
            .build()
            .unwrap();
        assert_eq!(pipeline.stages.len(), 4);
        assert_eq!(pipeline.triggers.len(), 1);
    }

    #[test]
    fn test_empty_pipeline_rejected() {
        let err = PipelineBuilder::new("p").build().unwrap_err();
        assert_eq!(err, TopologyError::Empty("p".into()));
    }

    #[test]
    fn test_dangling_artifact() {
        let err = PipelineBuilder::new("p")
            .add_stage(Stage::new("build").with_action(build("b", "missing", "out", &[])))
            .build()
            .unwrap_err();
        assert!(matches!(err, TopologyError::DanglingArtifact { artifact, .. } if artifact == "missing"));
    }

    #[test]
    fn test_same_stage_artifact_rejected() {
        let err = PipelineBuilder::new("p")
            .add_stage(
                Stage::new("one")
                    .with_action(source("s", "src"))
                    .with_action(build("b", "src", "out", &[])),
            )
            .build()
            .unwrap_err();
        assert!(matches!(err, TopologyError::ArtifactNotYetProduced { producer, .. } if producer == "s"));
    }

    #[test]
    fn test_duplicate_artifact_rejected() {
        let err = PipelineBuilder::new("p")
            .add_stage(
                Stage::new("source")
                    .with_action(source("a", "src"))
                    .with_action(source("b", "src")),
            )
            .build()
            .unwrap_err();
        assert!(matches!(err, TopologyError::DuplicateArtifact { .. }));
    }

    #[test]
    fn test_variable_must_be_exported_earlier() {
        // Not exported at all.
        let err = PipelineBuilder::new("p")
            .add_stage(Stage::new("source").with_action(source("s", "src")))
            .add_stage(Stage::new("build").with_action(build("app_build", "src", "out", &[])))
            .add_stage(Stage::new("deploy").with_action(deploy("d", "out", image_tag())))
            .build()
            .unwrap_err();
        assert!(
            matches!(err, TopologyError::UnknownVariable { variable, .. } if variable == "#{app_build.imageTag}")
        );

        // Exported, but in the same stage as the consumer.
        let err = PipelineBuilder::new("p")
            .add_stage(Stage::new("source").with_action(source("s", "src")))
            .add_stage(Stage::new("build").with_action(build("other", "src", "tpl", &[])))
            .add_stage(
                Stage::new("both")
                    .with_action(build("app_build", "src", "out", &["imageTag"]))
                    .with_action(deploy("d", "tpl", image_tag())),
            )
            .build()
            .unwrap_err();
        assert!(matches!(err, TopologyError::UnknownVariable { .. }));
    }

    #[test]
    fn test_template_parameter_refs_checked() {
        let err = PipelineBuilder::new("p")
            .add_stage(Stage::new("source").with_action(source("s", "src")))
            .add_stage(Stage::new("build").with_action(build("b", "src", "out", &["imageTag"])))
            .add_stage(Stage::new("deploy").with_action(deploy(
                "d",
                "out",
                ParameterValue::Template("v-#{b.commit}".into()),
            )))
            .build()
            .unwrap_err();
        assert!(matches!(err, TopologyError::UnknownVariable { .. }));
    }

    #[test]
    fn test_duplicate_names() {
        let err = PipelineBuilder::new("p")
            .add_stage(Stage::new("a").with_action(Action::approval("x")))
            .add_stage(Stage::new("a").with_action(Action::approval("y")))
            .build()
            .unwrap_err();
        assert_eq!(err, TopologyError::DuplicateStage("a".into()));

        let err = PipelineBuilder::new("p")
            .add_stage(Stage::new("a").with_action(Action::approval("x")))
            .add_stage(Stage::new("b").with_action(Action::approval("x")))
            .build()
            .unwrap_err();
        assert_eq!(err, TopologyError::DuplicateAction("x".into()));
    }

    #[test]
    fn test_shared_namespace_rejected() {
        let mut tests = build("app_tests", "app_src", "test_out", &["imageTag"]);
        if let ActionKind::Build(b) = &mut tests.kind {
            b.namespace = Some("app_build".into());
        }
        let err = PipelineBuilder::new("p")
            .add_stage(Stage::new("source").with_action(source("app_source", "app_src")))
            .add_stage(
                Stage::new("build")
                    .with_action(build("app_build", "app_src", "app_out", &["imageTag"]))
                    .with_action(tests),
            )
            .build()
            .unwrap_err();
        assert_eq!(
            err,
            TopologyError::DuplicateNamespace {
                namespace: "app_build".into(),
                first: "app_build".into(),
                second: "app_tests".into(),
            }
        );
    }

    #[test]
    fn test_empty_stage_and_invalid_name() {
        let err = PipelineBuilder::new("p")
            .add_stage(Stage::new("a"))
            .build()
            .unwrap_err();
        assert_eq!(err, TopologyError::EmptyStage("a".into()));

        let err = PipelineBuilder::new("p")
            .add_stage(Stage::new("a").with_action(Action::approval("1st")))
            .build()
            .unwrap_err();
        assert!(matches!(err, TopologyError::InvalidName { kind: "action", .. }));
    }

    #[test]
    fn test_validate_reads_earlier_deploy() {
        let validate = |run_order| {
            let mut env = BTreeMap::new();
            env.insert(
                "lb_addr".to_string(),
                OutputRef {
                    action: "d".into(),
                    output: "loadBalancerUrl".into(),
                },
            );
            Action::validate(
                "validate",
                ValidateAction {
                    env_from_outputs: env,
                    check: Some(ReachabilityCheck {
                        env_var: "lb_addr".into(),
                        path: "/health".into(),
                    }),
                },
            )
            .with_run_order(run_order)
        };
        let pipeline = |run_order| {
            PipelineBuilder::new("p")
                .add_stage(Stage::new("source").with_action(source("s", "src")))
                .add_stage(
                    Stage::new("Devo")
                        .with_action(deploy("d", "src", ParameterValue::Literal("latest".into())))
                        .with_action(validate(run_order)),
                )
                .build()
        };

        assert!(pipeline(2).is_ok());
        assert!(matches!(
            pipeline(1).unwrap_err(),
            TopologyError::UnknownOutput { .. }
        ));
    }
}
