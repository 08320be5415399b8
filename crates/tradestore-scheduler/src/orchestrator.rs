//! Pipeline orchestrator - runs a pipeline's stages in order.
//!
//! Stages run strictly one after another. Inside a stage, actions with the
//! same run order run concurrently and lower run orders finish before higher
//! ones start. The first failed action fails its stage, and every later stage
//! is skipped.

use futures::StreamExt;
use futures::future::join_all;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tradestore_config::{VariableContext, VariableContextBuilder};
use tradestore_core::ResourceId;
use tradestore_core::artifact::ArtifactStore;
use tradestore_core::deployer::{Deployer, StackDeploymentSpec};
use tradestore_core::executor::{Executor, JobSpec, JobStatus, LogLine, missing_exports};
use tradestore_core::pipeline::{
    Action, ActionKind, ActionResult, ActionStatus, BuildAction, DeployAction, FailureReason,
    PipelineDefinition, PipelineRun, PipelineStatus, SourceAction, StageStatus, ValidateAction,
};
use tradestore_core::secret::SecretStore;
use tradestore_core::source::Trigger;
use tradestore_executor::write_bundle;

use crate::approval::{ApprovalDecision, ApprovalGate, ApprovalRequest};
use crate::probe::{ReachabilityProbe, probe_url};
use crate::source::SourceFetcher;

/// Event emitted during pipeline execution.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    RunStarted { run_id: ResourceId, pipeline: String },
    StageStarted { stage: String },
    ActionStarted { stage: String, action: String },
    ActionLog { action: String, line: LogLine },
    ActionCompleted { stage: String, action: String, status: ActionStatus },
    AwaitingApproval { stage: String, action: String },
    StageCompleted { stage: String, status: StageStatus },
    RunCompleted { status: PipelineStatus },
}

/// Backends a run talks to.
#[derive(Clone)]
pub struct Services {
    pub executor: Arc<dyn Executor>,
    pub deployer: Arc<dyn Deployer>,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub secrets: Arc<dyn SecretStore>,
    pub approvals: Arc<dyn ApprovalGate>,
    pub sources: Arc<dyn SourceFetcher>,
    pub probe: Arc<dyn ReachabilityProbe>,
}

/// Orchestrates the execution of a pipeline.
pub struct PipelineOrchestrator {
    services: Services,
    /// Directory build workspaces are created in
    workspace_root: Option<PathBuf>,
}

/// What a finished action hands to later ones.
#[derive(Default)]
struct ActionOutput {
    exports: Option<(String, BTreeMap<String, String>)>,
    stack_outputs: Option<BTreeMap<String, String>>,
}

/// Read-only view of the run an action executes in.
struct RunScope<'a> {
    run_id: ResourceId,
    pipeline: &'a str,
    stage: &'a str,
    variables: &'a VariableContext,
    stack_outputs: &'a BTreeMap<String, BTreeMap<String, String>>,
    tx: &'a mpsc::Sender<PipelineEvent>,
}

impl PipelineOrchestrator {
    pub fn new(services: Services) -> Self {
        Self {
            services,
            workspace_root: None,
        }
    }

    /// Create build workspaces under `root` instead of the system temp dir.
    pub fn with_workspace_root(services: Services, root: PathBuf) -> Self {
        Self {
            services,
            workspace_root: Some(root),
        }
    }

    /// Execute a pipeline, returning a channel of events and a handle to get
    /// the finished run record.
    pub fn execute(
        &self,
        definition: &PipelineDefinition,
        trigger: Trigger,
    ) -> (
        mpsc::Receiver<PipelineEvent>,
        tokio::task::JoinHandle<PipelineRun>,
    ) {
        let (tx, rx) = mpsc::channel(100);
        let runner = Runner {
            services: self.services.clone(),
            workspace_root: self.workspace_root.clone(),
        };
        let definition = definition.clone();

        let handle = tokio::spawn(async move { runner.run(definition, trigger, tx).await });

        (rx, handle)
    }
}

fn trigger_label(trigger: &Trigger) -> String {
    match trigger {
        Trigger::Push { repository, .. } => format!("push:{}", repository),
        Trigger::Manual => "manual".to_string(),
    }
}

struct Runner {
    services: Services,
    workspace_root: Option<PathBuf>,
}

impl Runner {
    async fn run(
        self,
        definition: PipelineDefinition,
        trigger: Trigger,
        tx: mpsc::Sender<PipelineEvent>,
    ) -> PipelineRun {
        let mut run = PipelineRun::new(&definition, trigger);
        run.status = PipelineStatus::Running;
        run.started_at = Some(chrono::Utc::now());
        info!(run = %run.id, pipeline = %definition.name, "Pipeline run started");
        let _ = tx
            .send(PipelineEvent::RunStarted {
                run_id: run.id,
                pipeline: definition.name.clone(),
            })
            .await;

        let mut variables = self.variable_context(&definition, &run).await;
        let mut stack_outputs: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
        let mut failure: Option<(String, FailureReason)> = None;

        for (idx, stage) in definition.stages.iter().enumerate() {
            if let Some((failed_stage, _)) = &failure {
                info!(stage = %stage.name, "Skipping stage after failure");
                run.stages[idx].status = StageStatus::Skipped {
                    reason: format!("stage '{}' failed", failed_stage),
                };
                continue;
            }

            variables.set_stage(&stage.name, idx);
            run.stages[idx].status = StageStatus::Running;
            run.stages[idx].started_at = Some(chrono::Utc::now());
            let _ = tx
                .send(PipelineEvent::StageStarted {
                    stage: stage.name.clone(),
                })
                .await;

            for group in stage.run_groups() {
                if group.iter().any(|a| a.is_approval()) {
                    run.status = PipelineStatus::WaitingApproval {
                        stage: stage.name.clone(),
                    };
                    run.stages[idx].status = StageStatus::WaitingApproval;
                }

                let scope = RunScope {
                    run_id: run.id,
                    pipeline: &definition.name,
                    stage: &stage.name,
                    variables: &variables,
                    stack_outputs: &stack_outputs,
                    tx: &tx,
                };
                let outcomes = join_all(group.iter().map(|action| self.run_action(action, &scope))).await;

                run.status = PipelineStatus::Running;
                run.stages[idx].status = StageStatus::Running;

                for (action, (result, output)) in group.iter().zip(outcomes) {
                    if let ActionStatus::Failed { reason } = &result.status {
                        if failure.is_none() {
                            failure = Some((stage.name.clone(), reason.clone()));
                        }
                    }
                    if let Some((namespace, exports)) = output.exports {
                        run.variables
                            .entry(namespace.clone())
                            .or_default()
                            .extend(exports.clone());
                        variables.set_exports(&namespace, exports);
                    }
                    if let Some(outputs) = output.stack_outputs {
                        stack_outputs.insert(action.name.clone(), outputs);
                    }
                    run.stages[idx].actions.push(result);
                }

                if failure.is_some() {
                    break;
                }
            }

            let status = match &failure {
                Some((_, reason)) => {
                    error!(stage = %stage.name, reason = %reason, "Stage failed");
                    StageStatus::Failed {
                        message: reason.to_string(),
                    }
                }
                None => {
                    info!(stage = %stage.name, "Stage completed successfully");
                    StageStatus::Succeeded
                }
            };
            run.stages[idx].status = status.clone();
            run.stages[idx].finished_at = Some(chrono::Utc::now());
            let _ = tx
                .send(PipelineEvent::StageCompleted {
                    stage: stage.name.clone(),
                    status,
                })
                .await;
        }

        match self.services.artifacts.discard(run.id).await {
            Ok(count) => info!(run = %run.id, count, "Discarded run artifacts"),
            Err(e) => warn!(run = %run.id, error = %e, "Failed to discard run artifacts"),
        }

        run.status = match failure {
            Some((stage, reason)) => PipelineStatus::Failed { stage, reason },
            None => PipelineStatus::Succeeded,
        };
        run.finished_at = Some(chrono::Utc::now());
        info!(run = %run.id, status = ?run.status, "Pipeline run finished");
        let _ = tx
            .send(PipelineEvent::RunCompleted {
                status: run.status.clone(),
            })
            .await;

        run
    }

    /// Process values and the secrets the run's source actions use, so they
    /// can be masked in logs.
    async fn variable_context(
        &self,
        definition: &PipelineDefinition,
        run: &PipelineRun,
    ) -> VariableContext {
        let mut builder = VariableContextBuilder::new()
            .with_pipeline(&definition.name)
            .with_run(run.id.to_string(), trigger_label(&run.trigger));

        for (_, action) in definition.actions() {
            let ActionKind::Source(source) = &action.kind else {
                continue;
            };
            let name = &source.source.token_secret;
            if let Ok(value) = self.services.secrets.get(name).await {
                if let Some(token) = value.as_string() {
                    builder = builder.with_secret(name.clone(), token);
                }
            }
        }
        builder.build()
    }

    async fn run_action(&self, action: &Action, scope: &RunScope<'_>) -> (ActionResult, ActionOutput) {
        let started_at = chrono::Utc::now();
        info!(stage = %scope.stage, action = %action.name, "Action started");
        let _ = scope
            .tx
            .send(PipelineEvent::ActionStarted {
                stage: scope.stage.to_string(),
                action: action.name.clone(),
            })
            .await;

        let outcome = match &action.kind {
            ActionKind::Source(source) => self.run_source(action, source, scope).await,
            ActionKind::Build(build) => self.run_build(action, build, scope).await,
            ActionKind::ManualApproval { notify } => {
                self.run_approval(action, notify.clone(), scope).await
            }
            ActionKind::Deploy(deploy) => self.run_deploy(action, deploy, scope).await,
            ActionKind::Validate(validate) => self.run_validate(action, validate, scope).await,
        };

        let (status, output) = match outcome {
            Ok(output) => {
                info!(action = %action.name, "Action succeeded");
                (ActionStatus::Succeeded, output)
            }
            Err(reason) => {
                error!(action = %action.name, reason = %reason, "Action failed");
                (ActionStatus::Failed { reason }, ActionOutput::default())
            }
        };
        let _ = scope
            .tx
            .send(PipelineEvent::ActionCompleted {
                stage: scope.stage.to_string(),
                action: action.name.clone(),
                status: status.clone(),
            })
            .await;

        (
            ActionResult {
                name: action.name.clone(),
                status,
                started_at,
                finished_at: chrono::Utc::now(),
            },
            output,
        )
    }

    async fn run_source(
        &self,
        action: &Action,
        source: &SourceAction,
        scope: &RunScope<'_>,
    ) -> Result<ActionOutput, FailureReason> {
        let failed = |message: String| FailureReason::ActionFailed {
            action: action.name.clone(),
            message,
        };

        let token = scope
            .variables
            .secrets
            .get(&source.source.token_secret)
            .ok_or_else(|| failed(format!("secret '{}' not found", source.source.token_secret)))?;
        let bundle = self
            .services
            .sources
            .fetch(&source.source, token)
            .await
            .map_err(|e| failed(scope.variables.mask(&e.to_string())))?;
        self.services
            .artifacts
            .put(scope.run_id, &source.output, bundle)
            .await
            .map_err(|e| failed(e.to_string()))?;
        Ok(ActionOutput::default())
    }

    async fn run_build(
        &self,
        action: &Action,
        build: &BuildAction,
        scope: &RunScope<'_>,
    ) -> Result<ActionOutput, FailureReason> {
        let failed = |message: String| FailureReason::ActionFailed {
            action: action.name.clone(),
            message,
        };

        let workspace = match &self.workspace_root {
            Some(root) => tempfile::Builder::new()
                .prefix("tradestore-build-")
                .tempdir_in(root),
            None => tempfile::Builder::new().prefix("tradestore-build-").tempdir(),
        }
        .map_err(|e| failed(format!("failed to create workspace: {}", e)))?;

        // Primary input at the workspace root, extra inputs in a directory each.
        let artifacts = &self.services.artifacts;
        let input = artifacts
            .get(scope.run_id, &build.input)
            .await
            .map_err(|e| failed(e.to_string()))?;
        write_bundle(workspace.path(), &input)
            .await
            .map_err(|e| failed(e.to_string()))?;
        for extra in &build.extra_inputs {
            let bundle = artifacts
                .get(scope.run_id, extra)
                .await
                .map_err(|e| failed(e.to_string()))?;
            write_bundle(&workspace.path().join(extra.as_str()), &bundle)
                .await
                .map_err(|e| failed(e.to_string()))?;
        }

        let spec = JobSpec {
            id: ResourceId::new(),
            project: build.project.clone(),
            workspace: workspace.path().to_path_buf(),
            env: scope.variables.interpolate_map(&build.project.env),
        };
        let executor = &self.services.executor;
        if !executor.can_execute(&spec).await {
            return Err(failed(format!(
                "executor '{}' cannot run this build",
                executor.name()
            )));
        }

        let handle = executor
            .spawn(spec)
            .await
            .map_err(|e| failed(e.to_string()))?;
        match executor.logs(&handle).await {
            Ok(mut logs) => {
                while let Some(mut line) = logs.next().await {
                    line.content = scope.variables.mask(&line.content);
                    let _ = scope
                        .tx
                        .send(PipelineEvent::ActionLog {
                            action: action.name.clone(),
                            line,
                        })
                        .await;
                }
            }
            Err(e) => warn!(action = %action.name, error = %e, "Build logs unavailable"),
        }
        let result = executor
            .wait(&handle)
            .await
            .map_err(|e| failed(e.to_string()))?;

        match &result.status {
            JobStatus::Succeeded { .. } => {}
            JobStatus::Failed { message, .. } => return Err(failed(message.clone())),
            JobStatus::Cancelled { .. } => return Err(failed("build was cancelled".to_string())),
            _ => return Err(failed("build did not complete".to_string())),
        }

        let declared = &build.project.spec.exported_variables;
        let missing = missing_exports(&result.exported_variables, declared);
        if !missing.is_empty() {
            return Err(failed(format!("build did not export {}", missing.join(", "))));
        }

        if !build.outputs.is_empty() {
            let bundle = result
                .artifact
                .ok_or_else(|| failed("build produced no artifact".to_string()))?;
            for output in &build.outputs {
                artifacts
                    .put(scope.run_id, output, bundle.clone())
                    .await
                    .map_err(|e| failed(e.to_string()))?;
            }
        }

        Ok(ActionOutput {
            exports: Some((action.namespace().to_string(), result.exported_variables)),
            stack_outputs: None,
        })
    }

    async fn run_approval(
        &self,
        action: &Action,
        notify: Option<String>,
        scope: &RunScope<'_>,
    ) -> Result<ActionOutput, FailureReason> {
        let _ = scope
            .tx
            .send(PipelineEvent::AwaitingApproval {
                stage: scope.stage.to_string(),
                action: action.name.clone(),
            })
            .await;
        info!(stage = %scope.stage, action = %action.name, "Waiting for approval");

        let request = ApprovalRequest {
            run_id: scope.run_id,
            pipeline: scope.pipeline.to_string(),
            stage: scope.stage.to_string(),
            action: action.name.clone(),
            notify,
        };
        match self.services.approvals.request(&request).await {
            Ok(ApprovalDecision::Approved { .. }) => Ok(ActionOutput::default()),
            Ok(ApprovalDecision::Rejected { comment }) => Err(FailureReason::ApprovalRejected {
                action: action.name.clone(),
                comment,
            }),
            Err(e) => Err(FailureReason::ActionFailed {
                action: action.name.clone(),
                message: e.to_string(),
            }),
        }
    }

    async fn run_deploy(
        &self,
        action: &Action,
        deploy: &DeployAction,
        scope: &RunScope<'_>,
    ) -> Result<ActionOutput, FailureReason> {
        let failed = |message: String| FailureReason::ActionFailed {
            action: action.name.clone(),
            message,
        };

        let parameters = scope
            .variables
            .resolve_parameters(&deploy.parameter_overrides)
            .map_err(|e| FailureReason::ParameterResolution {
                action: action.name.clone(),
                message: e.to_string(),
            })?;

        let bundle = self
            .services
            .artifacts
            .get(scope.run_id, &deploy.template.artifact)
            .await
            .map_err(|e| failed(e.to_string()))?;
        let content = bundle
            .file(&deploy.template.path)
            .ok_or_else(|| failed(format!("template {} not found", deploy.template)))?;
        let template: serde_json::Value = serde_json::from_slice(content)
            .map_err(|e| failed(format!("template {} is not valid JSON: {}", deploy.template, e)))?;

        let spec = StackDeploymentSpec {
            id: ResourceId::new(),
            stack_name: deploy.stack_name.clone(),
            environment: deploy.environment.clone(),
            template,
            parameters,
            admin_permissions: deploy.admin_permissions,
        };

        let deployment_failed = |message: String| FailureReason::Deployment {
            action: action.name.clone(),
            message,
        };
        let deployer = &self.services.deployer;
        let warnings = deployer
            .validate(&spec)
            .await
            .map_err(|e| deployment_failed(e.to_string()))?;
        for warning in warnings {
            warn!(action = %action.name, field = %warning.field, "{}", warning.message);
        }
        deployer
            .deploy(spec)
            .await
            .map_err(|e| deployment_failed(e.to_string()))?;
        let outputs = deployer
            .outputs(&deploy.environment, &deploy.stack_name)
            .await
            .map_err(|e| deployment_failed(e.to_string()))?;

        Ok(ActionOutput {
            exports: None,
            stack_outputs: Some(outputs),
        })
    }

    async fn run_validate(
        &self,
        action: &Action,
        validate: &ValidateAction,
        scope: &RunScope<'_>,
    ) -> Result<ActionOutput, FailureReason> {
        let failed = |message: String| FailureReason::ActionFailed {
            action: action.name.clone(),
            message,
        };

        let mut env = BTreeMap::new();
        for (var, output) in &validate.env_from_outputs {
            let value = scope
                .stack_outputs
                .get(&output.action)
                .and_then(|outputs| outputs.get(&output.output))
                .ok_or_else(|| {
                    failed(format!(
                        "output '{}' of '{}' is not available",
                        output.output, output.action
                    ))
                })?;
            env.insert(var.clone(), value.clone());
        }

        if let Some(check) = &validate.check {
            let address = env
                .get(&check.env_var)
                .ok_or_else(|| failed(format!("'{}' is not set", check.env_var)))?;
            let url = probe_url(address, &check.path).map_err(|e| failed(e.to_string()))?;
            let status = self
                .services
                .probe
                .probe(&url)
                .await
                .map_err(|e| failed(e.to_string()))?;
            if !(200..300).contains(&status) {
                return Err(failed(format!("{} returned status {}", url, status)));
            }
            info!(action = %action.name, url = %url, status, "Endpoint reachable");
        }

        Ok(ActionOutput::default())
    }
}
