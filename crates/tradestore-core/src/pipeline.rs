//! Pipeline definitions and run records.
//!
//! A pipeline is an ordered list of stages. Each stage holds actions that
//! consume and produce named artifacts; build actions can also export named
//! variables that later actions read through [`VariableRef`]s.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::LazyLock;

use crate::ResourceId;
use crate::artifact::{ArtifactName, ArtifactPath};
use crate::environment::Environment;
use crate::executor::BuildProject;
use crate::source::{GitHubSource, Trigger};
use crate::topology::{self, TopologyError};

// #{namespace.variable}
static VARIABLE_REF_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"#\{([A-Za-z0-9_-]+)\.([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid regex")
});

/// A pipeline definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDefinition {
    pub name: String,
    pub triggers: Vec<Trigger>,
    /// Stages in execution order.
    pub stages: Vec<Stage>,
}

impl PipelineDefinition {
    pub fn stage(&self, name: &str) -> Option<&Stage> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Every action with the index of its stage.
    pub fn actions(&self) -> impl Iterator<Item = (usize, &Action)> {
        self.stages
            .iter()
            .enumerate()
            .flat_map(|(idx, stage)| stage.actions.iter().map(move |a| (idx, a)))
    }

    pub fn find_action(&self, name: &str) -> Option<(usize, &Action)> {
        self.actions().find(|(_, a)| a.name == name)
    }

    /// Whether a push event starts this pipeline.
    pub fn triggered_by(&self, event: &crate::source::PushEvent) -> bool {
        self.triggers.iter().any(|t| t.matches(event))
    }
}

/// Builds a [`PipelineDefinition`] and validates its topology.
#[derive(Debug, Clone)]
pub struct PipelineBuilder {
    name: String,
    triggers: Vec<Trigger>,
    stages: Vec<Stage>,
}

impl PipelineBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            triggers: Vec::new(),
            stages: Vec::new(),
        }
    }

    pub fn trigger(mut self, trigger: Trigger) -> Self {
        if !self.triggers.contains(&trigger) {
            self.triggers.push(trigger);
        }
        self
    }

    /// Append a stage after all stages added so far.
    pub fn add_stage(mut self, stage: Stage) -> Self {
        for action in &stage.actions {
            if let ActionKind::Source(source) = &action.kind {
                if let Some(trigger) = source.source.trigger() {
                    self = self.trigger(trigger);
                }
            }
        }
        self.stages.push(stage);
        self
    }

    pub fn build(self) -> Result<PipelineDefinition, TopologyError> {
        let pipeline = PipelineDefinition {
            name: self.name,
            triggers: self.triggers,
            stages: self.stages,
        };
        topology::validate_topology(&pipeline)?;
        Ok(pipeline)
    }
}

/// A stage in a pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    pub name: String,
    pub actions: Vec<Action>,
}

impl Stage {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            actions: Vec::new(),
        }
    }

    pub fn with_action(mut self, action: Action) -> Self {
        self.actions.push(action);
        self
    }

    /// Action groups in run order; actions inside a group run concurrently.
    pub fn run_groups(&self) -> Vec<Vec<&Action>> {
        let mut groups: BTreeMap<u32, Vec<&Action>> = BTreeMap::new();
        for action in &self.actions {
            groups.entry(action.run_order).or_default().push(action);
        }
        groups.into_values().collect()
    }
}

/// A single unit of pipeline work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub name: String,
    /// Actions with a lower run order finish before higher ones start.
    pub run_order: u32,
    pub kind: ActionKind,
}

/// What an action does.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ActionKind {
    /// Check out a repository branch into an artifact.
    Source(SourceAction),
    /// Run a build project over an input artifact.
    Build(BuildAction),
    /// Wait for a human decision.
    ManualApproval { notify: Option<String> },
    /// Create or update a stack from a template artifact.
    Deploy(DeployAction),
    /// Check a deployed stack from the outside.
    Validate(ValidateAction),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceAction {
    pub source: GitHubSource,
    pub output: ArtifactName,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildAction {
    pub project: BuildProject,
    /// Primary input; becomes the workspace root.
    pub input: ArtifactName,
    /// Further inputs, unpacked into `<workspace>/<artifact name>`.
    pub extra_inputs: Vec<ArtifactName>,
    pub outputs: Vec<ArtifactName>,
    /// Variable namespace; defaults to the action name.
    pub namespace: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployAction {
    pub stack_name: String,
    pub environment: Environment,
    pub template: ArtifactPath,
    pub parameter_overrides: BTreeMap<String, ParameterValue>,
    pub admin_permissions: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidateAction {
    /// Variables filled from outputs of deploy actions.
    pub env_from_outputs: BTreeMap<String, OutputRef>,
    pub check: Option<ReachabilityCheck>,
}

/// A named output of the stack deployed by `action`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputRef {
    pub action: String,
    pub output: String,
}

/// An HTTP reachability check against an address taken from `env_var`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReachabilityCheck {
    pub env_var: String,
    pub path: String,
}

impl Action {
    fn new(name: impl Into<String>, kind: ActionKind) -> Self {
        Self {
            name: name.into(),
            run_order: 1,
            kind,
        }
    }

    pub fn source(
        name: impl Into<String>,
        source: GitHubSource,
        output: impl Into<ArtifactName>,
    ) -> Self {
        Self::new(
            name,
            ActionKind::Source(SourceAction {
                source,
                output: output.into(),
            }),
        )
    }

    pub fn build(
        name: impl Into<String>,
        project: BuildProject,
        input: impl Into<ArtifactName>,
        outputs: Vec<ArtifactName>,
    ) -> Self {
        Self::new(
            name,
            ActionKind::Build(BuildAction {
                project,
                input: input.into(),
                extra_inputs: Vec::new(),
                outputs,
                namespace: None,
            }),
        )
    }

    pub fn approval(name: impl Into<String>) -> Self {
        Self::new(name, ActionKind::ManualApproval { notify: None })
    }

    pub fn deploy(name: impl Into<String>, deploy: DeployAction) -> Self {
        Self::new(name, ActionKind::Deploy(deploy))
    }

    pub fn validate(name: impl Into<String>, validate: ValidateAction) -> Self {
        Self::new(name, ActionKind::Validate(validate))
    }

    pub fn with_run_order(mut self, run_order: u32) -> Self {
        self.run_order = run_order;
        self
    }

    /// Namespace under which this action's exported variables are published.
    pub fn namespace(&self) -> &str {
        match &self.kind {
            ActionKind::Build(build) => build.namespace.as_deref().unwrap_or(&self.name),
            _ => &self.name,
        }
    }

    /// Reference to one of this action's exported variables.
    pub fn variable(&self, name: impl Into<String>) -> VariableRef {
        VariableRef::new(self.namespace(), name)
    }

    pub fn inputs(&self) -> Vec<&ArtifactName> {
        match &self.kind {
            ActionKind::Build(build) => std::iter::once(&build.input)
                .chain(build.extra_inputs.iter())
                .collect(),
            ActionKind::Deploy(deploy) => vec![&deploy.template.artifact],
            _ => Vec::new(),
        }
    }

    pub fn outputs(&self) -> Vec<&ArtifactName> {
        match &self.kind {
            ActionKind::Source(source) => vec![&source.output],
            ActionKind::Build(build) => build.outputs.iter().collect(),
            _ => Vec::new(),
        }
    }

    pub fn exported_variables(&self) -> &[String] {
        match &self.kind {
            ActionKind::Build(build) => &build.project.spec.exported_variables,
            _ => &[],
        }
    }

    /// Pipeline variables this action reads.
    pub fn variable_refs(&self) -> Vec<VariableRef> {
        match &self.kind {
            ActionKind::Deploy(deploy) => deploy
                .parameter_overrides
                .values()
                .flat_map(|v| v.variable_refs())
                .collect(),
            ActionKind::Build(build) => build
                .project
                .env
                .values()
                .flat_map(|v| VariableRef::scan(v))
                .collect(),
            _ => Vec::new(),
        }
    }

    pub fn is_approval(&self) -> bool {
        matches!(self.kind, ActionKind::ManualApproval { .. })
    }
}

/// Reference to a variable exported by an earlier action: `#{namespace.name}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VariableRef {
    pub namespace: String,
    pub name: String,
}

impl VariableRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// All `#{namespace.name}` references in a string.
    pub fn scan(input: &str) -> Vec<VariableRef> {
        VARIABLE_REF_REGEX
            .captures_iter(input)
            .map(|caps| VariableRef::new(&caps[1], &caps[2]))
            .collect()
    }

    /// Replace every reference in `input` using `lookup`; unresolved
    /// references are returned as the error.
    pub fn substitute<F>(input: &str, lookup: F) -> Result<String, VariableRef>
    where
        F: Fn(&VariableRef) -> Option<String>,
    {
        let mut missing = None;
        let output = VARIABLE_REF_REGEX.replace_all(input, |caps: &regex::Captures| {
            let reference = VariableRef::new(&caps[1], &caps[2]);
            match lookup(&reference) {
                Some(value) => value,
                None => {
                    let text = reference.to_string();
                    missing.get_or_insert(reference);
                    text
                }
            }
        });
        match missing {
            Some(reference) => Err(reference),
            None => Ok(output.into_owned()),
        }
    }
}

impl std::fmt::Display for VariableRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{{{}.{}}}", self.namespace, self.name)
    }
}

impl std::str::FromStr for VariableRef {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let refs = Self::scan(s);
        match refs.as_slice() {
            [single] if single.to_string() == s => Ok(single.clone()),
            _ => Err(format!("not a variable reference: {}", s)),
        }
    }
}

/// Value of a deploy-time template parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParameterValue {
    Literal(String),
    /// A variable exported by an earlier action.
    Variable(VariableRef),
    /// A string with embedded `#{namespace.name}` references.
    Template(String),
}

impl ParameterValue {
    pub fn variable_refs(&self) -> Vec<VariableRef> {
        match self {
            ParameterValue::Literal(_) => Vec::new(),
            ParameterValue::Variable(reference) => vec![reference.clone()],
            ParameterValue::Template(template) => VariableRef::scan(template),
        }
    }
}

/// A pipeline run instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: ResourceId,
    pub pipeline: String,
    pub trigger: Trigger,
    pub status: PipelineStatus,
    pub stages: Vec<StageResult>,
    /// Exported variables by namespace.
    pub variables: BTreeMap<String, BTreeMap<String, String>>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl PipelineRun {
    pub fn new(pipeline: &PipelineDefinition, trigger: Trigger) -> Self {
        Self {
            id: ResourceId::new(),
            pipeline: pipeline.name.clone(),
            trigger,
            status: PipelineStatus::Queued,
            stages: pipeline
                .stages
                .iter()
                .map(|s| StageResult::pending(&s.name))
                .collect(),
            variables: BTreeMap::new(),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn stage(&self, name: &str) -> Option<&StageResult> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Names of every action that was started, in start order per stage.
    pub fn executed_actions(&self) -> Vec<&str> {
        self.stages
            .iter()
            .flat_map(|s| s.actions.iter().map(|a| a.name.as_str()))
            .collect()
    }
}

/// Overall pipeline status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelineStatus {
    Queued,
    Running,
    WaitingApproval { stage: String },
    Succeeded,
    Failed { stage: String, reason: FailureReason },
}

/// Why a run failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    /// A source, build or validate action failed.
    ActionFailed { action: String, message: String },
    ApprovalRejected {
        action: String,
        comment: Option<String>,
    },
    /// A deploy parameter referenced a variable with no value.
    ParameterResolution { action: String, message: String },
    /// The deployer could not apply the stack; it was rolled back.
    Deployment { action: String, message: String },
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::ActionFailed { action, message } => {
                write!(f, "action '{}' failed: {}", action, message)
            }
            FailureReason::ApprovalRejected { action, comment } => match comment {
                Some(comment) => write!(f, "approval '{}' rejected: {}", action, comment),
                None => write!(f, "approval '{}' rejected", action),
            },
            FailureReason::ParameterResolution { action, message } => {
                write!(f, "action '{}' could not resolve parameters: {}", action, message)
            }
            FailureReason::Deployment { action, message } => {
                write!(f, "deployment '{}' rolled back: {}", action, message)
            }
        }
    }
}

/// Result of a stage execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult {
    pub name: String,
    pub status: StageStatus,
    pub actions: Vec<ActionResult>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl StageResult {
    pub fn pending(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: StageStatus::Pending,
            actions: Vec::new(),
            started_at: None,
            finished_at: None,
        }
    }
}

/// Status of a stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StageStatus {
    Pending,
    Running,
    WaitingApproval,
    Succeeded,
    Failed { message: String },
    /// Not started because an earlier stage failed.
    Skipped { reason: String },
}

/// Result of one action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResult {
    pub name: String,
    pub status: ActionStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionStatus {
    Succeeded,
    Failed { reason: FailureReason },
}

impl ActionStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, ActionStatus::Succeeded)
    }
}
