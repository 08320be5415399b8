//! Build projects and the executor trait.
//!
//! Executors run a build project's phases in an isolated environment (a
//! container, or a host shell for local development) against a workspace that
//! holds the action's input artifacts.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::artifact::ArtifactBundle;
use crate::{ResourceId, Result};

/// Prefix of the log line an executor prints for every exported variable.
pub const EXPORT_MARKER: &str = "::export::";

/// A build project: image, environment and build specification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildProject {
    pub name: String,
    pub environment: BuildEnvironment,
    /// Environment variables visible to every phase.
    pub env: BTreeMap<String, String>,
    pub spec: BuildSpec,
    pub cache: Vec<CacheMode>,
}

impl BuildProject {
    pub fn new(name: impl Into<String>, environment: BuildEnvironment, spec: BuildSpec) -> Self {
        Self {
            name: name.into(),
            environment,
            env: BTreeMap::new(),
            spec,
            cache: Vec::new(),
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_cache(mut self, mode: CacheMode) -> Self {
        self.cache.push(mode);
        self
    }
}

/// The build image and its privileges.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildEnvironment {
    pub image: String,
    /// Needed to run a Docker daemon inside the build.
    pub privileged: bool,
}

/// Local cache modes of a build project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheMode {
    DockerLayer,
    Source,
    Custom,
}

/// Build phases, executed in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseKind {
    Install,
    PreBuild,
    Build,
    PostBuild,
}

impl std::fmt::Display for PhaseKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PhaseKind::Install => write!(f, "install"),
            PhaseKind::PreBuild => write!(f, "pre_build"),
            PhaseKind::Build => write!(f, "build"),
            PhaseKind::PostBuild => write!(f, "post_build"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildPhase {
    pub kind: PhaseKind,
    pub commands: Vec<String>,
}

/// Which workspace files become the output artifact.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactSelection {
    /// Directory (relative to the workspace) the patterns are matched in.
    pub base_directory: Option<String>,
    /// Glob patterns, e.g. `**/*` or `imagedefinitions.json`.
    pub files: Vec<String>,
}

/// The commands a build project runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildSpec {
    pub phases: Vec<BuildPhase>,
    /// Shell variables published as pipeline variables when the build succeeds.
    pub exported_variables: Vec<String>,
    pub artifacts: ArtifactSelection,
}

impl BuildSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase<I, S>(mut self, kind: PhaseKind, commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.phases.push(BuildPhase {
            kind,
            commands: commands.into_iter().map(Into::into).collect(),
        });
        self.phases.sort_by_key(|p| p.kind);
        self
    }

    pub fn export(mut self, variable: impl Into<String>) -> Self {
        self.exported_variables.push(variable.into());
        self
    }

    pub fn artifacts<I, S>(mut self, base_directory: Option<&str>, files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.artifacts = ArtifactSelection {
            base_directory: base_directory.map(|s| s.to_string()),
            files: files.into_iter().map(Into::into).collect(),
        };
        self
    }

    /// A single shell script running every phase and then echoing the
    /// exported variables behind [`EXPORT_MARKER`].
    ///
    /// Commands are chained with `&&`, so the first failing command stops the
    /// build with its exit code and no variable is exported. A variable the
    /// build never set is not echoed at all.
    pub fn script(&self) -> String {
        let mut commands: Vec<String> = self
            .phases
            .iter()
            .flat_map(|p| p.commands.iter().cloned())
            .collect();

        for var in &self.exported_variables {
            commands.push(format!(
                "if [ -n \"${{{0}+x}}\" ]; then echo \"{1}{0}=${0}\"; fi",
                var, EXPORT_MARKER
            ));
        }

        if commands.is_empty() {
            "true".to_string()
        } else {
            commands.join(" && ")
        }
    }
}

/// Pick the exported variables out of build log lines.
///
/// Only names listed in `names` are accepted; a later line wins over an
/// earlier one.
pub fn parse_exported_variables<'a>(
    lines: impl IntoIterator<Item = &'a str>,
    names: &[String],
) -> BTreeMap<String, String> {
    let mut exported = BTreeMap::new();
    for line in lines {
        let Some(rest) = line.trim_end().strip_prefix(EXPORT_MARKER) else {
            continue;
        };
        let Some((name, value)) = rest.split_once('=') else {
            continue;
        };
        if names.iter().any(|n| n == name) {
            exported.insert(name.to_string(), value.to_string());
        }
    }
    exported
}

/// Declared exports missing from `exported`, in declaration order.
pub fn missing_exports<'a>(
    exported: &BTreeMap<String, String>,
    names: &'a [String],
) -> Vec<&'a str> {
    names
        .iter()
        .filter(|n| !exported.contains_key(n.as_str()))
        .map(String::as_str)
        .collect()
}

/// Specification for a build job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub id: ResourceId,
    pub project: BuildProject,
    /// Host directory holding the input artifacts; the build runs inside it.
    pub workspace: PathBuf,
    /// Extra variables layered over the project's environment.
    pub env: BTreeMap<String, String>,
}

/// Handle to a running or completed job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobHandle {
    pub id: ResourceId,
    /// Executor-specific identifier (e.g., container ID, process ID).
    pub executor_id: String,
    pub executor_name: String,
}

/// Status of a job execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    Running {
        started_at: DateTime<Utc>,
    },
    Succeeded {
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    },
    Failed {
        started_at: Option<DateTime<Utc>>,
        finished_at: DateTime<Utc>,
        exit_code: Option<i32>,
        message: String,
    },
    Cancelled {
        started_at: Option<DateTime<Utc>>,
        cancelled_at: DateTime<Utc>,
    },
}

impl JobStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, JobStatus::Succeeded { .. })
    }
}

/// Result of a completed job.
#[derive(Debug, Clone)]
pub struct JobResult {
    pub status: JobStatus,
    pub exit_code: Option<i32>,
    /// Variables named in the build spec's export list.
    pub exported_variables: BTreeMap<String, String>,
    /// Files matched by the build spec's artifact selection.
    pub artifact: Option<ArtifactBundle>,
}

/// A line of log output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub stream: LogStream,
    pub content: String,
}

impl LogLine {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            stream: LogStream::System,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogStream {
    Stdout,
    Stderr,
    System,
}

/// Trait for build executors.
#[async_trait]
pub trait Executor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Check if this executor can handle the given job spec.
    async fn can_execute(&self, spec: &JobSpec) -> bool;

    /// Start a job.
    async fn spawn(&self, spec: JobSpec) -> Result<JobHandle>;

    /// Stream of log lines from a job.
    async fn logs(&self, handle: &JobHandle) -> Result<BoxStream<'static, LogLine>>;

    /// Wait for a job to complete and collect its outputs.
    async fn wait(&self, handle: &JobHandle) -> Result<JobResult>;

    /// Stop a running job.
    async fn cancel(&self, handle: &JobHandle) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app_spec() -> BuildSpec {
        BuildSpec::new()
            .phase(PhaseKind::PostBuild, ["export imageTag=$tag"])
            .phase(PhaseKind::PreBuild, ["export tag=latest"])
            .export("imageTag")
            .artifacts(None, ["imagedefinitions.json"])
    }

    #[test]
    fn test_phases_sorted_and_chained() {
        let script = app_spec().script();
        assert_eq!(
            script,
            "export tag=latest && export imageTag=$tag && \
             if [ -n \"${imageTag+x}\" ]; then echo \"::export::imageTag=$imageTag\"; fi"
        );
    }

    #[test]
    fn test_empty_spec_script() {
        assert_eq!(BuildSpec::new().script(), "true");
    }

    #[test]
    fn test_parse_exported_variables() {
        let names = vec!["imageTag".to_string()];
        let lines = [
            "building...",
            "::export::imageTag=latest",
            "::export::other=ignored",
            "::export::malformed",
        ];
        let vars = parse_exported_variables(lines, &names);
        assert_eq!(vars.len(), 1);
        assert_eq!(vars["imageTag"], "latest");
    }

    #[test]
    fn test_export_value_may_contain_equals() {
        let names = vec!["uri".to_string()];
        let vars = parse_exported_variables(["::export::uri=a=b\n"], &names);
        assert_eq!(vars["uri"], "a=b");
    }

    #[test]
    fn test_missing_exports() {
        let names = vec!["imageTag".to_string(), "stackName".to_string()];
        let exported = BTreeMap::from([("stackName".to_string(), "WebService".to_string())]);
        assert_eq!(missing_exports(&exported, &names), vec!["imageTag"]);
        assert!(missing_exports(&exported, &names[1..]).is_empty());
    }

    #[test]
    fn test_job_status_success() {
        assert!(!JobStatus::Pending.is_success());
        let failed = JobStatus::Failed {
            started_at: None,
            finished_at: Utc::now(),
            exit_code: Some(1),
            message: "exit 1".to_string(),
        };
        assert!(!failed.is_success());
    }
}
