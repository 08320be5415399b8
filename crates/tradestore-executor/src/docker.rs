//! Local Docker executor implementation.
//!
//! Runs a build project's script in its build image with the job workspace
//! bind-mounted at [`WORKSPACE_MOUNT`]. Privileged projects also get the
//! host Docker socket so they can build and push images.

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use chrono::Utc;
use futures::StreamExt;
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use tradestore_core::executor::*;
use tradestore_core::{Error, ResourceId, Result};

use crate::artifacts::collect_artifacts;

/// Where the workspace appears inside the build container.
pub const WORKSPACE_MOUNT: &str = "/workspace";

const DOCKER_SOCKET: &str = "/var/run/docker.sock";

/// Managed build images are named `aws/codebuild/<name>`; only their public
/// mirror can be pulled outside the build service.
const CODEBUILD_IMAGE_PREFIX: &str = "aws/codebuild/";

/// Default registry path mirroring the managed build images.
pub const CODEBUILD_MIRROR: &str = "public.ecr.aws/codebuild/";

/// Local Docker executor for development and small deployments.
pub struct LocalDockerExecutor {
    docker: Docker,
    codebuild_mirror: String,
    // What `wait` needs to collect outputs after the container exits.
    jobs: Mutex<HashMap<ResourceId, (PathBuf, BuildSpec)>>,
}

impl LocalDockerExecutor {
    /// Create a new LocalDockerExecutor connecting to the local Docker daemon.
    pub fn new() -> Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().map_err(|e| Error::Internal(e.to_string()))?;
        Ok(Self::with_client(docker))
    }

    /// Create with a custom Docker client.
    pub fn with_client(docker: Docker) -> Self {
        Self {
            docker,
            codebuild_mirror: CODEBUILD_MIRROR.to_string(),
            jobs: Mutex::new(HashMap::new()),
        }
    }

    /// Pull managed build images from `mirror` instead of [`CODEBUILD_MIRROR`].
    pub fn with_codebuild_mirror(mut self, mirror: impl Into<String>) -> Self {
        self.codebuild_mirror = mirror.into();
        self
    }

    /// The image actually pulled and run for a project's build image.
    pub fn local_image(&self, image: &str) -> String {
        match image.strip_prefix(CODEBUILD_IMAGE_PREFIX) {
            Some(name) => format!("{}{}", self.codebuild_mirror, name),
            None => image.to_string(),
        }
    }

    fn container_name(job_id: &ResourceId) -> String {
        format!("tradestore-build-{}", job_id)
    }

    fn container_env(spec: &JobSpec) -> Vec<String> {
        let mut env = spec.project.env.clone();
        env.extend(spec.env.clone());
        env.iter().map(|(k, v)| format!("{}={}", k, v)).collect()
    }

    fn binds(spec: &JobSpec) -> Vec<String> {
        let mut binds = vec![format!("{}:{}:rw", spec.workspace.display(), WORKSPACE_MOUNT)];
        if spec.project.environment.privileged {
            binds.push(format!("{}:{}", DOCKER_SOCKET, DOCKER_SOCKET));
        }
        binds
    }

    async fn pull_image(&self, image: &str) {
        info!(image = %image, "Pulling image");
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };

        let mut pull_stream = self.docker.create_image(Some(options), None, None);
        while let Some(result) = pull_stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(status) = info.status {
                        debug!(status = %status, "Pull progress");
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Pull warning");
                }
            }
        }
    }

    async fn remove_container(&self, container_name: &str) {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        if let Err(e) = self
            .docker
            .remove_container(container_name, Some(options))
            .await
        {
            warn!(container = %container_name, error = %e, "Failed to remove container");
        }
    }

    async fn status(&self, handle: &JobHandle) -> Result<JobStatus> {
        let container_name = Self::container_name(&handle.id);

        let inspect = self
            .docker
            .inspect_container(&container_name, None)
            .await
            .map_err(|e| Error::NotFound(format!("Container not found: {}", e)))?;

        let state = inspect
            .state
            .ok_or_else(|| Error::Internal("No state".to_string()))?;

        let parse_time = |s: Option<String>| {
            s.and_then(|s| chrono::DateTime::parse_from_rfc3339(&s).ok())
                .map(|dt| dt.with_timezone(&Utc))
        };

        let status = if state.running.unwrap_or(false) {
            JobStatus::Running {
                started_at: parse_time(state.started_at).unwrap_or_else(Utc::now),
            }
        } else if state.paused.unwrap_or(false) {
            JobStatus::Pending
        } else {
            let exit_code = state.exit_code.map(|c| c as i32);
            let started_at = parse_time(state.started_at);
            let finished_at = parse_time(state.finished_at).unwrap_or_else(Utc::now);

            if exit_code == Some(0) {
                JobStatus::Succeeded {
                    started_at: started_at.unwrap_or(finished_at),
                    finished_at,
                }
            } else {
                let message = state
                    .error
                    .filter(|e| !e.is_empty())
                    .unwrap_or_else(|| format!("build exited with code {:?}", exit_code));
                JobStatus::Failed {
                    started_at,
                    finished_at,
                    exit_code,
                    message,
                }
            }
        };

        Ok(status)
    }
}

#[async_trait]
impl Executor for LocalDockerExecutor {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn can_execute(&self, spec: &JobSpec) -> bool {
        spec.workspace.is_absolute() && self.docker.ping().await.is_ok()
    }

    async fn spawn(&self, spec: JobSpec) -> Result<JobHandle> {
        let container_name = Self::container_name(&spec.id);
        let image = self.local_image(&spec.project.environment.image);
        if image != spec.project.environment.image {
            debug!(
                requested = %spec.project.environment.image,
                image = %image,
                "Using mirrored build image"
            );
        }

        self.pull_image(&image).await;

        let host_config = HostConfig {
            binds: Some(Self::binds(&spec)),
            privileged: Some(spec.project.environment.privileged),
            ..Default::default()
        };

        let config = Config {
            image: Some(image),
            cmd: Some(vec![
                "sh".to_string(),
                "-c".to_string(),
                spec.project.spec.script(),
            ]),
            env: Some(Self::container_env(&spec)),
            working_dir: Some(WORKSPACE_MOUNT.to_string()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            host_config: Some(host_config),
            ..Default::default()
        };

        let create_options = CreateContainerOptions {
            name: container_name.clone(),
            platform: None,
        };

        info!(container = %container_name, project = %spec.project.name, "Creating container");
        let container = self
            .docker
            .create_container(Some(create_options), config)
            .await
            .map_err(|e| Error::ExecutionFailed(format!("Failed to create container: {}", e)))?;

        info!(container = %container_name, "Starting container");
        self.docker
            .start_container(&container_name, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| Error::ExecutionFailed(format!("Failed to start container: {}", e)))?;

        self.jobs
            .lock()
            .await
            .insert(spec.id, (spec.workspace, spec.project.spec));

        Ok(JobHandle {
            id: spec.id,
            executor_id: container.id,
            executor_name: self.name().to_string(),
        })
    }

    async fn logs(&self, handle: &JobHandle) -> Result<BoxStream<'static, LogLine>> {
        let container_name = Self::container_name(&handle.id);

        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            ..Default::default()
        };

        let stream = self.docker.logs(&container_name, Some(options));

        let mapped_stream = stream.filter_map(|result| async move {
            match result {
                Ok(output) => {
                    let (stream, message) = match output {
                        LogOutput::StdErr { message } => (LogStream::Stderr, message),
                        LogOutput::StdOut { message }
                        | LogOutput::Console { message }
                        | LogOutput::StdIn { message } => (LogStream::Stdout, message),
                    };
                    Some(LogLine {
                        timestamp: Utc::now(),
                        stream,
                        content: String::from_utf8_lossy(&message).trim_end().to_string(),
                    })
                }
                Err(e) => {
                    warn!(error = %e, "Log stream error");
                    None
                }
            }
        });

        Ok(Box::pin(mapped_stream))
    }

    async fn wait(&self, handle: &JobHandle) -> Result<JobResult> {
        let container_name = Self::container_name(&handle.id);

        let options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut stream = self.docker.wait_container(&container_name, Some(options));

        let exit_code = match stream.next().await {
            Some(Ok(response)) => Some(response.status_code as i32),
            // Non-zero exits are reported as an error by the daemon.
            Some(Err(DockerError::DockerContainerWaitError { code, .. })) => Some(code as i32),
            Some(Err(e)) => {
                warn!(error = %e, "Wait error");
                None
            }
            None => None,
        };

        let status = self.status(handle).await?;
        let (workspace, build_spec) = self
            .jobs
            .lock()
            .await
            .remove(&handle.id)
            .ok_or_else(|| Error::NotFound(format!("job {}", handle.id)))?;

        let mut result = JobResult {
            status,
            exit_code,
            exported_variables: Default::default(),
            artifact: None,
        };

        if result.status.is_success() {
            // The container has exited, so the followed log stream is finite.
            let lines: Vec<String> = self
                .logs(handle)
                .await?
                .map(|line| line.content)
                .collect()
                .await;
            result.exported_variables = parse_exported_variables(
                lines.iter().flat_map(|l| l.lines()),
                &build_spec.exported_variables,
            );
            if !build_spec.artifacts.files.is_empty() {
                result.artifact = Some(collect_artifacts(&workspace, &build_spec.artifacts).await?);
            }
        }

        self.remove_container(&container_name).await;
        Ok(result)
    }

    async fn cancel(&self, handle: &JobHandle) -> Result<()> {
        let container_name = Self::container_name(&handle.id);

        self.docker
            .stop_container(&container_name, None)
            .await
            .map_err(|e| Error::ExecutionFailed(format!("Failed to stop container: {}", e)))?;

        self.remove_container(&container_name).await;
        self.jobs.lock().await.remove(&handle.id);
        Ok(())
    }
}
