//! Local shell executor.
//!
//! Runs the build script with `sh -c` directly in the job workspace on the
//! host. The build image is ignored, so this is meant for hosts where the
//! build toolchain is already installed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{info, warn};
use tradestore_core::executor::*;
use tradestore_core::{Error, ResourceId, Result};

use crate::artifacts::collect_artifacts;

enum Outcome {
    Exited(Option<i32>),
    Cancelled,
    Crashed(String),
}

struct ShellJob {
    workspace: PathBuf,
    spec: BuildSpec,
    started_at: DateTime<Utc>,
    lines: Arc<std::sync::Mutex<Vec<LogLine>>>,
    log_rx: Option<mpsc::UnboundedReceiver<LogLine>>,
    task: Option<JoinHandle<Outcome>>,
    cancel: Option<oneshot::Sender<()>>,
}

/// Executor running builds as host processes.
#[derive(Default)]
pub struct LocalShellExecutor {
    jobs: Mutex<HashMap<ResourceId, ShellJob>>,
}

impl LocalShellExecutor {
    pub fn new() -> Self {
        Self::default()
    }
}

fn forward_lines<R>(
    reader: R,
    stream: LogStream,
    lines: Arc<std::sync::Mutex<Vec<LogLine>>>,
    tx: mpsc::UnboundedSender<LogLine>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader).lines();
        loop {
            match reader.next_line().await {
                Ok(Some(content)) => {
                    let line = LogLine {
                        timestamp: Utc::now(),
                        stream,
                        content,
                    };
                    if let Ok(mut all) = lines.lock() {
                        all.push(line.clone());
                    }
                    // The receiver may have been dropped; keep draining the pipe.
                    let _ = tx.send(line);
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Failed to read build output");
                    break;
                }
            }
        }
    })
}

#[async_trait]
impl Executor for LocalShellExecutor {
    fn name(&self) -> &'static str {
        "shell"
    }

    async fn can_execute(&self, spec: &JobSpec) -> bool {
        spec.workspace.is_dir()
    }

    async fn spawn(&self, spec: JobSpec) -> Result<JobHandle> {
        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(spec.project.spec.script())
            .current_dir(&spec.workspace)
            .envs(&spec.project.env)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        info!(job = %spec.id, project = %spec.project.name, "Starting build process");
        let mut child = command
            .spawn()
            .map_err(|e| Error::ExecutionFailed(format!("Failed to start build: {}", e)))?;
        let pid = child.id().map(|p| p.to_string()).unwrap_or_default();

        let lines = Arc::new(std::sync::Mutex::new(Vec::new()));
        let (tx, rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = oneshot::channel();

        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(forward_lines(stdout, LogStream::Stdout, lines.clone(), tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(forward_lines(stderr, LogStream::Stderr, lines.clone(), tx.clone()));
        }
        drop(tx);

        let task = tokio::spawn(async move {
            let outcome = tokio::select! {
                status = child.wait() => match status {
                    Ok(status) => Outcome::Exited(status.code()),
                    Err(e) => Outcome::Crashed(e.to_string()),
                },
                _ = cancel_rx => {
                    let _ = child.kill().await;
                    Outcome::Cancelled
                }
            };
            // Children of a killed shell may still hold the pipes open.
            let cancelled = matches!(outcome, Outcome::Cancelled);
            for reader in readers {
                if cancelled {
                    reader.abort();
                }
                let _ = reader.await;
            }
            outcome
        });

        self.jobs.lock().await.insert(
            spec.id,
            ShellJob {
                workspace: spec.workspace,
                spec: spec.project.spec,
                started_at: Utc::now(),
                lines,
                log_rx: Some(rx),
                task: Some(task),
                cancel: Some(cancel_tx),
            },
        );

        Ok(JobHandle {
            id: spec.id,
            executor_id: pid,
            executor_name: self.name().to_string(),
        })
    }

    async fn logs(&self, handle: &JobHandle) -> Result<BoxStream<'static, LogLine>> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs
            .get_mut(&handle.id)
            .ok_or_else(|| Error::NotFound(format!("job {}", handle.id)))?;

        // The live stream can be taken once; later callers get what was captured.
        match job.log_rx.take() {
            Some(rx) => Ok(UnboundedReceiverStream::new(rx).boxed()),
            None => {
                let captured = job.lines.lock().map(|l| l.clone()).unwrap_or_default();
                Ok(futures::stream::iter(captured).boxed())
            }
        }
    }

    async fn wait(&self, handle: &JobHandle) -> Result<JobResult> {
        let task = {
            let mut jobs = self.jobs.lock().await;
            let job = jobs
                .get_mut(&handle.id)
                .ok_or_else(|| Error::NotFound(format!("job {}", handle.id)))?;
            job.task
                .take()
                .ok_or_else(|| Error::Conflict(format!("job {} is already awaited", handle.id)))?
        };

        let outcome = task
            .await
            .map_err(|e| Error::Internal(format!("build task failed: {}", e)))?;

        let job = self
            .jobs
            .lock()
            .await
            .remove(&handle.id)
            .ok_or_else(|| Error::NotFound(format!("job {}", handle.id)))?;
        let finished_at = Utc::now();

        let (status, exit_code) = match outcome {
            Outcome::Exited(Some(0)) => (
                JobStatus::Succeeded {
                    started_at: job.started_at,
                    finished_at,
                },
                Some(0),
            ),
            Outcome::Exited(code) => (
                JobStatus::Failed {
                    started_at: Some(job.started_at),
                    finished_at,
                    exit_code: code,
                    message: match code {
                        Some(code) => format!("build exited with code {}", code),
                        None => "build terminated by signal".to_string(),
                    },
                },
                code,
            ),
            Outcome::Cancelled => (
                JobStatus::Cancelled {
                    started_at: Some(job.started_at),
                    cancelled_at: finished_at,
                },
                None,
            ),
            Outcome::Crashed(message) => (
                JobStatus::Failed {
                    started_at: Some(job.started_at),
                    finished_at,
                    exit_code: None,
                    message,
                },
                None,
            ),
        };

        if !status.is_success() {
            return Ok(JobResult {
                status,
                exit_code,
                exported_variables: Default::default(),
                artifact: None,
            });
        }

        let captured = job.lines.lock().map(|l| l.clone()).unwrap_or_default();
        let exported_variables = parse_exported_variables(
            captured
                .iter()
                .filter(|l| l.stream == LogStream::Stdout)
                .map(|l| l.content.as_str()),
            &job.spec.exported_variables,
        );

        let artifact = if job.spec.artifacts.files.is_empty() {
            None
        } else {
            Some(collect_artifacts(&job.workspace, &job.spec.artifacts).await?)
        };

        Ok(JobResult {
            status,
            exit_code,
            exported_variables,
            artifact,
        })
    }

    async fn cancel(&self, handle: &JobHandle) -> Result<()> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs
            .get_mut(&handle.id)
            .ok_or_else(|| Error::NotFound(format!("job {}", handle.id)))?;
        if let Some(cancel) = job.cancel.take() {
            let _ = cancel.send(());
        }
        Ok(())
    }
}
