//! Worker launchers.
//!
//! A launcher starts one worker for a pool slot and hands back its frame
//! channels. [`ProcessLauncher`] runs `flowpool worker` as an OS process and
//! speaks NDJSON over its pipes; [`ThreadLauncher`] runs the same dispatch
//! loop on a dedicated thread with its own runtime.

use std::path::PathBuf;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::handler::{HandlerRegistry, WorkerContext};
use crate::protocol::{HostFrame, WorkerFrame, spawn_frame_reader, spawn_frame_writer};
use crate::worker::WorkerIo;

const LINK_CHANNEL_CAPACITY: usize = 32;

/// How a worker ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerExit {
    Finished,
    Failed(String),
}

/// Host-side end of a running worker.
#[derive(Debug)]
pub struct WorkerLink {
    /// Frames from the worker (pulls and results). Closes when the worker's
    /// output ends.
    pub frames: mpsc::Receiver<WorkerFrame>,
    /// Frames to the worker. Dropping the sender closes the worker's input.
    pub commands: mpsc::Sender<HostFrame>,
    /// Resolves once the worker has exited.
    pub exited: oneshot::Receiver<WorkerExit>,
}

/// Errors starting a worker.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("Failed to spawn worker: {reason}")]
    SpawnFailed { reason: String },

    #[error("Worker {resource}#{index} did not accept its init frame")]
    InitRejected { resource: String, index: usize },
}

/// Starts workers for pool slots.
pub trait WorkerLauncher: Send + Sync + 'static {
    fn launch(&self, context: WorkerContext) -> Result<WorkerLink, LaunchError>;
}

/// Runs each worker as a child process speaking the NDJSON protocol.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessLauncher {
    /// Launch `program worker`.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: vec!["worker".to_string()],
        }
    }

    /// Launch the currently running executable in worker mode.
    pub fn current_exe() -> std::io::Result<Self> {
        std::env::current_exe().map(Self::new)
    }

    #[must_use]
    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn launch(&self, context: WorkerContext) -> Result<WorkerLink, LaunchError> {
        let label = format!("{}#{}", context.resource, context.worker_index);
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        info!(
            worker = %label,
            program = %self.program.display(),
            handler = %context.handler,
            "Spawning worker process"
        );
        let mut child = cmd.spawn().map_err(|e| LaunchError::SpawnFailed {
            reason: e.to_string(),
        })?;

        let stdin = child.stdin.take().ok_or_else(|| LaunchError::SpawnFailed {
            reason: "Failed to capture stdin".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| LaunchError::SpawnFailed {
            reason: "Failed to capture stdout".to_string(),
        })?;

        let (commands, _writer) = spawn_frame_writer::<_, HostFrame>(stdin, label.clone());
        let (frames, _reader) = spawn_frame_reader::<_, WorkerFrame>(stdout, label.clone());

        // Worker logs arrive on stderr; re-emit them under the worker's name.
        if let Some(stderr) = child.stderr.take() {
            let worker = label.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    info!(worker = %worker, "{line}");
                }
                debug!(worker = %worker, "stderr reader finished");
            });
        }

        let (exit_tx, exited) = oneshot::channel();
        let worker = label;
        tokio::spawn(async move {
            let exit = match child.wait().await {
                Ok(status) if status.success() => WorkerExit::Finished,
                Ok(status) => WorkerExit::Failed(format!("exited with {status}")),
                Err(e) => WorkerExit::Failed(e.to_string()),
            };
            debug!(worker = %worker, ?exit, "Worker process exited");
            let _ = exit_tx.send(exit);
        });

        let resource = context.resource.clone();
        let index = context.worker_index;
        commands
            .try_send(HostFrame::Init { context })
            .map_err(|_| LaunchError::InitRejected { resource, index })?;

        Ok(WorkerLink {
            frames,
            commands,
            exited,
        })
    }
}

/// Runs each worker on a dedicated OS thread with a current-thread runtime.
#[derive(Debug, Clone)]
pub struct ThreadLauncher {
    registry: HandlerRegistry,
}

impl ThreadLauncher {
    pub const fn new(registry: HandlerRegistry) -> Self {
        Self { registry }
    }
}

impl WorkerLauncher for ThreadLauncher {
    fn launch(&self, context: WorkerContext) -> Result<WorkerLink, LaunchError> {
        let (commands, host_frames) = mpsc::channel(LINK_CHANNEL_CAPACITY);
        let (replies, frames) = mpsc::channel(LINK_CHANNEL_CAPACITY);
        let (exit_tx, exited) = oneshot::channel();
        let registry = self.registry.clone();
        let name = format!("flowpool-{}-{}", context.resource, context.worker_index);

        std::thread::Builder::new()
            .name(name)
            .spawn(move || {
                let outcome = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .map_err(|e| e.to_string())
                    .and_then(|rt| {
                        rt.block_on(registry.run(context, WorkerIo::new(host_frames, replies)))
                            .map_err(|e| e.to_string())
                    });
                let exit = match outcome {
                    Ok(()) => WorkerExit::Finished,
                    Err(reason) => {
                        warn!(%reason, "Worker thread ended with an error");
                        WorkerExit::Failed(reason)
                    }
                };
                let _ = exit_tx.send(exit);
            })
            .map_err(|e| LaunchError::SpawnFailed {
                reason: e.to_string(),
            })?;

        Ok(WorkerLink {
            frames,
            commands,
            exited,
        })
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::queue::TaskMessage;
    use serde_json::json;

    fn context(handler: &str) -> WorkerContext {
        WorkerContext {
            resource: "launch".into(),
            handler: handler.into(),
            worker_index: 3,
            async_task_limit: 2,
            settings: serde_json::Value::Null,
        }
    }

    #[tokio::test]
    async fn thread_worker_round_trip() {
        let launcher = ThreadLauncher::new(HandlerRegistry::builtin());
        let mut link = launcher.launch(context("echo")).unwrap();

        assert_eq!(link.frames.recv().await, Some(WorkerFrame::Pull));
        let task = TaskMessage::process(json!({"text": "hello"}));
        link.commands
            .send(HostFrame::Task {
                message: task.clone(),
            })
            .await
            .unwrap();
        match link.frames.recv().await {
            Some(WorkerFrame::Result { message }) => {
                assert_eq!(message.uuid, task.uuid);
                assert_eq!(message.payload, Some(json!({"text": "hello"})));
            }
            other => panic!("unexpected frame {other:?}"),
        }

        assert_eq!(link.frames.recv().await, Some(WorkerFrame::Pull));
        link.commands
            .send(HostFrame::Task {
                message: TaskMessage::stop(),
            })
            .await
            .unwrap();
        assert_eq!(link.exited.await.unwrap(), WorkerExit::Finished);
    }

    #[tokio::test]
    async fn thread_worker_with_unknown_handler_fails() {
        let launcher = ThreadLauncher::new(HandlerRegistry::new());
        let link = launcher.launch(context("ghost")).unwrap();
        match link.exited.await.unwrap() {
            WorkerExit::Failed(reason) => assert!(reason.contains("ghost")),
            WorkerExit::Finished => panic!("worker should have failed"),
        }
    }

    #[tokio::test]
    async fn missing_program_fails_to_spawn() {
        let launcher = ProcessLauncher::new("/nonexistent/flowpool-worker-binary");
        let err = launcher.launch(context("echo")).unwrap_err();
        assert!(matches!(err, LaunchError::SpawnFailed { .. }));
    }
}
