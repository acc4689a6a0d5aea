//! Worker tool process launching.
//!
//! The launcher owns everything about starting the process: the event pipe
//! the worker writes to, the environment, and the spawn itself. The executor
//! only supplies the command line and its command pipe's name.

use std::collections::HashMap;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};

use crate::bridge::pipe::{NamedPipe, PipeFactory, PipeReader};
use crate::bridge::protocol::ENV_EVENT_PIPE;
use crate::error::LaunchError;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessParams {
    pub command: Vec<String>,
    pub env: HashMap<String, String>,
}

/// A started worker and the stream of events it writes.
pub struct LaunchedWorker {
    pub child: Child,
    pub events: PipeReader,
    /// Pipe backing `events`, closed by the executor during teardown.
    pub event_pipe: Option<Box<dyn NamedPipe>>,
}

/// Extension point for different worker launch strategies.
pub trait WorkerLauncher: Send + Sync {
    fn launch(&self, params: ProcessParams) -> Result<LaunchedWorker, LaunchError>;
}

/// Launches the worker as a child process with a fresh event pipe.
pub struct ProcessLauncher {
    pipes: Arc<dyn PipeFactory>,
}

impl ProcessLauncher {
    pub fn new(pipes: Arc<dyn PipeFactory>) -> Self {
        Self { pipes }
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn launch(&self, mut params: ProcessParams) -> Result<LaunchedWorker, LaunchError> {
        let (event_pipe, events) = self.pipes.create_reader().map_err(LaunchError::Pipe)?;
        params
            .env
            .insert(ENV_EVENT_PIPE.to_string(), event_pipe.name().to_string());

        let child = match spawn_process(&params) {
            Ok(child) => child,
            Err(e) => {
                drop(events);
                if let Err(close_err) = event_pipe.close() {
                    tracing::warn!(error = %close_err, "Failed to close event pipe after spawn failure");
                }
                return Err(e);
            }
        };

        Ok(LaunchedWorker {
            child,
            events,
            event_pipe: Some(event_pipe),
        })
    }
}

/// Spawn `params.command` with its environment added to ours.
///
/// stdout and stderr are piped so they can be drained at shutdown; stdin is
/// closed since commands travel over the command pipe.
pub fn spawn_process(params: &ProcessParams) -> Result<Child, LaunchError> {
    let (program, args) = params
        .command
        .split_first()
        .ok_or(LaunchError::EmptyCommand)?;

    tracing::debug!(%program, ?args, "Spawning worker tool process");
    Command::new(program)
        .args(args)
        .envs(&params.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(LaunchError::Spawn)
}

/// How a worker process ended, with everything it printed.
#[derive(Debug)]
pub struct ProcessOutput {
    pub status: io::Result<ExitStatus>,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("worker tool process did not exit within {0:?}")]
pub struct ExitTimeout(pub Duration);

/// Wait up to `timeout` for `child` to exit while draining its output.
///
/// The process is left running on timeout.
pub async fn wait_for_exit(child: &mut Child, timeout: Duration) -> Result<ProcessOutput, ExitTimeout> {
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let waited = tokio::time::timeout(timeout, async {
        let (status, stdout, stderr) =
            tokio::join!(child.wait(), drain(stdout, "stdout"), drain(stderr, "stderr"));
        ProcessOutput {
            status,
            stdout,
            stderr,
        }
    })
    .await;

    waited.map_err(|_| ExitTimeout(timeout))
}

async fn drain<R: AsyncRead + Unpin>(stream: Option<R>, name: &str) -> String {
    let Some(mut stream) = stream else {
        return String::new();
    };
    let mut buf = Vec::new();
    if let Err(e) = stream.read_to_end(&mut buf).await {
        tracing::warn!(error = %e, stream = name, "Failed to read worker tool output");
    }
    String::from_utf8_lossy(&buf).into_owned()
}
