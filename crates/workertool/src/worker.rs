//! Worker side of the protocol.
//!
//! A worker tool reads commands from the pipe named by
//! `WORKER_TOOL_COMMAND_PIPE`, runs each through a [`CommandHandler`], and
//! answers with exactly one `ResultEvent` per action on the pipe named by
//! `WORKER_TOOL_EVENT_PIPE`. Progress events may be sent before the result.

use std::io;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::JsonCodec;
use crate::bridge::framing::{close_writer, read_command, write_event};
use crate::bridge::pipe::PipeWriter;
use crate::bridge::protocol::{
    Command, ConsoleEvent, DownwardEvent, LogEvent, LogLevel, ResultEvent, StepEvent, StepStatus,
};

/// Runs one action on the worker.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Execute `action_id`. The returned result should carry the same id.
    ///
    /// An error means the event pipe is unusable and stops the worker.
    async fn execute(&self, action_id: &str, payload: Value, events: &EventSink)
    -> io::Result<ResultEvent>;
}

/// A step announced with [`EventSink::step_started`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub event_id: i32,
    pub step_type: String,
    pub description: String,
}

/// Writes events back to the executor.
pub struct EventSink {
    writer: Mutex<FramedWrite<PipeWriter, JsonCodec>>,
    next_event_id: AtomicI32,
    started: Instant,
}

impl EventSink {
    pub fn new(writer: PipeWriter) -> Self {
        Self {
            writer: Mutex::new(FramedWrite::new(writer, JsonCodec::new())),
            next_event_id: AtomicI32::new(1),
            started: Instant::now(),
        }
    }

    pub async fn send(&self, event: impl Into<DownwardEvent>) -> io::Result<()> {
        let event = event.into();
        let mut writer = self.writer.lock().await;
        write_event(&mut *writer, &event).await
    }

    pub async fn console(&self, log_level: LogLevel, message: impl Into<String>) -> io::Result<()> {
        self.send(ConsoleEvent {
            log_level,
            message: message.into(),
        })
        .await
    }

    pub async fn log(
        &self,
        log_level: LogLevel,
        logger_name: impl Into<String>,
        message: impl Into<String>,
    ) -> io::Result<()> {
        self.send(LogEvent {
            log_level,
            logger_name: logger_name.into(),
            message: message.into(),
        })
        .await
    }

    pub async fn step_started(
        &self,
        step_type: impl Into<String>,
        description: impl Into<String>,
    ) -> io::Result<Step> {
        let step = Step {
            event_id: self.next_event_id.fetch_add(1, Ordering::Relaxed),
            step_type: step_type.into(),
            description: description.into(),
        };
        self.send_step(&step, StepStatus::Started).await?;
        Ok(step)
    }

    pub async fn step_finished(&self, step: Step) -> io::Result<()> {
        self.send_step(&step, StepStatus::Finished).await
    }

    async fn send_step(&self, step: &Step, step_status: StepStatus) -> io::Result<()> {
        self.send(StepEvent {
            event_id: step.event_id,
            step_status,
            step_type: step.step_type.clone(),
            description: step.description.clone(),
            duration_ms: self.elapsed_ms(),
        })
        .await
    }

    /// Milliseconds since this sink was created.
    pub fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    async fn close(&self) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        close_writer(&mut *writer).await
    }
}

/// Serve commands until `SHUTDOWN_COMMAND` or the end of the command stream.
pub async fn run_worker<R, W, H>(commands: R, events: W, handler: &H) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Send + Unpin + 'static,
    H: CommandHandler + ?Sized,
{
    let mut commands = FramedRead::new(commands, JsonCodec::new());
    let sink = EventSink::new(Box::new(events));

    loop {
        match read_command(&mut commands).await? {
            None => {
                tracing::debug!("Command stream closed");
                break;
            }
            Some(Command::Shutdown) => {
                tracing::info!("Received shutdown command");
                break;
            }
            Some(Command::Execute { action_id, payload }) => {
                tracing::debug!(%action_id, "Executing command");
                let result = handler.execute(&action_id, payload, &sink).await?;
                if result.action_id != action_id {
                    tracing::warn!(
                        %action_id,
                        result_action_id = %result.action_id,
                        "Handler returned a result for a different action"
                    );
                }
                tracing::debug!(%action_id, exit_code = result.exit_code, "Command finished");
                sink.send(result).await?;
            }
        }
    }

    sink.close().await
}

/// Open the pipes named in the environment and serve commands on them.
#[cfg(unix)]
pub async fn run_worker_from_env<H>(handler: &H) -> io::Result<()>
where
    H: CommandHandler + ?Sized,
{
    use crate::bridge::protocol::{ENV_COMMAND_PIPE, ENV_EVENT_PIPE};
    use tokio::net::unix::pipe::OpenOptions;

    let command_pipe = pipe_from_env(ENV_COMMAND_PIPE)?;
    let event_pipe = pipe_from_env(ENV_EVENT_PIPE)?;
    tracing::debug!(%command_pipe, %event_pipe, "Opening worker tool pipes");

    let commands = OpenOptions::new().open_receiver(&command_pipe)?;
    let events = OpenOptions::new().open_sender(&event_pipe)?;
    run_worker(commands, events, handler).await
}

#[cfg(not(unix))]
pub async fn run_worker_from_env<H>(_handler: &H) -> io::Result<()>
where
    H: CommandHandler + ?Sized,
{
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "worker tool pipes are only supported on unix",
    ))
}

#[cfg(unix)]
fn pipe_from_env(var: &str) -> io::Result<String> {
    std::env::var(var).map_err(|_| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("{} is not set", var),
        )
    })
}
