//! Worker tool executor - owns one launched worker's transport and command lifecycle.
//!
//! Flow:
//! 1. Create the command pipe, launch the worker with its name in the environment
//! 2. Start the event listener: results go to the correlator, everything else
//!    to the execution context
//! 3. Execute commands one at a time, each waiting for its ResultEvent
//! 4. Shutdown: send SHUTDOWN_COMMAND, fail any pending action, wait for the
//!    process to exit, close the pipes
//!
//! States: `NotLaunched → Launched → (Executing → Launched)* → ShuttingDown → Terminated`.

use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::process::Child;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;

use crate::bridge::codec::JsonCodec;
use crate::bridge::framing::{close_writer, write_execute_command, write_shutdown_command};
use crate::bridge::pipe::{NamedPipe, PipeWriter};
use crate::bridge::protocol::{ENV_COMMAND_PIPE, EventType, ResultEvent};
use crate::config::WorkerToolConfig;
use crate::context::{DownwardApiExecutionContext, SharedContext};
use crate::correlation::{ResultCorrelator, ResultEventHandler};
use crate::dispatch::{DefaultEventHandler, EventDispatcher};
use crate::error::{ExecuteError, LaunchError};
use crate::launcher::{ProcessOutput, ProcessParams, wait_for_exit};
use crate::listener::spawn_event_listener;

pub type CommandWriter = FramedWrite<PipeWriter, JsonCodec>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorState {
    NotLaunched,
    Launched,
    /// Launched with one action awaiting its result.
    Executing,
    ShuttingDown,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    NotLaunched,
    Launched,
    ShuttingDown,
    Terminated,
}

struct Running {
    child: Child,
    command_pipe: Box<dyn NamedPipe>,
    event_pipe: Option<Box<dyn NamedPipe>>,
    listener: JoinHandle<()>,
}

/// Drives one worker tool process over the worker tool protocol.
///
/// All methods take `&self`; share it behind an `Arc` to shut down from
/// another task while a command is in flight.
pub struct WorkerToolExecutor {
    config: WorkerToolConfig,
    context: Arc<SharedContext>,
    correlator: Arc<ResultCorrelator>,
    lifecycle: StdMutex<Lifecycle>,
    writer: tokio::sync::Mutex<Option<CommandWriter>>,
    running: tokio::sync::Mutex<Option<Running>>,
    /// Cancelled when shutdown starts; releases callers still sending a command.
    closing: CancellationToken,
}

impl WorkerToolExecutor {
    pub fn new(config: WorkerToolConfig, context: DownwardApiExecutionContext) -> Self {
        Self {
            config,
            context: SharedContext::new(context),
            correlator: ResultCorrelator::new(),
            lifecycle: StdMutex::new(Lifecycle::NotLaunched),
            writer: tokio::sync::Mutex::new(None),
            running: tokio::sync::Mutex::new(None),
            closing: CancellationToken::new(),
        }
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> ExecutorState {
        match *self.lifecycle() {
            Lifecycle::NotLaunched => ExecutorState::NotLaunched,
            Lifecycle::Launched if self.correlator.outstanding().is_some() => {
                ExecutorState::Executing
            }
            Lifecycle::Launched => ExecutorState::Launched,
            Lifecycle::ShuttingDown => ExecutorState::ShuttingDown,
            Lifecycle::Terminated => ExecutorState::Terminated,
        }
    }

    /// The execution context events are currently posted through.
    pub fn context(&self) -> DownwardApiExecutionContext {
        self.context.current()
    }

    /// Launch the worker tool. May be called once.
    pub async fn launch_worker(&self) -> Result<(), LaunchError> {
        {
            let mut lifecycle = self.lifecycle();
            if *lifecycle != Lifecycle::NotLaunched {
                return Err(LaunchError::AlreadyLaunched);
            }
            *lifecycle = Lifecycle::Launched;
        }

        if let Err(e) = self.start().await {
            tracing::error!(error = %e, command = ?self.config.command, "Failed to launch worker tool");
            self.correlator.close();
            *self.lifecycle() = Lifecycle::Terminated;
            return Err(e);
        }
        Ok(())
    }

    async fn start(&self) -> Result<(), LaunchError> {
        let (command_pipe, stream) = self
            .config
            .pipe_factory
            .create_writer()
            .map_err(LaunchError::Pipe)?;
        tracing::debug!(pipe = %command_pipe.name(), "Created command pipe");

        let mut env = self.config.env.clone();
        env.insert(ENV_COMMAND_PIPE.to_string(), command_pipe.name().to_string());
        let params = ProcessParams {
            command: self.config.command.clone(),
            env,
        };

        let launched = match self.config.launcher().launch(params) {
            Ok(launched) => launched,
            Err(e) => {
                drop(stream);
                close_pipe(command_pipe, "command");
                return Err(e);
            }
        };

        let dispatcher = EventDispatcher::new(Arc::new(DefaultEventHandler::new(Arc::clone(
            &self.context,
        ))))
        .with_handler(
            EventType::ResultEvent,
            Arc::new(ResultEventHandler::new(Arc::clone(&self.correlator))),
        );
        let listener = spawn_event_listener(launched.events, dispatcher);

        tracing::info!(
            pid = ?launched.child.id(),
            command = ?self.config.command,
            pipe = %command_pipe.name(),
            "Launched worker tool"
        );

        *self.writer.lock().await = Some(FramedWrite::new(stream, JsonCodec::new()));
        *self.running.lock().await = Some(Running {
            child: launched.child,
            command_pipe,
            event_pipe: launched.event_pipe,
            listener,
        });
        Ok(())
    }

    /// Send `action_id` with `payload` and wait for its `ResultEvent`.
    ///
    /// Only one action may be in flight; an overlapping call fails with
    /// [`ExecuteError::CommandInFlight`] without touching the worker.
    pub async fn execute_command<P>(
        &self,
        action_id: &str,
        payload: &P,
    ) -> Result<ResultEvent, ExecuteError>
    where
        P: Serialize + Sync + ?Sized,
    {
        match *self.lifecycle() {
            Lifecycle::NotLaunched => return Err(ExecuteError::NotLaunched),
            Lifecycle::ShuttingDown | Lifecycle::Terminated => return Err(ExecuteError::Terminated),
            Lifecycle::Launched => {}
        }
        if self.config.interrupt.is_cancelled() {
            return Err(ExecuteError::Interrupted {
                action_id: action_id.to_string(),
            });
        }

        // Reserved before writing so the result cannot race ahead of the waiter.
        let pending = self.correlator.begin(action_id)?;
        let written = tokio::select! {
            biased;

            _ = self.closing.cancelled() => None,
            written = self.send_execute_command(action_id, payload) => Some(written),
        };
        match written {
            Some(Ok(())) => {}
            Some(Err(e)) => {
                pending.discard();
                return Err(e);
            }
            None => {
                pending.discard();
                tracing::warn!(%action_id, "Shutdown started before execute command was sent");
                return Err(ExecuteError::NoResult {
                    action_id: action_id.to_string(),
                });
            }
        }

        tracing::info!(%action_id, "Started execution of worker tool");
        pending.wait(&self.config.interrupt).await
    }

    async fn send_execute_command<P>(&self, action_id: &str, payload: &P) -> Result<(), ExecuteError>
    where
        P: Serialize + Sync + ?Sized,
    {
        let mut writer = self.writer.lock().await;
        let Some(writer) = writer.as_mut() else {
            return Err(ExecuteError::NotLaunched);
        };
        write_execute_command(writer, action_id, payload)
            .await
            .map_err(|source| {
                tracing::error!(%action_id, error = %source, "Failed to write execute command");
                ExecuteError::Write {
                    action_id: action_id.to_string(),
                    source,
                }
            })
    }

    /// Tear the worker down. Never fails; problems are logged.
    pub async fn shutdown(&self) {
        let previous = {
            let mut lifecycle = self.lifecycle();
            let previous = *lifecycle;
            *lifecycle = match previous {
                Lifecycle::Launched => Lifecycle::ShuttingDown,
                Lifecycle::NotLaunched => Lifecycle::Terminated,
                other => other,
            };
            previous
        };
        match previous {
            Lifecycle::Launched => {}
            Lifecycle::NotLaunched => {
                self.correlator.close();
                tracing::debug!("Shutdown requested before worker tool was launched");
                return;
            }
            Lifecycle::ShuttingDown | Lifecycle::Terminated => {
                tracing::debug!("Worker tool already shut down");
                return;
            }
        }

        self.closing.cancel();
        self.send_shutdown_command().await;

        if let Some(action_id) = self.correlator.close() {
            tracing::warn!(%action_id, "No ResultEvent was received before shutdown");
        }

        let running = self.running.lock().await.take();
        if let Some(mut running) = running {
            self.wait_till_process_finish(&mut running.child).await;
            self.close_command_stream().await;
            running.listener.abort();
            close_pipe(running.command_pipe, "command");
            if let Some(event_pipe) = running.event_pipe {
                close_pipe(event_pipe, "event");
            }
        } else {
            self.close_command_stream().await;
        }

        *self.lifecycle() = Lifecycle::Terminated;
        tracing::info!("Worker tool shut down");
    }

    async fn send_shutdown_command(&self) {
        let sent = tokio::time::timeout(self.config.shutdown_timeout, async {
            let mut writer = self.writer.lock().await;
            match writer.as_mut() {
                Some(writer) => write_shutdown_command(writer).await,
                None => Ok(()),
            }
        })
        .await;

        match sent {
            Ok(Ok(())) => tracing::debug!("Sent shutdown command"),
            Ok(Err(e)) => {
                tracing::error!(error = %e, "Cannot write shutdown command to command pipe")
            }
            Err(_) => tracing::error!("Timed out writing shutdown command to command pipe"),
        }
    }

    async fn wait_till_process_finish(&self, child: &mut Child) {
        match wait_for_exit(child, self.config.shutdown_timeout).await {
            Ok(ProcessOutput {
                status: Ok(status),
                stdout,
                stderr,
            }) => {
                if status.success() {
                    tracing::debug!(%stdout, %stderr, "Worker tool exited");
                } else {
                    tracing::error!(
                        exit_code = ?status.code(),
                        %stdout,
                        %stderr,
                        "Worker tool exited with failure"
                    );
                }
            }
            Ok(ProcessOutput { status: Err(e), .. }) => {
                tracing::error!(error = %e, "Failed to wait for worker tool process");
            }
            Err(timeout) => {
                tracing::debug!(%timeout, "Reporting worker tool shutdown timeout");
                (self.config.timeout_reporter)(&self.config.command);
            }
        }
    }

    async fn close_command_stream(&self) {
        let closed = tokio::time::timeout(self.config.shutdown_timeout, async {
            let writer = self.writer.lock().await.take();
            match writer {
                Some(mut writer) => close_writer(&mut writer).await,
                None => Ok(()),
            }
        })
        .await;

        match closed {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!(error = %e, "Cannot close command pipe output stream"),
            Err(_) => tracing::error!("Timed out closing command pipe output stream"),
        }
    }

    /// Tag events from now on with the calling thread.
    ///
    /// Start time, started-event correlations and any in-flight action are kept.
    pub fn update_thread_id(&self) {
        let thread_id = std::thread::current().id();
        tracing::trace!(?thread_id, "Rebinding execution context");
        self.context.rebind(thread_id);
    }
}

impl Drop for WorkerToolExecutor {
    fn drop(&mut self) {
        let lifecycle = *self.lifecycle();
        if matches!(lifecycle, Lifecycle::Launched | Lifecycle::ShuttingDown) {
            tracing::warn!(command = ?self.config.command, "Worker tool executor dropped without shutdown");
            self.correlator.close();
        }
    }
}

fn close_pipe(pipe: Box<dyn NamedPipe>, kind: &str) {
    let name = pipe.name().to_string();
    if let Err(e) = pipe.close() {
        tracing::error!(error = %e, pipe = %name, kind, "Cannot close named pipe");
    }
}
