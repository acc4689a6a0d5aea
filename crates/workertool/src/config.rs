//! Worker tool executor configuration.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::bridge::pipe::{FifoPipeFactory, PipeFactory};
use crate::launcher::{ProcessLauncher, WorkerLauncher};

/// How long shutdown waits for the worker process to exit.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// Called with the worker's command line when it outlives the shutdown timeout.
pub type TimeoutReporter = Arc<dyn Fn(&[String]) + Send + Sync>;

pub struct WorkerToolConfig {
    pub command: Vec<String>,
    /// Extra environment for the worker, on top of the pipe names.
    pub env: HashMap<String, String>,
    pub shutdown_timeout: Duration,
    pub pipe_factory: Arc<dyn PipeFactory>,
    /// Defaults to a [`ProcessLauncher`] over `pipe_factory`.
    pub launcher: Option<Arc<dyn WorkerLauncher>>,
    pub timeout_reporter: TimeoutReporter,
    /// Interrupts a caller blocked in `execute_command`. Never reset once cancelled.
    pub interrupt: CancellationToken,
}

impl WorkerToolConfig {
    pub fn new<I, S>(command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command: command.into_iter().map(Into::into).collect(),
            env: HashMap::new(),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            pipe_factory: Arc::new(FifoPipeFactory::new()),
            launcher: None,
            timeout_reporter: Arc::new(log_shutdown_timeout),
            interrupt: CancellationToken::new(),
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_pipe_factory(mut self, pipe_factory: Arc<dyn PipeFactory>) -> Self {
        self.pipe_factory = pipe_factory;
        self
    }

    pub fn with_launcher(mut self, launcher: Arc<dyn WorkerLauncher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    pub fn with_timeout_reporter(mut self, reporter: TimeoutReporter) -> Self {
        self.timeout_reporter = reporter;
        self
    }

    pub fn with_interrupt(mut self, interrupt: CancellationToken) -> Self {
        self.interrupt = interrupt;
        self
    }

    pub fn launcher(&self) -> Arc<dyn WorkerLauncher> {
        match &self.launcher {
            Some(launcher) => Arc::clone(launcher),
            None => Arc::new(ProcessLauncher::new(Arc::clone(&self.pipe_factory))),
        }
    }
}

fn log_shutdown_timeout(command: &[String]) {
    tracing::error!(
        ?command,
        "Timeout while waiting for a launched worker tool process to terminate"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = WorkerToolConfig::new(["java", "-jar", "worker.jar"]);
        assert_eq!(config.command, vec!["java", "-jar", "worker.jar"]);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(2));
        assert!(config.env.is_empty());
        assert!(config.launcher.is_none());
        assert!(!config.interrupt.is_cancelled());
    }

    #[test]
    fn builder_overrides() {
        let interrupt = CancellationToken::new();
        let config = WorkerToolConfig::new(vec!["worker".to_string()])
            .with_env("JAVA_HOME", "/opt/jdk")
            .with_shutdown_timeout(Duration::from_millis(250))
            .with_interrupt(interrupt.clone());

        assert_eq!(config.env.get("JAVA_HOME").map(String::as_str), Some("/opt/jdk"));
        assert_eq!(config.shutdown_timeout, Duration::from_millis(250));

        interrupt.cancel();
        assert!(config.interrupt.is_cancelled());
    }
}
