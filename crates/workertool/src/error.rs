use std::io;

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("worker tool was already launched")]
    AlreadyLaunched,
    #[error("worker tool command is empty")]
    EmptyCommand,
    #[error("failed to create named pipe: {0}")]
    Pipe(#[source] io::Error),
    #[error("failed to spawn worker tool process: {0}")]
    Spawn(#[source] io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum ExecuteError {
    #[error("worker tool has not been launched")]
    NotLaunched,
    #[error("worker tool has been shut down")]
    Terminated,
    #[error("cannot execute {action_id}: action {outstanding} is still in flight")]
    CommandInFlight {
        action_id: String,
        outstanding: String,
    },
    #[error("failed to send command for action {action_id}: {source}")]
    Write {
        action_id: String,
        #[source]
        source: io::Error,
    },
    #[error("interrupted while waiting for result of action {action_id}")]
    Interrupted { action_id: String },
    #[error("no result received for action {action_id}")]
    NoResult { action_id: String },
}

/// The worker broke the one-result-per-command contract.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolViolation {
    #[error("received result for action {actual} while waiting for {expected}")]
    UnexpectedAction { expected: String, actual: String },
    #[error("received result for action {actual} with no action in flight")]
    NoOutstandingAction { actual: String },
}
