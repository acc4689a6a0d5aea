//! Wire protocol types for executor-worker communication.
//!
//! Two channels:
//! - **Command pipe** (executor → worker): `CommandTypeMessage` envelope, then the
//!   command body, then (for executions) the caller's payload.
//! - **Event pipe** (worker → executor): `EventTypeMessage` envelope, then the event body.

use std::collections::BTreeMap;
use std::io;

use serde::{Deserialize, Serialize};

use super::codec::Frame;

/// Environment variable naming the command pipe the worker must read from.
pub const ENV_COMMAND_PIPE: &str = "WORKER_TOOL_COMMAND_PIPE";

/// Environment variable naming the event pipe the worker must write to.
pub const ENV_EVENT_PIPE: &str = "WORKER_TOOL_EVENT_PIPE";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandType {
    ExecuteCommand,
    ShutdownCommand,
}

/// Envelope written immediately before every command body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandTypeMessage {
    pub command_type: CommandType,
}

impl CommandTypeMessage {
    pub fn new(command_type: CommandType) -> Self {
        Self { command_type }
    }
}

/// Names the unit of work. The task payload follows as its own frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteCommand {
    pub action_id: String,
}

/// Asks the worker to finish and exit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownCommand {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    ConsoleEvent,
    LogEvent,
    StepEvent,
    ChromeTraceEvent,
    ExternalEvent,
    ResultEvent,
}

/// Envelope written immediately before every event body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventTypeMessage {
    pub event_type: EventType,
}

impl EventTypeMessage {
    pub fn new(event_type: EventType) -> Self {
        Self { event_type }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Fatal,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Message meant for the user's console.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsoleEvent {
    pub log_level: LogLevel,
    pub message: String,
}

/// Diagnostic log line from inside the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEvent {
    pub log_level: LogLevel,
    pub logger_name: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Started,
    Finished,
}

/// Start or end of a build step running inside the worker.
///
/// `duration_ms` is the offset from the start of the execution, not the
/// length of the step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepEvent {
    pub event_id: i32,
    pub step_status: StepStatus,
    pub step_type: String,
    pub description: String,
    #[serde(default)]
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceStatus {
    Begin,
    End,
}

/// Begin or end of a performance trace section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChromeTraceEvent {
    pub event_id: i32,
    pub category: String,
    pub title: String,
    pub status: TraceStatus,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub duration_ms: u64,
}

/// Opaque key/value event forwarded to listeners outside the build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalEvent {
    pub data: BTreeMap<String, String>,
}

/// Completion notice for one executed action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultEvent {
    pub action_id: String,
    pub exit_code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ResultEvent {
    pub fn success(action_id: impl Into<String>) -> Self {
        Self {
            action_id: action_id.into(),
            exit_code: 0,
            message: None,
        }
    }

    pub fn failure(action_id: impl Into<String>, exit_code: i32, message: impl Into<String>) -> Self {
        Self {
            action_id: action_id.into(),
            exit_code,
            message: Some(message.into()),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Any event body that can follow an `EventTypeMessage`.
///
/// Serializes as the bare body; the kind travels in the envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum DownwardEvent {
    Console(ConsoleEvent),
    Log(LogEvent),
    Step(StepEvent),
    ChromeTrace(ChromeTraceEvent),
    External(ExternalEvent),
    Result(ResultEvent),
}

impl DownwardEvent {
    pub fn event_type(&self) -> EventType {
        match self {
            Self::Console(_) => EventType::ConsoleEvent,
            Self::Log(_) => EventType::LogEvent,
            Self::Step(_) => EventType::StepEvent,
            Self::ChromeTrace(_) => EventType::ChromeTraceEvent,
            Self::External(_) => EventType::ExternalEvent,
            Self::Result(_) => EventType::ResultEvent,
        }
    }

    /// Decode the body frame that followed an envelope of `event_type`.
    pub fn decode(event_type: EventType, frame: &Frame) -> io::Result<Self> {
        Ok(match event_type {
            EventType::ConsoleEvent => Self::Console(frame.parse()?),
            EventType::LogEvent => Self::Log(frame.parse()?),
            EventType::StepEvent => Self::Step(frame.parse()?),
            EventType::ChromeTraceEvent => Self::ChromeTrace(frame.parse()?),
            EventType::ExternalEvent => Self::External(frame.parse()?),
            EventType::ResultEvent => Self::Result(frame.parse()?),
        })
    }
}

impl From<ConsoleEvent> for DownwardEvent {
    fn from(event: ConsoleEvent) -> Self {
        Self::Console(event)
    }
}

impl From<LogEvent> for DownwardEvent {
    fn from(event: LogEvent) -> Self {
        Self::Log(event)
    }
}

impl From<StepEvent> for DownwardEvent {
    fn from(event: StepEvent) -> Self {
        Self::Step(event)
    }
}

impl From<ChromeTraceEvent> for DownwardEvent {
    fn from(event: ChromeTraceEvent) -> Self {
        Self::ChromeTrace(event)
    }
}

impl From<ExternalEvent> for DownwardEvent {
    fn from(event: ExternalEvent) -> Self {
        Self::External(event)
    }
}

impl From<ResultEvent> for DownwardEvent {
    fn from(event: ResultEvent) -> Self {
        Self::Result(event)
    }
}

/// A fully read command, as seen from the worker side.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Execute {
        action_id: String,
        payload: serde_json::Value,
    },
    Shutdown,
}
