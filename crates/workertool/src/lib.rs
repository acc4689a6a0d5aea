//! workertool: launch long-lived worker tool processes and drive them over named pipes.

pub mod bridge;
pub mod config;
pub mod context;
pub mod correlation;
pub mod dispatch;
pub mod error;
pub mod event_bus;
pub mod executor;
pub mod launcher;
pub mod listener;
pub mod logging;
pub mod worker;

pub use bridge::protocol::{ENV_COMMAND_PIPE, ENV_EVENT_PIPE, ResultEvent};
pub use config::{DEFAULT_SHUTDOWN_TIMEOUT, TimeoutReporter, WorkerToolConfig};
pub use context::{Clock, DownwardApiExecutionContext, SystemClock};
pub use error::{ExecuteError, LaunchError, ProtocolViolation};
pub use event_bus::{BusEvent, ChannelEventBus, IsolatedEventBus, PostedEvent};
pub use executor::{ExecutorState, WorkerToolExecutor};
pub use worker::{CommandHandler, EventSink, run_worker, run_worker_from_env};
