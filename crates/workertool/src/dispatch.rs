//! Per-event-kind dispatch for decoded downward events.
//!
//! The executor registers its result handler for `RESULT_EVENT`; every other
//! kind, including ones added later, falls through to the default handler.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::bridge::protocol::{
    ChromeTraceEvent, DownwardEvent, EventType, LogEvent, LogLevel, StepEvent, StepStatus,
    TraceStatus,
};
use crate::context::{DownwardApiExecutionContext, SharedContext};
use crate::error::ProtocolViolation;
use crate::event_bus::{PerfFinished, PerfStarted, StepFinished, StepStarted};

/// Handles one decoded event on the listener task.
///
/// Must not block: the listener is the only reader of the event pipe.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: DownwardEvent) -> Result<(), ProtocolViolation>;
}

pub struct EventDispatcher {
    handlers: HashMap<EventType, Arc<dyn EventHandler>>,
    fallback: Arc<dyn EventHandler>,
}

impl EventDispatcher {
    pub fn new(fallback: Arc<dyn EventHandler>) -> Self {
        Self {
            handlers: HashMap::new(),
            fallback,
        }
    }

    pub fn with_handler(mut self, event_type: EventType, handler: Arc<dyn EventHandler>) -> Self {
        self.handlers.insert(event_type, handler);
        self
    }

    pub fn dispatch(&self, event: DownwardEvent) -> Result<(), ProtocolViolation> {
        let handler = self
            .handlers
            .get(&event.event_type())
            .unwrap_or(&self.fallback);
        handler.handle(event)
    }
}

/// Posts events into the event bus through the current execution context.
pub struct DefaultEventHandler {
    context: Arc<SharedContext>,
}

impl DefaultEventHandler {
    pub fn new(context: Arc<SharedContext>) -> Self {
        Self { context }
    }
}

impl EventHandler for DefaultEventHandler {
    fn handle(&self, event: DownwardEvent) -> Result<(), ProtocolViolation> {
        let context = self.context.current();
        match event {
            DownwardEvent::Console(console) => context.post_event(console),
            DownwardEvent::External(external) => context.post_event(external),
            DownwardEvent::Log(log) => emit_log(&log),
            DownwardEvent::Step(step) => handle_step(&context, step),
            DownwardEvent::ChromeTrace(trace) => handle_chrome_trace(&context, trace),
            DownwardEvent::Result(result) => {
                tracing::warn!(action_id = %result.action_id, "Result event with no registered handler, dropping");
            }
        }
        Ok(())
    }
}

fn event_time(context: &DownwardApiExecutionContext, duration_ms: u64) -> SystemTime {
    context.start_execution_instant() + Duration::from_millis(duration_ms)
}

fn handle_step(context: &DownwardApiExecutionContext, step: StepEvent) {
    let at = event_time(context, step.duration_ms);
    match step.step_status {
        StepStatus::Started => {
            let started = StepStarted {
                event_id: step.event_id,
                step_type: step.step_type,
                description: step.description,
                at,
            };
            context
                .step_started_events()
                .insert(step.event_id, started.clone());
            context.post_event_at(started, at);
        }
        StepStatus::Finished => {
            let Some((_, started)) = context.step_started_events().remove(&step.event_id) else {
                tracing::warn!(event_id = step.event_id, step_type = %step.step_type, "Step finished without a matching start");
                return;
            };
            let elapsed = at.duration_since(started.at).unwrap_or_default();
            context.post_event_at(
                StepFinished {
                    started,
                    at,
                    elapsed,
                },
                at,
            );
        }
    }
}

fn handle_chrome_trace(context: &DownwardApiExecutionContext, trace: ChromeTraceEvent) {
    let at = event_time(context, trace.duration_ms);
    match trace.status {
        TraceStatus::Begin => {
            let started = PerfStarted {
                event_id: trace.event_id,
                category: trace.category,
                title: trace.title,
                attributes: trace.attributes,
                at,
            };
            context
                .chrome_trace_started_events()
                .insert(trace.event_id, started.clone());
            context.post_event_at(started, at);
        }
        TraceStatus::End => {
            let Some((_, started)) = context
                .chrome_trace_started_events()
                .remove(&trace.event_id)
            else {
                tracing::warn!(event_id = trace.event_id, title = %trace.title, "Chrome trace ended without a matching begin");
                return;
            };
            let elapsed = at.duration_since(started.at).unwrap_or_default();
            context.post_event_at(
                PerfFinished {
                    started,
                    attributes: trace.attributes,
                    at,
                    elapsed,
                },
                at,
            );
        }
    }
}

fn emit_log(log: &LogEvent) {
    let logger = log.logger_name.as_str();
    let message = log.message.as_str();
    match log.log_level {
        LogLevel::Fatal | LogLevel::Error => {
            tracing::error!(target: "workertool::downward", %logger, "{}", message)
        }
        LogLevel::Warn => tracing::warn!(target: "workertool::downward", %logger, "{}", message),
        LogLevel::Info => tracing::info!(target: "workertool::downward", %logger, "{}", message),
        LogLevel::Debug => tracing::debug!(target: "workertool::downward", %logger, "{}", message),
        LogLevel::Trace => tracing::trace!(target: "workertool::downward", %logger, "{}", message),
    }
}
