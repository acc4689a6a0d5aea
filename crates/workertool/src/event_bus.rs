//! Event bus the execution context posts into.
//!
//! The bus is an explicit dependency handed to each context; there is no
//! process-wide instance.

use std::collections::BTreeMap;
use std::thread::ThreadId;
use std::time::{Duration, SystemTime};

use tokio::sync::mpsc;

use crate::bridge::protocol::{ConsoleEvent, ExternalEvent};

/// Record of a step that has started and not yet finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepStarted {
    pub event_id: i32,
    pub step_type: String,
    pub description: String,
    pub at: SystemTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepFinished {
    pub started: StepStarted,
    pub at: SystemTime,
    pub elapsed: Duration,
}

/// Record of a performance trace section that has begun and not yet ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PerfStarted {
    pub event_id: i32,
    pub category: String,
    pub title: String,
    pub attributes: BTreeMap<String, String>,
    pub at: SystemTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PerfFinished {
    pub started: PerfStarted,
    pub attributes: BTreeMap<String, String>,
    pub at: SystemTime,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    Console(ConsoleEvent),
    StepStarted(StepStarted),
    StepFinished(StepFinished),
    PerfStarted(PerfStarted),
    PerfFinished(PerfFinished),
    External(ExternalEvent),
}

impl From<ConsoleEvent> for BusEvent {
    fn from(event: ConsoleEvent) -> Self {
        Self::Console(event)
    }
}

impl From<ExternalEvent> for BusEvent {
    fn from(event: ExternalEvent) -> Self {
        Self::External(event)
    }
}

impl From<StepStarted> for BusEvent {
    fn from(event: StepStarted) -> Self {
        Self::StepStarted(event)
    }
}

impl From<StepFinished> for BusEvent {
    fn from(event: StepFinished) -> Self {
        Self::StepFinished(event)
    }
}

impl From<PerfStarted> for BusEvent {
    fn from(event: PerfStarted) -> Self {
        Self::PerfStarted(event)
    }
}

impl From<PerfFinished> for BusEvent {
    fn from(event: PerfFinished) -> Self {
        Self::PerfFinished(event)
    }
}

/// Sink for events observed on behalf of an invoking thread.
pub trait IsolatedEventBus: Send + Sync {
    fn post(&self, event: BusEvent, thread_id: ThreadId);

    /// Post an event whose time was captured elsewhere (e.g. on the wire).
    fn post_at(&self, event: BusEvent, at: SystemTime, thread_id: ThreadId);
}

/// An event as delivered by [`ChannelEventBus`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostedEvent {
    pub event: BusEvent,
    pub at: Option<SystemTime>,
    pub thread_id: ThreadId,
}

/// Bus that forwards every post to an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelEventBus {
    tx: mpsc::UnboundedSender<PostedEvent>,
}

impl ChannelEventBus {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PostedEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, posted: PostedEvent) {
        if self.tx.send(posted).is_err() {
            tracing::trace!("Event bus receiver dropped, discarding event");
        }
    }
}

impl IsolatedEventBus for ChannelEventBus {
    fn post(&self, event: BusEvent, thread_id: ThreadId) {
        self.send(PostedEvent {
            event,
            at: None,
            thread_id,
        });
    }

    fn post_at(&self, event: BusEvent, at: SystemTime, thread_id: ThreadId) {
        self.send(PostedEvent {
            event,
            at: Some(at),
            thread_id,
        });
    }
}
