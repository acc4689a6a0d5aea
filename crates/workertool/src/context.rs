//! Downward API execution context.
//!
//! Correlates "started" events with their later "finished" counterparts and
//! posts decoded events into the event bus on behalf of the invoking thread.

use std::sync::{Arc, PoisonError, RwLock};
use std::thread::ThreadId;
use std::time::SystemTime;

use dashmap::DashMap;

use crate::event_bus::{BusEvent, IsolatedEventBus, PerfStarted, StepStarted};

/// Source of wall-clock time.
pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// Per-invocation correlation state.
///
/// Start time, bus and thread id are fixed once built. The started-event maps
/// are shared between a context and every context derived from it with
/// [`from_context`](Self::from_context), so correlations already in flight
/// survive a move to another thread.
#[derive(Clone)]
pub struct DownwardApiExecutionContext {
    start_execution_instant: SystemTime,
    event_bus: Arc<dyn IsolatedEventBus>,
    invoking_thread_id: ThreadId,
    step_started_events: Arc<DashMap<i32, StepStarted>>,
    chrome_trace_started_events: Arc<DashMap<i32, PerfStarted>>,
}

impl std::fmt::Debug for DownwardApiExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownwardApiExecutionContext")
            .field("start_execution_instant", &self.start_execution_instant)
            .field("invoking_thread_id", &self.invoking_thread_id)
            .field("step_started_events", &self.step_started_events.len())
            .field(
                "chrome_trace_started_events",
                &self.chrome_trace_started_events.len(),
            )
            .finish()
    }
}

impl DownwardApiExecutionContext {
    /// Capture the current time and the calling thread.
    pub fn of(event_bus: Arc<dyn IsolatedEventBus>, clock: &dyn Clock) -> Self {
        Self {
            start_execution_instant: clock.now(),
            event_bus,
            invoking_thread_id: std::thread::current().id(),
            step_started_events: Arc::new(DashMap::new()),
            chrome_trace_started_events: Arc::new(DashMap::new()),
        }
    }

    /// Same start time, bus and started-event maps as `context`, tagged with `thread_id`.
    pub fn from_context(context: &Self, thread_id: ThreadId) -> Self {
        Self {
            invoking_thread_id: thread_id,
            ..context.clone()
        }
    }

    pub fn start_execution_instant(&self) -> SystemTime {
        self.start_execution_instant
    }

    pub fn invoking_thread_id(&self) -> ThreadId {
        self.invoking_thread_id
    }

    pub fn event_bus(&self) -> &Arc<dyn IsolatedEventBus> {
        &self.event_bus
    }

    pub fn step_started_events(&self) -> &DashMap<i32, StepStarted> {
        &self.step_started_events
    }

    pub fn chrome_trace_started_events(&self) -> &DashMap<i32, PerfStarted> {
        &self.chrome_trace_started_events
    }

    pub fn post_event(&self, event: impl Into<BusEvent>) {
        self.event_bus.post(event.into(), self.invoking_thread_id);
    }

    /// Post an event that occurred at `at`.
    pub fn post_event_at(&self, event: impl Into<BusEvent>, at: SystemTime) {
        self.event_bus
            .post_at(event.into(), at, self.invoking_thread_id);
    }
}

/// The context currently in effect for one launched worker.
///
/// Shared between the executor, which rebinds it, and the event listener,
/// which posts through it.
#[derive(Debug)]
pub struct SharedContext {
    current: RwLock<DownwardApiExecutionContext>,
}

impl SharedContext {
    pub fn new(context: DownwardApiExecutionContext) -> Arc<Self> {
        Arc::new(Self {
            current: RwLock::new(context),
        })
    }

    pub fn current(&self) -> DownwardApiExecutionContext {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn rebind(&self, thread_id: ThreadId) {
        let mut current = self
            .current
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        *current = DownwardApiExecutionContext::from_context(&current, thread_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::{ConsoleEvent, LogLevel};
    use crate::event_bus::{ChannelEventBus, PostedEvent};
    use std::time::Duration;

    struct FixedClock(SystemTime);

    impl Clock for FixedClock {
        fn now(&self) -> SystemTime {
            self.0
        }
    }

    fn other_thread_id() -> ThreadId {
        std::thread::spawn(|| std::thread::current().id())
            .join()
            .unwrap()
    }

    fn console(message: &str) -> ConsoleEvent {
        ConsoleEvent {
            log_level: LogLevel::Info,
            message: message.to_string(),
        }
    }

    fn started(event_id: i32) -> StepStarted {
        StepStarted {
            event_id,
            step_type: "javac".to_string(),
            description: "compile".to_string(),
            at: SystemTime::UNIX_EPOCH,
        }
    }

    #[test]
    fn of_captures_clock_and_thread() {
        let (bus, _rx) = ChannelEventBus::new();
        let start = SystemTime::UNIX_EPOCH + Duration::from_secs(42);
        let context = DownwardApiExecutionContext::of(Arc::new(bus), &FixedClock(start));

        assert_eq!(context.start_execution_instant(), start);
        assert_eq!(context.invoking_thread_id(), std::thread::current().id());
    }

    #[test]
    fn post_event_tags_invoking_thread() {
        let (bus, mut rx) = ChannelEventBus::new();
        let context = DownwardApiExecutionContext::of(Arc::new(bus), &SystemClock);

        context.post_event(console("hi"));
        let at = SystemTime::UNIX_EPOCH + Duration::from_millis(5);
        context.post_event_at(console("later"), at);

        assert_eq!(
            rx.try_recv().unwrap(),
            PostedEvent {
                event: BusEvent::Console(console("hi")),
                at: None,
                thread_id: std::thread::current().id(),
            }
        );
        assert_eq!(rx.try_recv().unwrap().at, Some(at));
    }

    #[test]
    fn from_context_keeps_start_and_bus() {
        let (bus, mut rx) = ChannelEventBus::new();
        let start = SystemTime::UNIX_EPOCH + Duration::from_secs(7);
        let context = DownwardApiExecutionContext::of(Arc::new(bus), &FixedClock(start));

        let thread_id = other_thread_id();
        let rebound = DownwardApiExecutionContext::from_context(&context, thread_id);

        assert_eq!(rebound.start_execution_instant(), start);
        assert!(Arc::ptr_eq(rebound.event_bus(), context.event_bus()));
        assert_eq!(rebound.invoking_thread_id(), thread_id);
        assert_eq!(context.invoking_thread_id(), std::thread::current().id());

        rebound.post_event(console("moved"));
        assert_eq!(rx.try_recv().unwrap().thread_id, thread_id);
    }

    #[test]
    fn started_maps_survive_rebind() {
        let (bus, _rx) = ChannelEventBus::new();
        let context = DownwardApiExecutionContext::of(Arc::new(bus), &SystemClock);
        context.step_started_events().insert(1, started(1));

        let rebound = DownwardApiExecutionContext::from_context(&context, other_thread_id());
        assert!(rebound.step_started_events().remove(&1).is_some());
        assert!(context.step_started_events().is_empty());
    }

    #[test]
    fn started_maps_accept_concurrent_writers() {
        let (bus, _rx) = ChannelEventBus::new();
        let context = DownwardApiExecutionContext::of(Arc::new(bus), &SystemClock);

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let context = context.clone();
                std::thread::spawn(move || {
                    for i in 0..50 {
                        context.step_started_events().insert(t * 100 + i, started(i));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(context.step_started_events().len(), 200);
    }

    #[test]
    fn shared_context_rebinds_in_place() {
        let (bus, mut rx) = ChannelEventBus::new();
        let shared = SharedContext::new(DownwardApiExecutionContext::of(
            Arc::new(bus),
            &SystemClock,
        ));
        let start = shared.current().start_execution_instant();

        let thread_id = other_thread_id();
        shared.rebind(thread_id);

        let current = shared.current();
        assert_eq!(current.invoking_thread_id(), thread_id);
        assert_eq!(current.start_execution_instant(), start);

        current.post_event(console("after rebind"));
        assert_eq!(rx.try_recv().unwrap().thread_id, thread_id);
    }
}
