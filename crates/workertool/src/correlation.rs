//! Single in-flight action correlation.
//!
//! The executor reserves the slot before writing a command and then waits on
//! the returned [`PendingExecution`]; the event listener resolves it when the
//! matching `ResultEvent` arrives. Both sides only ever touch the slot under a
//! short, never-awaited lock, so the listener cannot block behind the waiter.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::bridge::protocol::{DownwardEvent, ResultEvent};
use crate::dispatch::EventHandler;
use crate::error::{ExecuteError, ProtocolViolation};

enum Slot {
    Idle,
    Awaiting {
        generation: u64,
        action_id: String,
        tx: oneshot::Sender<ResultEvent>,
        /// An abandoned action whose result has not arrived yet.
        stale: Option<String>,
    },
    /// The waiter went away before its result arrived. The late result is
    /// still expected and is dropped quietly.
    Abandoned { action_id: String },
    /// Shut down; no further actions may start.
    Closed,
}

struct State {
    slot: Slot,
    next_generation: u64,
}

pub struct ResultCorrelator {
    state: Mutex<State>,
}

impl Default for ResultCorrelator {
    fn default() -> Self {
        Self {
            state: Mutex::new(State {
                slot: Slot::Idle,
                next_generation: 0,
            }),
        }
    }
}

impl ResultCorrelator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| {
            tracing::error!("Result correlator mutex poisoned - recovering");
            PoisonError::into_inner(poisoned)
        })
    }

    /// Reserve the slot for `action_id`.
    ///
    /// Fails while another action is in flight or after [`close`](Self::close).
    pub fn begin(self: &Arc<Self>, action_id: &str) -> Result<PendingExecution, ExecuteError> {
        let mut state = self.lock();
        match &state.slot {
            Slot::Awaiting {
                action_id: outstanding,
                ..
            } => {
                return Err(ExecuteError::CommandInFlight {
                    action_id: action_id.to_string(),
                    outstanding: outstanding.clone(),
                });
            }
            Slot::Closed => return Err(ExecuteError::Terminated),
            Slot::Abandoned { action_id: stale } => {
                tracing::debug!(%stale, %action_id, "Starting new action before abandoned result arrived");
            }
            Slot::Idle => {}
        }
        let stale = match &state.slot {
            Slot::Abandoned { action_id } => Some(action_id.clone()),
            _ => None,
        };

        let (tx, rx) = oneshot::channel();
        state.next_generation += 1;
        let generation = state.next_generation;
        state.slot = Slot::Awaiting {
            generation,
            action_id: action_id.to_string(),
            tx,
            stale,
        };

        Ok(PendingExecution {
            action_id: action_id.to_string(),
            generation,
            rx,
            correlator: Arc::clone(self),
        })
    }

    /// Resolve the in-flight action with `result`.
    ///
    /// A result for any other action leaves the slot untouched.
    pub fn complete(&self, result: ResultEvent) -> Result<(), ProtocolViolation> {
        let mut state = self.lock();
        let slot = std::mem::replace(&mut state.slot, Slot::Idle);

        let (slot, outcome) = match slot {
            Slot::Awaiting { action_id, tx, .. } if action_id == result.action_id => {
                if tx.send(result).is_err() {
                    tracing::debug!(%action_id, "Result arrived after waiter was dropped");
                }
                (Slot::Idle, Ok(()))
            }
            Slot::Abandoned { action_id } if action_id == result.action_id => {
                tracing::debug!(%action_id, "Dropping result for abandoned action");
                (Slot::Idle, Ok(()))
            }
            Slot::Awaiting {
                generation,
                action_id,
                tx,
                stale: Some(stale),
            } if stale == result.action_id => {
                tracing::debug!(%stale, "Dropping late result for abandoned action");
                let slot = Slot::Awaiting {
                    generation,
                    action_id,
                    tx,
                    stale: None,
                };
                (slot, Ok(()))
            }
            slot @ (Slot::Awaiting { .. } | Slot::Abandoned { .. }) => {
                let expected = match &slot {
                    Slot::Awaiting { action_id, .. } | Slot::Abandoned { action_id } => {
                        action_id.clone()
                    }
                    Slot::Idle | Slot::Closed => String::new(),
                };
                let violation = ProtocolViolation::UnexpectedAction {
                    expected,
                    actual: result.action_id,
                };
                (slot, Err(violation))
            }
            Slot::Idle => (
                Slot::Idle,
                Err(ProtocolViolation::NoOutstandingAction {
                    actual: result.action_id,
                }),
            ),
            Slot::Closed => {
                tracing::debug!(action_id = %result.action_id, "Ignoring result received after shutdown");
                (Slot::Closed, Ok(()))
            }
        };

        state.slot = slot;
        outcome
    }

    /// Refuse further actions and fail the in-flight one, if any.
    ///
    /// Returns the action id that was failed.
    pub fn close(&self) -> Option<String> {
        let mut state = self.lock();
        match std::mem::replace(&mut state.slot, Slot::Closed) {
            // Dropping the sender resolves the waiter with "no result".
            Slot::Awaiting { action_id, .. } => Some(action_id),
            _ => None,
        }
    }

    pub fn outstanding(&self) -> Option<String> {
        match &self.lock().slot {
            Slot::Awaiting { action_id, .. } => Some(action_id.clone()),
            _ => None,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.lock().slot, Slot::Closed)
    }

    fn release(&self, generation: u64, abandoned: bool) {
        let mut state = self.lock();
        let slot = std::mem::replace(&mut state.slot, Slot::Idle);
        state.slot = match slot {
            Slot::Awaiting {
                generation: current,
                action_id,
                ..
            } if current == generation => {
                if abandoned {
                    Slot::Abandoned { action_id }
                } else {
                    Slot::Idle
                }
            }
            other => other,
        };
    }
}

/// One reserved action awaiting its result.
///
/// Dropping it before the result arrives frees the slot for the next action.
pub struct PendingExecution {
    action_id: String,
    generation: u64,
    rx: oneshot::Receiver<ResultEvent>,
    correlator: Arc<ResultCorrelator>,
}

impl PendingExecution {
    pub fn action_id(&self) -> &str {
        &self.action_id
    }

    /// The command never reached the worker; no result will come.
    pub fn discard(self) {
        self.correlator.release(self.generation, false);
    }

    /// Wait for the result, the slot being closed, or `interrupt`.
    ///
    /// A cancelled `interrupt` stays cancelled.
    pub async fn wait(mut self, interrupt: &CancellationToken) -> Result<ResultEvent, ExecuteError> {
        tokio::select! {
            biased;

            outcome = &mut self.rx => outcome.map_err(|_| ExecuteError::NoResult {
                action_id: self.action_id.clone(),
            }),
            _ = interrupt.cancelled() => Err(ExecuteError::Interrupted {
                action_id: self.action_id.clone(),
            }),
        }
    }
}

impl Drop for PendingExecution {
    fn drop(&mut self) {
        self.correlator.release(self.generation, true);
    }
}

/// Routes `ResultEvent`s into the correlator.
pub struct ResultEventHandler {
    correlator: Arc<ResultCorrelator>,
}

impl ResultEventHandler {
    pub fn new(correlator: Arc<ResultCorrelator>) -> Self {
        Self { correlator }
    }
}

impl EventHandler for ResultEventHandler {
    fn handle(&self, event: DownwardEvent) -> Result<(), ProtocolViolation> {
        match event {
            DownwardEvent::Result(result) => {
                tracing::info!(action_id = %result.action_id, exit_code = result.exit_code, "Received result event");
                self.correlator.complete(result)
            }
            other => {
                tracing::warn!(event_type = ?other.event_type(), "Result handler received non-result event");
                Ok(())
            }
        }
    }
}
