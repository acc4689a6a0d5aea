//! Inbound event loop: decodes the worker's event stream and dispatches it.

use std::io;

use tokio::io::AsyncRead;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;

use crate::bridge::codec::JsonCodec;
use crate::bridge::framing::read_event;
use crate::dispatch::EventDispatcher;
use crate::error::ProtocolViolation;

#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("event channel error: {0}")]
    Io(#[from] io::Error),
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolViolation),
}

/// Read events until the stream ends, handing each to `dispatcher`.
///
/// Stops at the first transport error or protocol violation.
pub async fn run_event_listener<R>(reader: R, dispatcher: EventDispatcher) -> Result<(), ListenerError>
where
    R: AsyncRead + Unpin,
{
    let mut events = FramedRead::new(reader, JsonCodec::new());
    while let Some(event) = read_event(&mut events).await? {
        tracing::trace!(event_type = ?event.event_type(), "Dispatching event");
        dispatcher.dispatch(event)?;
    }
    tracing::debug!("Event channel closed");
    Ok(())
}

/// Run [`run_event_listener`] on its own task, logging how it ended.
pub fn spawn_event_listener<R>(reader: R, dispatcher: EventDispatcher) -> JoinHandle<()>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        match run_event_listener(reader, dispatcher).await {
            Ok(()) => tracing::debug!("Event listener exiting"),
            Err(ListenerError::Protocol(violation)) => {
                tracing::error!(%violation, "Worker tool protocol violation, event listener stopped");
            }
            Err(ListenerError::Io(e)) => {
                tracing::error!(error = %e, "Event channel error, event listener stopped");
            }
        }
    })
}
