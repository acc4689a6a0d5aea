//! Multi-frame messages: one envelope frame followed by its body frames.
//!
//! Writers encode every frame of a message up front and flush them together,
//! so a message is either fully handed to the transport or not at all. Callers that share
//! a writer must hold it for the whole call to keep messages from interleaving.

use std::io;

use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::bytes::BytesMut;
use tokio_util::codec::{Encoder, FramedRead, FramedWrite};

use super::codec::{Frame, JsonCodec};
use super::protocol::{
    Command, CommandType, CommandTypeMessage, DownwardEvent, EventTypeMessage, ExecuteCommand,
    ShutdownCommand,
};

/// Encode every frame of one message, then hand them to `writer` together.
///
/// Nothing reaches the write buffer unless all frames encoded, so a failed
/// encode cannot leave half a message ahead of the next one.
async fn write_message<W, F>(writer: &mut FramedWrite<W, JsonCodec>, encode: F) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    F: FnOnce(&mut JsonCodec, &mut BytesMut) -> io::Result<()>,
{
    let mut frames = BytesMut::new();
    encode(writer.encoder_mut(), &mut frames)?;
    writer.write_buffer_mut().unsplit(frames);
    SinkExt::<Value>::flush(writer).await
}

/// Write `{EXECUTE_COMMAND envelope, ExecuteCommand{action_id}, payload}`.
pub async fn write_execute_command<W, P>(
    writer: &mut FramedWrite<W, JsonCodec>,
    action_id: &str,
    payload: &P,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    P: Serialize + ?Sized,
{
    write_message(writer, |codec, dst| {
        codec.encode(CommandTypeMessage::new(CommandType::ExecuteCommand), dst)?;
        codec.encode(
            ExecuteCommand {
                action_id: action_id.to_string(),
            },
            dst,
        )?;
        codec.encode(payload, dst)
    })
    .await
}

/// Write `{SHUTDOWN_COMMAND envelope, ShutdownCommand}`.
pub async fn write_shutdown_command<W>(writer: &mut FramedWrite<W, JsonCodec>) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    write_message(writer, |codec, dst| {
        codec.encode(CommandTypeMessage::new(CommandType::ShutdownCommand), dst)?;
        codec.encode(ShutdownCommand::default(), dst)
    })
    .await
}

/// Write `{EventTypeMessage, body}` for one event.
pub async fn write_event<W>(
    writer: &mut FramedWrite<W, JsonCodec>,
    event: &DownwardEvent,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    write_message(writer, |codec, dst| {
        codec.encode(EventTypeMessage::new(event.event_type()), dst)?;
        codec.encode(event, dst)
    })
    .await
}

/// Flush anything buffered and shut the underlying stream down.
pub async fn close_writer<W>(writer: &mut FramedWrite<W, JsonCodec>) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    SinkExt::<Value>::close(writer).await
}

async fn next_frame<R>(reader: &mut FramedRead<R, JsonCodec>) -> io::Result<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    reader.next().await.transpose()
}

async fn body_frame<R>(reader: &mut FramedRead<R, JsonCodec>, what: &str) -> io::Result<Frame>
where
    R: AsyncRead + Unpin,
{
    next_frame(reader).await?.ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("stream ended before {} frame", what),
        )
    })
}

/// Read the next event. `Ok(None)` on a clean end of stream.
///
/// Events with an envelope this side does not understand are skipped along
/// with their body, so newer workers can talk to older executors.
pub async fn read_event<R>(reader: &mut FramedRead<R, JsonCodec>) -> io::Result<Option<DownwardEvent>>
where
    R: AsyncRead + Unpin,
{
    loop {
        let Some(envelope) = next_frame(reader).await? else {
            return Ok(None);
        };
        let body = body_frame(reader, "event body").await?;

        match envelope.parse::<EventTypeMessage>() {
            Ok(envelope) => return DownwardEvent::decode(envelope.event_type, &body).map(Some),
            Err(e) => {
                tracing::warn!(error = %e, body_bytes = body.len(), "Skipping event with unknown type");
            }
        }
    }
}

/// Read the next command. `Ok(None)` on a clean end of stream.
pub async fn read_command<R>(reader: &mut FramedRead<R, JsonCodec>) -> io::Result<Option<Command>>
where
    R: AsyncRead + Unpin,
{
    let Some(envelope) = next_frame(reader).await? else {
        return Ok(None);
    };
    let envelope: CommandTypeMessage = envelope.parse()?;

    match envelope.command_type {
        CommandType::ExecuteCommand => {
            let command: ExecuteCommand = body_frame(reader, "execute command").await?.parse()?;
            let payload = body_frame(reader, "execute payload").await?.parse()?;
            Ok(Some(Command::Execute {
                action_id: command.action_id,
                payload,
            }))
        }
        CommandType::ShutdownCommand => {
            let _: ShutdownCommand = body_frame(reader, "shutdown command").await?.parse()?;
            Ok(Some(Command::Shutdown))
        }
    }
}
