//! Framed codec for worker tool communication.
//!
//! Each frame is an unsigned LEB128 varint length followed by that many bytes
//! of serde_json. This is the same delimited layout protobuf's
//! `writeDelimitedTo` produces, so a stream can be split without knowing the
//! message types in advance. Works over any AsyncRead/AsyncWrite (pipes,
//! sockets, in-memory duplex streams).

use std::io;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Upper bound on a single frame body.
pub const MAX_FRAME_LENGTH: usize = 64 * 1024 * 1024;

/// A u64 needs at most ten 7-bit groups.
const MAX_VARINT_LENGTH: usize = 10;

/// One undecoded frame body.
///
/// Frames on the wire are untyped; the preceding envelope frame says what the
/// next one holds, so decoding is deferred until the caller knows the type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame(Bytes);

impl Frame {
    pub fn parse<T: DeserializeOwned>(&self) -> io::Result<T> {
        serde_json::from_slice(&self.0).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Codec that frames messages with a varint length prefix and serializes with JSON.
///
/// Encoding accepts any `Serialize` value so a single writer can emit the
/// envelope, command and payload frames of one command back to back.
#[derive(Debug, Clone, Copy)]
pub struct JsonCodec {
    max_frame_length: usize,
}

impl Default for JsonCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl JsonCodec {
    pub fn new() -> Self {
        Self {
            max_frame_length: MAX_FRAME_LENGTH,
        }
    }

    pub fn with_max_frame_length(mut self, max_frame_length: usize) -> Self {
        self.max_frame_length = max_frame_length;
        self
    }

    fn frame_too_long(&self, len: u64) -> io::Error {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "frame of {} bytes exceeds limit of {} bytes",
                len, self.max_frame_length
            ),
        )
    }
}

/// Returns the decoded value and the number of prefix bytes, or `None` if
/// `src` ends in the middle of the varint.
fn read_varint(src: &[u8]) -> io::Result<Option<(u64, usize)>> {
    let mut value: u64 = 0;
    for (i, byte) in src.iter().take(MAX_VARINT_LENGTH).enumerate() {
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
    }
    if src.len() >= MAX_VARINT_LENGTH {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "varint length prefix is longer than 10 bytes",
        ));
    }
    Ok(None)
}

fn put_varint(mut value: u64, dst: &mut BytesMut) {
    while value >= 0x80 {
        dst.put_u8((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    dst.put_u8(value as u8);
}

impl Decoder for JsonCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some((len, prefix_len)) = read_varint(src)? else {
            return Ok(None);
        };
        let body_len = usize::try_from(len)
            .ok()
            .filter(|l| *l <= self.max_frame_length)
            .ok_or_else(|| self.frame_too_long(len))?;

        let frame_len = prefix_len + body_len;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        src.advance(prefix_len);
        Ok(Some(Frame(src.split_to(body_len).freeze())))
    }
}

impl<T: Serialize> Encoder<T> for JsonCodec {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json =
            serde_json::to_vec(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        if json.len() > self.max_frame_length {
            return Err(self.frame_too_long(json.len() as u64));
        }
        tracing::trace!(json_size_bytes = json.len(), "Encoding frame");

        dst.reserve(MAX_VARINT_LENGTH + json.len());
        put_varint(json.len() as u64, dst);
        dst.extend_from_slice(&json);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::{CommandType, CommandTypeMessage, ExecuteCommand};

    #[test]
    fn short_frames_use_single_byte_prefix() {
        let mut codec = JsonCodec::new();
        let mut buf = BytesMut::new();

        codec
            .encode(CommandTypeMessage::new(CommandType::ShutdownCommand), &mut buf)
            .unwrap();

        let body = br#"{"command_type":"shutdown_command"}"#;
        assert_eq!(buf[0] as usize, body.len());
        assert_eq!(&buf[1..], &body[..]);
    }

    #[test]
    fn long_frames_use_multi_byte_prefix() {
        let mut codec = JsonCodec::new();
        let mut buf = BytesMut::new();

        let action_id = "a".repeat(300);
        codec
            .encode(
                ExecuteCommand {
                    action_id: action_id.clone(),
                },
                &mut buf,
            )
            .unwrap();

        // 300 chars + `{"action_id":""}` = 316 = 0b10_0111100
        assert_eq!(&buf[..2], &[0xbc, 0x02]);

        let frame = codec.decode(&mut buf).unwrap().unwrap();
        let decoded: ExecuteCommand = frame.parse().unwrap();
        assert_eq!(decoded.action_id, action_id);
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_frame_waits_for_more_bytes() {
        let mut codec = JsonCodec::new();
        let mut full = BytesMut::new();
        codec
            .encode(
                ExecuteCommand {
                    action_id: "action-1".to_string(),
                },
                &mut full,
            )
            .unwrap();

        let mut buf = BytesMut::from(&full[..full.len() - 3]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&full[full.len() - 3..]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        let decoded: ExecuteCommand = frame.parse().unwrap();
        assert_eq!(decoded.action_id, "action-1");
    }

    #[test]
    fn consecutive_frames_decode_in_order() {
        let mut codec = JsonCodec::new();
        let mut buf = BytesMut::new();

        codec
            .encode(CommandTypeMessage::new(CommandType::ExecuteCommand), &mut buf)
            .unwrap();
        codec
            .encode(
                ExecuteCommand {
                    action_id: "action-2".to_string(),
                },
                &mut buf,
            )
            .unwrap();
        codec.encode(serde_json::json!({"x": 1}), &mut buf).unwrap();

        let envelope: CommandTypeMessage = codec.decode(&mut buf).unwrap().unwrap().parse().unwrap();
        let command: ExecuteCommand = codec.decode(&mut buf).unwrap().unwrap().parse().unwrap();
        let payload: serde_json::Value = codec.decode(&mut buf).unwrap().unwrap().parse().unwrap();

        assert_eq!(envelope.command_type, CommandType::ExecuteCommand);
        assert_eq!(command.action_id, "action-2");
        assert_eq!(payload, serde_json::json!({"x": 1}));
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut codec = JsonCodec::new().with_max_frame_length(8);
        let mut buf = BytesMut::new();
        put_varint(9, &mut buf);

        let err = codec.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        let err = codec
            .encode(serde_json::json!("0123456789"), &mut BytesMut::new())
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn overlong_varint_is_rejected() {
        let mut codec = JsonCodec::new();
        let mut buf = BytesMut::from(&[0xff_u8; 11][..]);
        assert!(codec.decode(&mut buf).is_err());
    }
}
