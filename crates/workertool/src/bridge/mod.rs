//! IPC bridge between the executor and a worker tool process.
//!
//! # Architecture
//!
//! - **protocol**: Message types (command envelopes, event kinds, ResultEvent)
//! - **codec**: Varint length-delimited JSON frames
//! - **framing**: Multi-frame commands and events over a codec
//! - **pipe**: Named pipes the two processes rendezvous on

pub mod codec;
pub mod framing;
pub mod pipe;
pub mod protocol;
