//! Bridge Wire Protocol
//!
//! Frames exchanged between a bridge and the receiving broker. Frames are
//! serialized with bincode and sent with a 4-byte big-endian length prefix.
//!
//! A small message travels as a single `Send`. A large one travels as a
//! `SendLarge` header announcing the body size, followed by `Continuation`
//! frames carrying consecutive body ranges, the last one flagged `last`.
//! The receiver confirms every frame with `Confirm`, echoing the sequence id
//! the sender assigned.

use std::fmt;

use bincode::enc::write::SizeWriter;
use bincode::{Decode, Encode};
use bytes::{Buf, Bytes, BytesMut};

use crate::message::{Message, Properties, PropertyValue};

/// Protocol version for compatibility checking
pub const BRIDGE_PROTOCOL_VERSION: u8 = 1;

/// Length prefix size in bytes
pub const FRAME_HEADER_LEN: usize = 4;

/// Upper bound on what a `Continuation` adds to its chunk on the wire:
/// length prefix, variant tag, varint sequence id and chunk length, flag
pub const MAX_CONTINUATION_OVERHEAD: usize = FRAME_HEADER_LEN + 20;

/// Largest frame accepted by the decoder
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Errors raised while encoding or decoding frames
#[derive(Debug)]
pub enum ProtocolError {
    Encode(bincode::error::EncodeError),
    Decode(bincode::error::DecodeError),
    /// Length prefix exceeds [`MAX_FRAME_SIZE`]
    FrameTooLarge(usize),
    /// Peer speaks another protocol version
    VersionMismatch(u8),
    /// Frame not valid in the current state
    Unexpected(&'static str),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Encode(e) => write!(f, "encode error: {}", e),
            Self::Decode(e) => write!(f, "decode error: {}", e),
            Self::FrameTooLarge(n) => write!(f, "frame too large: {} bytes", n),
            Self::VersionMismatch(v) => write!(f, "unsupported protocol version: {}", v),
            Self::Unexpected(what) => write!(f, "unexpected frame: {}", what),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<bincode::error::EncodeError> for ProtocolError {
    fn from(e: bincode::error::EncodeError) -> Self {
        ProtocolError::Encode(e)
    }
}

impl From<bincode::error::DecodeError> for ProtocolError {
    fn from(e: bincode::error::DecodeError) -> Self {
        ProtocolError::Decode(e)
    }
}

/// Message as carried on the wire
#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct WireMessage {
    pub id: u64,
    pub address: String,
    pub priority: u8,
    pub durable: bool,
    pub properties: Vec<(String, PropertyValue)>,
    pub body: Vec<u8>,
}

impl WireMessage {
    /// Wire form of `message` with a replaced body
    pub fn with_body(message: &Message, body: Vec<u8>) -> Self {
        Self {
            id: message.id,
            address: message.address.clone(),
            priority: message.priority,
            durable: message.durable,
            properties: message.properties.to_pairs(),
            body,
        }
    }

    pub fn into_message(self) -> Message {
        Message {
            id: self.id,
            address: self.address,
            priority: self.priority,
            durable: self.durable,
            properties: Properties::from_pairs(self.properties),
            body: Bytes::from(self.body),
        }
    }
}

impl From<&Message> for WireMessage {
    fn from(message: &Message) -> Self {
        Self::with_body(message, message.body.to_vec())
    }
}

/// Frames exchanged over a bridge session
#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub enum Frame {
    /// Opens a producer on a fresh session
    CreateProducer { version: u8 },
    /// Producer accepted
    ProducerCreated { version: u8 },
    /// A complete message
    Send { sequence_id: u64, message: WireMessage },
    /// Header of a streamed message; the body follows in continuations
    SendLarge {
        sequence_id: u64,
        message: WireMessage,
        body_size: u64,
    },
    /// A body range of the streamed message currently being received
    Continuation {
        sequence_id: u64,
        chunk: Vec<u8>,
        last: bool,
    },
    /// Receipt of the frame carrying `sequence_id`
    Confirm { sequence_id: u64 },
    /// Orderly session shutdown
    Close,
}

impl Frame {
    /// Encode frame payload to bytes using bincode
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(bincode::encode_to_vec(self, bincode::config::standard())?)
    }

    /// Decode frame payload from bytes using bincode
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        Ok(bincode::decode_from_slice(data, bincode::config::standard()).map(|(f, _)| f)?)
    }

    /// Size of the frame on the wire, length prefix included
    pub fn encoded_len(&self) -> Result<usize, ProtocolError> {
        let mut writer = SizeWriter::default();
        bincode::encode_into_writer(self, &mut writer, bincode::config::standard())?;
        Ok(FRAME_HEADER_LEN + writer.bytes_written)
    }

    /// Sequence id of a data or confirmation frame
    pub fn sequence_id(&self) -> Option<u64> {
        match self {
            Frame::Send { sequence_id, .. }
            | Frame::SendLarge { sequence_id, .. }
            | Frame::Continuation { sequence_id, .. }
            | Frame::Confirm { sequence_id } => Some(*sequence_id),
            _ => None,
        }
    }

    /// Get the frame type name for logging
    pub fn type_name(&self) -> &'static str {
        match self {
            Frame::CreateProducer { .. } => "CreateProducer",
            Frame::ProducerCreated { .. } => "ProducerCreated",
            Frame::Send { .. } => "Send",
            Frame::SendLarge { .. } => "SendLarge",
            Frame::Continuation { .. } => "Continuation",
            Frame::Confirm { .. } => "Confirm",
            Frame::Close => "Close",
        }
    }
}

/// Frame a message with length prefix for TCP transmission
pub fn frame_message(frame: &Frame) -> Result<Vec<u8>, ProtocolError> {
    let payload = frame.encode()?;
    let len = payload.len() as u32;

    let mut out = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(&payload);

    Ok(out)
}

/// Read frame length from bytes (returns None if not enough data)
pub fn read_frame_length(data: &[u8]) -> Option<u32> {
    if data.len() < FRAME_HEADER_LEN {
        return None;
    }
    Some(u32::from_be_bytes([data[0], data[1], data[2], data[3]]))
}

/// Incremental decoder for a stream of length-prefixed frames
#[derive(Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes read from the stream
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Next complete frame, if buffered
    pub fn next_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        let Some(len) = read_frame_length(&self.buf) else {
            return Ok(None);
        };
        let len = len as usize;
        if len > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge(len));
        }
        if self.buf.len() < FRAME_HEADER_LEN + len {
            return Ok(None);
        }
        self.buf.advance(FRAME_HEADER_LEN);
        let payload = self.buf.split_to(len);
        Frame::decode(&payload).map(Some)
    }
}
