//! Frame encoding and decoding.
//!
//! Every frame starts with a fixed 5-byte header:
//! ```text
//! ┌─────────┬────────────┬────────────┐
//! │ Command │ Message ID │ Length     │
//! │ 1 byte  │ uint16 BE  │ uint16 BE  │
//! └─────────┴────────────┴────────────┘
//! ```
//!
//! The payload that follows is a list of UTF-8 fields joined with `0x00`.
//! RESPONSE frames are the exception: their length field holds a status
//! code and no payload bytes follow.
//!
//! This module performs no I/O and keeps no state.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use super::commands::Command;

/// Header size in bytes (fixed, exactly 5).
pub const HEADER_SIZE: usize = 5;

/// Message id 0 is reserved and never valid on the wire.
pub const RESERVED_MESSAGE_ID: u16 = 0;

/// Separator between payload fields.
pub const FIELD_SEPARATOR: u8 = 0x00;

/// Codec errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("Message id 0 is reserved")]
    ReservedMessageId,
    #[error("Payload of {0} bytes does not fit the 16-bit length field")]
    PayloadTooLarge(usize),
    #[error("Payload field is not valid UTF-8")]
    InvalidUtf8,
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub command: Command,
    pub message_id: u16,
    /// Payload length, or the status code for RESPONSE frames
    pub length: u16,
}

impl Header {
    /// Read a header from the front of `buf` without consuming anything.
    ///
    /// Returns `None` if fewer than `HEADER_SIZE` bytes are available.
    pub fn peek(buf: &[u8]) -> Option<Self> {
        match buf {
            [command, id_hi, id_lo, len_hi, len_lo, ..] => Some(Self {
                command: Command::from(*command),
                message_id: u16::from_be_bytes([*id_hi, *id_lo]),
                length: u16::from_be_bytes([*len_hi, *len_lo]),
            }),
            _ => None,
        }
    }

    /// Number of payload bytes that follow this header on the wire.
    pub fn payload_len(&self) -> usize {
        if self.command.carries_status() {
            0
        } else {
            usize::from(self.length)
        }
    }

    fn put(&self, buf: &mut BytesMut) {
        buf.put_u8(self.command.code());
        buf.put_u16(self.message_id);
        buf.put_u16(self.length);
    }
}

/// Frame body
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Text fields, joined on the wire with a single NUL byte
    Fields(Vec<String>),
    /// Status code of a RESPONSE frame, stored in the length field
    Status(u16),
}

/// One protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    pub message_id: u16,
    pub payload: Payload,
}

impl Frame {
    /// Frame with text fields.
    pub fn new<I, S>(command: Command, message_id: u16, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command,
            message_id,
            payload: Payload::Fields(fields.into_iter().map(Into::into).collect()),
        }
    }

    /// Bare status response echoing `message_id`.
    pub fn response(message_id: u16, status: u16) -> Self {
        Self {
            command: Command::Response,
            message_id,
            payload: Payload::Status(status),
        }
    }

    /// Payload fields, empty for status responses.
    pub fn fields(&self) -> &[String] {
        match &self.payload {
            Payload::Fields(fields) => fields,
            Payload::Status(_) => &[],
        }
    }

    /// Take the payload fields, empty for status responses.
    pub fn into_fields(self) -> Vec<String> {
        match self.payload {
            Payload::Fields(fields) => fields,
            Payload::Status(_) => Vec::new(),
        }
    }

    /// Status code, if this is a status response.
    pub fn status(&self) -> Option<u16> {
        match self.payload {
            Payload::Status(code) => Some(code),
            Payload::Fields(_) => None,
        }
    }

    /// Encode to wire bytes.
    ///
    /// # Errors
    ///
    /// Fails on message id 0 or when the joined payload exceeds 0xFFFF bytes.
    pub fn encode(&self) -> Result<Bytes, FrameError> {
        if self.message_id == RESERVED_MESSAGE_ID {
            return Err(FrameError::ReservedMessageId);
        }

        let body = match &self.payload {
            Payload::Status(_) => Vec::new(),
            Payload::Fields(fields) => fields.join("\0").into_bytes(),
        };
        let length = match self.payload {
            Payload::Status(code) => code,
            Payload::Fields(_) => {
                u16::try_from(body.len()).map_err(|_| FrameError::PayloadTooLarge(body.len()))?
            }
        };

        let header = Header {
            command: self.command,
            message_id: self.message_id,
            length,
        };
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + body.len());
        header.put(&mut buf);
        buf.put_slice(&body);
        Ok(buf.freeze())
    }
}

/// Try to decode one frame from the front of `buf`.
///
/// Returns:
/// - `Ok(Some((frame, consumed)))` once a complete frame is available
/// - `Ok(None)` while the header or payload is still incomplete
/// - `Err(...)` on a protocol violation
///
/// The buffer is never modified; the caller advances it by `consumed`.
pub fn decode(buf: &[u8]) -> Result<Option<(Frame, usize)>, FrameError> {
    let Some(header) = Header::peek(buf) else {
        return Ok(None);
    };

    if header.message_id == RESERVED_MESSAGE_ID {
        return Err(FrameError::ReservedMessageId);
    }

    let consumed = HEADER_SIZE + header.payload_len();
    let Some(body) = buf.get(HEADER_SIZE..consumed) else {
        return Ok(None);
    };

    let payload = if header.command.carries_status() {
        Payload::Status(header.length)
    } else {
        Payload::Fields(split_fields(body)?)
    };

    let frame = Frame {
        command: header.command,
        message_id: header.message_id,
        payload,
    };
    Ok(Some((frame, consumed)))
}

fn split_fields(body: &[u8]) -> Result<Vec<String>, FrameError> {
    if body.is_empty() {
        return Ok(Vec::new());
    }
    body.split(|b| *b == FIELD_SEPARATOR)
        .map(|field| {
            std::str::from_utf8(field)
                .map(str::to_owned)
                .map_err(|_| FrameError::InvalidUtf8)
        })
        .collect()
}
