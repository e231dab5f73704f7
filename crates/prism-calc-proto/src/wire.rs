// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Frame layout and CBOR codec for the calc provider channel.
//!
//! Frame layout:
//!
//! ``LENGTH(4, BE) || VERSION(1) || TAG(1) || CBOR BODY``
//!
//! * LENGTH counts everything after itself (version byte + tag + body)
//! * VERSION is a single leading byte; v1 is `0x01`
//! * TAG selects the message kind; the body is a canonical CBOR payload

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::{
    FailurePayload, FunctionPayload, Message, PingPayload, PongPayload, ProgressPayload,
    RegistrationPayload, ResultPayload,
};

/// Wire protocol version byte.
pub const VERSION: u8 = 0x01;
/// Largest accepted frame payload (version byte + tag + body).
pub const MAX_PAYLOAD: usize = 8 * 1024 * 1024;
/// Frame header size: the 4-byte length prefix.
pub const HEADER_LEN: usize = 4;

/// Execute a function call.
pub const TAG_FUNCTION: u8 = 0x01;
/// Liveness probe.
pub const TAG_PING: u8 = 0x02;
/// Provider self-identification.
pub const TAG_REGISTRATION: u8 = 0x10;
/// In-flight calculation progress.
pub const TAG_PROGRESS: u8 = 0x11;
/// Successful result.
pub const TAG_RESULT: u8 = 0x12;
/// Calculation failure.
pub const TAG_FAILURE: u8 = 0x13;
/// Liveness answer.
pub const TAG_PONG: u8 = 0x14;

/// Framing or codec failure. All variants are fatal to the connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    /// The buffer ends before the frame does.
    #[error("truncated frame: need {need} bytes, have {have}")]
    Truncated {
        /// Bytes the complete frame requires.
        need: usize,
        /// Bytes actually available.
        have: usize,
    },
    /// The declared payload exceeds [`MAX_PAYLOAD`].
    #[error("oversized frame: {len} bytes exceeds the {MAX_PAYLOAD} byte limit")]
    Oversized {
        /// Declared payload length.
        len: usize,
    },
    /// The version byte is not one this implementation speaks.
    #[error("unsupported wire version {found:#04x}")]
    UnsupportedVersion {
        /// The version byte found on the wire.
        found: u8,
    },
    /// The tag byte does not name a known message kind.
    #[error("unknown message tag {tag:#04x}")]
    UnknownTag {
        /// The tag byte found on the wire.
        tag: u8,
    },
    /// The CBOR body failed to encode or decode.
    #[error("message body codec failure: {0}")]
    Body(String),
}

fn encode_body<T: Serialize>(body: &T) -> Result<Vec<u8>, WireError> {
    let mut out = Vec::new();
    ciborium::ser::into_writer(body, &mut out).map_err(|err| WireError::Body(err.to_string()))?;
    Ok(out)
}

fn decode_body<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, WireError> {
    ciborium::de::from_reader(bytes).map_err(|err| WireError::Body(err.to_string()))
}

/// Encodes `message` as one complete frame (length prefix included).
pub fn encode_message(message: &Message) -> Result<Vec<u8>, WireError> {
    let body = match message {
        Message::Function(p) => encode_body(p)?,
        Message::Ping(p) => encode_body(p)?,
        Message::Registration(p) => encode_body(p)?,
        Message::Progress(p) => encode_body(p)?,
        Message::Result(p) => encode_body(p)?,
        Message::Failure(p) => encode_body(p)?,
        Message::Pong(p) => encode_body(p)?,
    };

    let payload_len = 2 + body.len();
    if payload_len > MAX_PAYLOAD {
        return Err(WireError::Oversized { len: payload_len });
    }

    let mut out = Vec::with_capacity(HEADER_LEN + payload_len);
    out.extend_from_slice(&(payload_len as u32).to_be_bytes());
    out.push(VERSION);
    out.push(message.tag());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Reads the declared payload length from a frame header.
///
/// Returns `None` when fewer than [`HEADER_LEN`] bytes are available, and
/// [`WireError::Oversized`] when the declared length exceeds the limit.
pub fn payload_len(buf: &[u8]) -> Result<Option<usize>, WireError> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len > MAX_PAYLOAD {
        return Err(WireError::Oversized { len });
    }
    Ok(Some(len))
}

/// Decodes one frame from the front of `buf`, returning the message and the
/// total bytes consumed. Callers accumulate bytes and retry on
/// [`WireError::Truncated`].
pub fn decode_message(buf: &[u8]) -> Result<(Message, usize), WireError> {
    let Some(len) = payload_len(buf)? else {
        return Err(WireError::Truncated {
            need: HEADER_LEN,
            have: buf.len(),
        });
    };
    let frame_len = HEADER_LEN + len;
    if buf.len() < frame_len {
        return Err(WireError::Truncated {
            need: frame_len,
            have: buf.len(),
        });
    }
    if len < 2 {
        return Err(WireError::Body(
            "frame payload shorter than version + tag".to_owned(),
        ));
    }

    let version = buf[HEADER_LEN];
    if version != VERSION {
        return Err(WireError::UnsupportedVersion { found: version });
    }
    let tag = buf[HEADER_LEN + 1];
    let body = &buf[HEADER_LEN + 2..frame_len];

    let message = match tag {
        TAG_FUNCTION => Message::Function(decode_body::<FunctionPayload>(body)?),
        TAG_PING => Message::Ping(decode_body::<PingPayload>(body)?),
        TAG_REGISTRATION => Message::Registration(decode_body::<RegistrationPayload>(body)?),
        TAG_PROGRESS => Message::Progress(decode_body::<ProgressPayload>(body)?),
        TAG_RESULT => Message::Result(decode_body::<ResultPayload>(body)?),
        TAG_FAILURE => Message::Failure(decode_body::<FailurePayload>(body)?),
        TAG_PONG => Message::Pong(decode_body::<PongPayload>(body)?),
        other => return Err(WireError::UnknownTag { tag: other }),
    };

    Ok((message, frame_len))
}

// --- Unit tests -----------------------------------------------------------
