//! Codec for encoding and decoding spacecast frames.
//!
//! Frames are JSON documents. Several already-encoded frames may be
//! coalesced into a single transport write, separated by `\n`.

use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;
use thiserror::Error;

use crate::envelope::{Envelope, EnvelopeType};

/// Maximum frame size (64 KiB).
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Separator between coalesced frames.
pub const BATCH_SEPARATOR: u8 = b'\n';

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Well-formed frame with a type this protocol does not define.
    #[error("Unknown envelope type: {0}")]
    UnknownType(String),

    /// Invalid frame data.
    #[error("Invalid frame: {0}")]
    Invalid(String),
}

/// Encode any serializable message to bytes.
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode<T: Serialize>(message: &T) -> Result<Bytes, ProtocolError> {
    let payload = serde_json::to_vec(message)?;

    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(payload.len()));
    }

    Ok(Bytes::from(payload))
}

/// Decode an envelope from bytes.
///
/// # Errors
///
/// Returns [`ProtocolError::UnknownType`] for a well-formed frame whose
/// `type` is not recognised, and another variant for anything malformed.
pub fn decode(data: &[u8]) -> Result<Envelope, ProtocolError> {
    if data.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(data.len()));
    }

    let value: serde_json::Value = serde_json::from_slice(data)?;
    let kind = value
        .get("type")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| ProtocolError::Invalid("missing type".into()))?;

    if kind.parse::<EnvelopeType>().is_err() {
        return Err(ProtocolError::UnknownType(kind.to_string()));
    }

    Ok(serde_json::from_value(value)?)
}

/// Join encoded frames into one write, separated by [`BATCH_SEPARATOR`].
#[must_use]
pub fn coalesce(frames: &[Bytes]) -> Bytes {
    match frames {
        [] => Bytes::new(),
        [single] => single.clone(),
        _ => {
            let len = frames.iter().map(|f| f.len() + 1).sum::<usize>() - 1;
            let mut buf = BytesMut::with_capacity(len);
            for (i, frame) in frames.iter().enumerate() {
                if i > 0 {
                    buf.put_u8(BATCH_SEPARATOR);
                }
                buf.extend_from_slice(frame);
            }
            buf.freeze()
        }
    }
}

/// Split a coalesced write back into its frames.
pub fn split_batch(data: &[u8]) -> impl Iterator<Item = &[u8]> {
    data.split(|b| *b == BATCH_SEPARATOR).filter(|f| !f.is_empty())
}
