//! Frame encoding and decoding
//!
//! Wire layout, both directions:
//!
//! - 4 bytes: big-endian u32 metadata length
//! - metadata length bytes: UTF-8 JSON metadata block
//! - rest: opaque body
//!
//! The length prefix makes the metadata self-delimiting, so the body can
//! carry any byte sequence (including bytes that would be illegal inside
//! the JSON encoding) without ever being mis-parsed as metadata.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::messages::TunnelMessage;
use crate::{LENGTH_PREFIX_SIZE, MAX_METADATA_SIZE};

/// Codec errors
///
/// Decode failures are per-frame: the call site drops the offending frame
/// and keeps the connection open.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Frame truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("Metadata block too large: {0} bytes")]
    MetadataTooLarge(u32),

    #[error("Invalid metadata: {0}")]
    InvalidMetadata(#[from] serde_json::Error),
}

/// One framed protocol message plus its opaque body
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub message: TunnelMessage,
    pub body: Bytes,
}

impl Frame {
    /// Create a frame with an empty body
    pub fn new(message: TunnelMessage) -> Self {
        Self {
            message,
            body: Bytes::new(),
        }
    }

    /// Create a frame carrying a body
    pub fn with_body(message: TunnelMessage, body: Bytes) -> Self {
        Self { message, body }
    }

    /// Encode frame to wire bytes
    pub fn encode(&self) -> Result<Bytes, CodecError> {
        let meta = serde_json::to_vec(&self.message)?;
        if meta.len() > MAX_METADATA_SIZE as usize {
            return Err(CodecError::MetadataTooLarge(meta.len() as u32));
        }

        let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + meta.len() + self.body.len());
        buf.put_u32(meta.len() as u32);
        buf.put_slice(&meta);
        buf.put(self.body.clone());

        Ok(buf.freeze())
    }

    /// Decode frame from wire bytes
    pub fn decode(mut buf: Bytes) -> Result<Self, CodecError> {
        if buf.len() < LENGTH_PREFIX_SIZE {
            return Err(CodecError::Truncated {
                needed: LENGTH_PREFIX_SIZE,
                available: buf.len(),
            });
        }

        let meta_len = buf.get_u32();
        if meta_len > MAX_METADATA_SIZE {
            return Err(CodecError::MetadataTooLarge(meta_len));
        }
        if buf.remaining() < meta_len as usize {
            return Err(CodecError::Truncated {
                needed: meta_len as usize,
                available: buf.remaining(),
            });
        }

        let meta = buf.split_to(meta_len as usize);
        let message = serde_json::from_slice(&meta)?;

        Ok(Self {
            message,
            body: buf,
        })
    }
}
