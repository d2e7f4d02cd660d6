//! DiME frame codec.
//!
//! Wire layout, big-endian throughout:
//!
//! | offset | size       | meaning                  |
//! |--------|------------|--------------------------|
//! | 0      | 4          | ASCII magic `DiME`       |
//! | 4      | 4          | `json_len` (u32)         |
//! | 8      | 4          | `bin_len` (u32)          |
//! | 12     | `json_len` | UTF-8 JSON object        |
//! | 12+jl  | `bin_len`  | opaque payload           |
//!
//! Decoding is incremental: feed chunks into a [`RecvBuffer`], call
//! [`FrameDecoder::decode`] until it reports that more data is needed.
//! Any violation (bad magic, oversized lengths, non-object metadata) is
//! fatal to the connection.

use bytes::{Bytes, BytesMut};
use serde_json::{Map, Value};
use std::io;
use thiserror::Error;

use compio::buf::BufResult;
use compio::io::{AsyncWrite, AsyncWriteExt};

use crate::buffer::RecvBuffer;
use dime_core::config::FrameLimits;

/// Frame magic, first four bytes of every frame.
pub const MAGIC: &[u8; 4] = b"DiME";

/// Fixed header size: magic + two u32 lengths.
pub const HEADER_LEN: usize = 12;

/// Unrecoverable framing errors.
///
/// Every variant closes the connection without a reply.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("invalid frame magic")]
    BadMagic,

    #[error("frame too large: {json_len} json + {bin_len} binary bytes")]
    TooLarge { json_len: usize, bin_len: usize },

    #[error("frame metadata is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame metadata is not a JSON object")]
    MetadataNotObject,

    #[error("connection truncated mid-frame")]
    Truncated,
}

impl From<FrameError> for io::Error {
    fn from(err: FrameError) -> Self {
        Self::new(io::ErrorKind::InvalidData, err)
    }
}

/// A decoded frame: metadata object plus opaque payload.
#[derive(Debug, Clone)]
pub struct Frame {
    pub meta: Map<String, Value>,
    pub payload: Bytes,
}

/// Stateful DiME frame decoder.
///
/// Remembers parsed header lengths across calls so a frame split over
/// several reads is reassembled without re-parsing.
pub struct FrameDecoder {
    limits: FrameLimits,
    /// Lengths of the frame currently being assembled.
    pending: Option<(usize, usize)>,
}

impl FrameDecoder {
    #[must_use]
    pub fn new(limits: FrameLimits) -> Self {
        Self {
            limits,
            pending: None,
        }
    }

    /// True when a header has been consumed but its body has not yet
    /// arrived. EOF in this state means the peer died mid-frame.
    #[must_use]
    pub const fn is_mid_frame(&self) -> bool {
        self.pending.is_some()
    }

    /// Decode a single frame.
    ///
    /// Returns:
    /// - `Ok(Some(frame))` - a complete frame was extracted
    /// - `Ok(None)` - need more data
    /// - `Err` - framing violation, close the connection
    pub fn decode(&mut self, buf: &mut RecvBuffer) -> Result<Option<Frame>, FrameError> {
        if self.pending.is_none() {
            if buf.len() < HEADER_LEN {
                return Ok(None);
            }

            let mut hdr = [0u8; HEADER_LEN];
            if !buf.peek_into(&mut hdr) {
                return Ok(None);
            }

            if &hdr[0..4] != MAGIC {
                return Err(FrameError::BadMagic);
            }

            let json_len = u32::from_be_bytes([hdr[4], hdr[5], hdr[6], hdr[7]]) as usize;
            let bin_len = u32::from_be_bytes([hdr[8], hdr[9], hdr[10], hdr[11]]) as usize;

            if json_len > self.limits.max_json_len || bin_len > self.limits.max_bin_len {
                return Err(FrameError::TooLarge { json_len, bin_len });
            }

            buf.skip(HEADER_LEN);
            self.pending = Some((json_len, bin_len));
        }

        let (json_len, bin_len) = self.pending.unwrap_or((0, 0));
        if buf.len() < json_len + bin_len {
            return Ok(None);
        }

        let json = buf.take(json_len).ok_or(FrameError::Truncated)?;
        let payload = buf.take(bin_len).ok_or(FrameError::Truncated)?;
        self.pending = None;

        let meta = match serde_json::from_slice::<Value>(&json)? {
            Value::Object(map) => map,
            _ => return Err(FrameError::MetadataNotObject),
        };

        Ok(Some(Frame { meta, payload }))
    }
}

/// Serialize a metadata map for the wire.
pub fn encode_meta(meta: &Map<String, Value>) -> Result<Bytes, FrameError> {
    Ok(Bytes::from(serde_json::to_vec(meta)?))
}

/// Build the header + metadata prefix of a frame in one buffer.
///
/// The payload is written separately so its refcounted bytes are never
/// copied into the prefix.
pub fn frame_prefix(meta: &[u8], payload_len: usize) -> Result<Bytes, FrameError> {
    let json_len = u32::try_from(meta.len());
    let bin_len = u32::try_from(payload_len);
    let (Ok(json_len), Ok(bin_len)) = (json_len, bin_len) else {
        return Err(FrameError::TooLarge {
            json_len: meta.len(),
            bin_len: payload_len,
        });
    };

    let mut out = BytesMut::with_capacity(HEADER_LEN + meta.len());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&json_len.to_be_bytes());
    out.extend_from_slice(&bin_len.to_be_bytes());
    out.extend_from_slice(meta);
    Ok(out.freeze())
}

/// Write one frame: header+metadata as one buffer, payload (if any) as a
/// second zero-copy write.
pub async fn write_frame<S: AsyncWrite>(
    stream: &mut S,
    meta: Bytes,
    payload: Bytes,
) -> io::Result<()> {
    let prefix = frame_prefix(&meta, payload.len())?;

    let BufResult(res, _) = stream.write_all(prefix).await;
    res?;

    if !payload.is_empty() {
        let BufResult(res, _) = stream.write_all(payload).await;
        res?;
    }

    Ok(())
}
