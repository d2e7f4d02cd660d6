//! The routed-message value type.
//!
//! An `Envelope` is built once when the broker accepts a `send` or
//! `broadcast` and is then shared by reference with every recipient
//! mailbox. Both the serialized metadata and the payload are refcounted
//! `Bytes`, so fanout never copies message bodies.

use bytes::Bytes;
use serde_json::{Map, Value};

use crate::registry::groups::ClientId;

/// Immutable carrier of one routed message.
///
/// The metadata is the sender's JSON map replayed verbatim, serialized
/// exactly once at construction; the broker neither reads nor rewrites
/// the payload bytes.
#[derive(Debug, Clone)]
pub struct Envelope {
    meta: Bytes,
    payload: Bytes,
    sender: ClientId,
}

impl Envelope {
    /// Build an envelope from the sender's metadata map and payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the metadata map cannot be serialized.
    pub fn new(
        sender: ClientId,
        meta: &Map<String, Value>,
        payload: Bytes,
    ) -> Result<Self, serde_json::Error> {
        let meta = Bytes::from(serde_json::to_vec(meta)?);
        Ok(Self {
            meta,
            payload,
            sender,
        })
    }

    /// Serialized delivery metadata (a JSON object).
    #[must_use]
    pub fn meta(&self) -> &Bytes {
        &self.meta
    }

    /// Opaque payload, byte-for-byte as submitted.
    #[must_use]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// The submitting client.
    #[must_use]
    pub const fn sender(&self) -> ClientId {
        self.sender
    }

    /// Bytes this envelope accounts for against a mailbox cap.
    #[must_use]
    pub fn byte_size(&self) -> usize {
        self.meta.len() + self.payload.len()
    }
}
