// src/domain/envelope.rs

//! Message envelope.
//!
//! The envelope is the unit of transport between publishers and workers. It
//! carries an identity, free-form string headers, and an opaque string
//! payload. The transport layer never interprets the payload; headers exist
//! for routing hints and publish hooks.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// A message envelope.
///
/// Identity is assigned once at creation and survives the trip through the
/// broker unchanged, so the same logical message can be traced across the
/// primary, delay, and error queues.
///
/// # Example
///
/// ```
/// use wave_amqp::Envelope;
///
/// let envelope = Envelope::new(r#"{"order_id": 42}"#)
///     .with_header("message-type", "OrderPlaced");
///
/// assert_eq!(envelope.headers.get("message-type").unwrap(), "OrderPlaced");
/// ```
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Envelope {
    // ---
    /// Unique identifier stamped onto the wire as the message id.
    pub id: Uuid,

    /// Free-form string headers carried alongside the payload.
    ///
    /// Headers travel as broker message headers, not inside the payload, so
    /// consumers can route on them without parsing the body.
    pub headers: BTreeMap<String, String>,

    /// Opaque payload. The transport delivers it verbatim.
    pub payload: String,
}

impl Envelope {
    // ---
    /// Create an envelope with a fresh identity and no headers.
    pub fn new(payload: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            headers: BTreeMap::new(),
            payload: payload.into(),
        }
    }

    /// Reassemble an envelope from its wire parts.
    ///
    /// Used when decoding an incoming delivery; the identity is the one the
    /// publisher stamped, not a fresh one.
    pub fn from_parts(id: Uuid, headers: BTreeMap<String, String>, payload: String) -> Self {
        Self {
            id,
            headers,
            payload,
        }
    }

    /// Attach a header, replacing any previous value for the same key.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_envelopes_get_distinct_ids() {
        let a = Envelope::new("a");
        let b = Envelope::new("a");

        assert_ne!(a.id, b.id);
        assert_eq!(a.payload, b.payload);
    }

    #[test]
    fn with_header_replaces_existing_value() {
        let envelope = Envelope::new("x")
            .with_header("attempt", "1")
            .with_header("attempt", "2");

        assert_eq!(envelope.headers.get("attempt").unwrap(), "2");
        assert_eq!(envelope.headers.len(), 1);
    }

    #[test]
    fn from_parts_preserves_identity() {
        let id = Uuid::new_v4();
        let mut headers = BTreeMap::new();
        headers.insert("origin".to_string(), "worker-7".to_string());

        let envelope = Envelope::from_parts(id, headers, "body".to_string());

        assert_eq!(envelope.id, id);
        assert_eq!(envelope.headers.get("origin").unwrap(), "worker-7");
        assert_eq!(envelope.payload, "body");
    }
}
