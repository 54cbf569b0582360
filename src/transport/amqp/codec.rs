// src/transport/amqp/codec.rs

//! Envelope to wire mapping.
//!
//! Outgoing messages carry the envelope id as the AMQP message id, the
//! origin queue as the app id, and every envelope header as a long-string
//! message header. The payload travels as the message body, untouched.
//! Decoding inverts the mapping; it does not consult the body's declared
//! content type.

use lapin::types::{AMQPValue, FieldTable};
use lapin::BasicProperties;

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use uuid::Uuid;

use crate::{Envelope, Error, PublishProperties, Result};

/// AMQP delivery mode marking a message persistent.
const PERSISTENT: u8 = 2;

/// Build the wire properties and body for an outgoing envelope.
pub(crate) fn encode(
    envelope: &Envelope,
    origin_queue: &str,
    content_type: &str,
    encoding_name: &str,
    publish: &PublishProperties,
) -> (BasicProperties, Vec<u8>) {
    // ---
    let mut headers = FieldTable::default();
    for (key, value) in &envelope.headers {
        headers.insert(
            key.as_str().into(),
            AMQPValue::LongString(value.as_str().into()),
        );
    }

    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default();

    let mut properties = BasicProperties::default()
        .with_message_id(envelope.id.to_string().into())
        .with_app_id(origin_queue.into())
        .with_content_type(content_type.into())
        .with_content_encoding(encoding_name.into())
        .with_delivery_mode(PERSISTENT)
        .with_timestamp(timestamp)
        .with_headers(headers);

    if let Some(priority) = publish.priority {
        properties = properties.with_priority(priority);
    }
    if let Some(expiration_ms) = publish.expiration_ms {
        properties = properties.with_expiration(expiration_ms.to_string().into());
    }

    (properties, envelope.payload.clone().into_bytes())
}

/// Rebuild an envelope from an incoming delivery.
///
/// Fails with `Error::Codec` when the message id is missing or not a UUID,
/// when a header claims to be a string but is not UTF-8, or when the body is
/// not UTF-8. Header values of other types (broker-added bookkeeping such as
/// `x-death`) are skipped.
pub(crate) fn decode(properties: &BasicProperties, body: &[u8]) -> Result<Envelope> {
    // ---
    let id = properties
        .message_id()
        .as_ref()
        .ok_or_else(|| Error::Codec("missing message id".to_string()))?;
    let id = Uuid::parse_str(id.as_str())
        .map_err(|_| Error::Codec(format!("message id {id} is not a uuid")))?;

    let mut headers = BTreeMap::new();
    if let Some(table) = properties.headers().as_ref() {
        for (key, value) in table.inner() {
            if let AMQPValue::LongString(value) = value {
                let value = String::from_utf8(value.as_bytes().to_vec())
                    .map_err(|_| Error::Codec(format!("header {key} is not utf-8")))?;
                headers.insert(key.as_str().to_string(), value);
            }
        }
    }

    let payload = String::from_utf8(body.to_vec())
        .map_err(|_| Error::Codec("payload is not utf-8".to_string()))?;

    Ok(Envelope::from_parts(id, headers, payload))
}

// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn no_publish_overrides() -> PublishProperties {
        PublishProperties::default()
    }

    #[test]
    fn round_trip_preserves_the_envelope() {
        let envelope = Envelope::new(r#"{"answer": 42}"#)
            .with_header("message-type", "AnswerFound")
            .with_header("attempt", "3");

        let (properties, body) = encode(
            &envelope,
            "Orders",
            "application/json",
            "utf-8",
            &no_publish_overrides(),
        );
        let decoded = decode(&properties, &body).unwrap();

        assert_eq!(decoded, envelope);
    }

    #[test]
    fn outgoing_messages_are_fully_stamped() {
        let before = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs();
        let envelope = Envelope::new("x");

        let (properties, _) = encode(
            &envelope,
            "Orders",
            "application/json",
            "utf-8",
            &no_publish_overrides(),
        );

        assert_eq!(
            properties.message_id().as_ref().unwrap().as_str(),
            envelope.id.to_string()
        );
        assert_eq!(properties.app_id().as_ref().unwrap().as_str(), "Orders");
        assert_eq!(
            properties.content_type().as_ref().unwrap().as_str(),
            "application/json"
        );
        assert_eq!(
            properties.content_encoding().as_ref().unwrap().as_str(),
            "utf-8"
        );
        assert_eq!(properties.delivery_mode(), &Some(PERSISTENT));
        assert!(matches!(properties.timestamp(), Some(stamped) if *stamped >= before));
        assert_eq!(properties.priority(), &None);
        assert_eq!(properties.expiration(), &None);
    }

    #[test]
    fn publish_overrides_become_properties() {
        let publish = PublishProperties {
            priority: Some(9),
            expiration_ms: Some(15_000),
        };

        let (properties, _) = encode(&Envelope::new("x"), "Q", "t", "e", &publish);

        assert_eq!(properties.priority(), &Some(9));
        assert_eq!(properties.expiration().as_ref().unwrap().as_str(), "15000");
    }

    #[test]
    fn missing_message_id_is_a_codec_error() {
        let result = decode(&BasicProperties::default(), b"body");

        assert!(matches!(result, Err(Error::Codec(_))));
    }

    #[test]
    fn non_uuid_message_id_is_a_codec_error() {
        let properties = BasicProperties::default().with_message_id("not-a-uuid".into());

        let result = decode(&properties, b"body");

        assert!(matches!(result, Err(Error::Codec(_))));
    }

    #[test]
    fn non_utf8_payload_is_a_codec_error() {
        let envelope = Envelope::new("x");
        let (properties, _) = encode(&envelope, "Q", "t", "e", &no_publish_overrides());

        let result = decode(&properties, &[0xff, 0xfe]);

        assert!(matches!(result, Err(Error::Codec(_))));
    }

    #[test]
    fn foreign_header_types_are_skipped() {
        let envelope = Envelope::new("x").with_header("ours", "kept");
        let (properties, body) = encode(&envelope, "Q", "t", "e", &no_publish_overrides());

        let mut headers = properties.headers().clone().unwrap_or_default();
        headers.insert("x-death".into(), AMQPValue::LongLongInt(4));
        let properties = properties.with_headers(headers);

        let decoded = decode(&properties, &body).unwrap();

        assert_eq!(decoded.headers.get("ours").unwrap(), "kept");
        assert!(!decoded.headers.contains_key("x-death"));
    }
}
