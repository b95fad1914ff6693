//! Mapping between connector messages and Kafka records.
//!
//! Header values travel as UTF-8 bytes. String headers are written as-is;
//! other JSON values are written as their JSON text and read back as strings.
//! Null headers are not written.

use message_connector_core::{Message, MessageHeaders};
use rdkafka::message::{Header, Headers, OwnedHeaders};
use serde_json::Value;
use uuid::Uuid;

/// Convert connector headers to Kafka headers.
#[must_use]
pub fn to_kafka_headers(headers: &MessageHeaders) -> OwnedHeaders {
    let mut names: Vec<&String> = headers.iter().map(|(name, _)| name).collect();
    names.sort();

    names.into_iter().fold(
        OwnedHeaders::new_with_capacity(headers.len()),
        |kafka_headers, name| match headers.get(name) {
            None | Some(Value::Null) => kafka_headers,
            Some(Value::String(value)) => kafka_headers.insert(Header {
                key: name,
                value: Some(value.as_str()),
            }),
            Some(other) => kafka_headers.insert(Header {
                key: name,
                value: Some(other.to_string().as_str()),
            }),
        },
    )
}

/// Read Kafka headers into connector headers.
///
/// Headers without a value or with a non-UTF-8 value are skipped.
#[must_use]
pub fn header_map<H: Headers>(headers: &H) -> MessageHeaders {
    headers
        .iter()
        .filter_map(|header| {
            let Some(raw) = header.value else {
                return None;
            };
            match std::str::from_utf8(raw) {
                Ok(value) => Some((header.key.to_string(), Value::String(value.to_string()))),
                Err(_) => {
                    tracing::debug!(header = header.key, "Skipping non UTF-8 header");
                    None
                }
            }
        })
        .collect()
}

/// Name-based id of the record at `topic` / `partition` / `offset`.
#[must_use]
pub fn offset_message_id(topic: &str, partition: i32, offset: i64) -> Uuid {
    Uuid::new_v5(
        &Uuid::NAMESPACE_URL,
        format!("kafka://{topic}/{partition}/{offset}").as_bytes(),
    )
}

/// Build the inbound message for a Kafka record.
///
/// A valid `id` header is kept; otherwise the id is derived from the record
/// position. A record without payload becomes an empty payload, which the
/// flow rejects as undecodable.
#[must_use]
pub fn inbound_message(
    topic: &str,
    partition: i32,
    offset: i64,
    headers: &MessageHeaders,
    payload: Option<&[u8]>,
) -> Message<Vec<u8>> {
    let builder = Message::builder(payload.map(<[u8]>::to_vec).unwrap_or_default()).copy_headers(headers);
    let has_id = headers
        .get_str(MessageHeaders::ID)
        .is_some_and(|raw| Uuid::parse_str(raw).is_ok());

    if has_id {
        builder.build()
    } else {
        builder.id(offset_message_id(topic, partition, offset)).build()
    }
}
