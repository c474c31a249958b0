// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Header Codec
//!
//! Converts message metadata headers between their wire representation
//! (binary-encoded AMQP field values) and typed values, and tracks the
//! retry-attempt counter and creation timestamp carried by every message
//! routed through the resilience layer.

use chrono::Utc;
use lapin::{
    protocol::basic::AMQPProperties,
    types::{AMQPValue, ByteArray, FieldTable, LongLongInt, LongString, LongUInt, ShortString},
};
use std::collections::BTreeMap;
use tracing::debug;
use uuid::Uuid;

/// Header carrying the retry-attempt counter, starting at 1
pub const AMQP_HEADERS_ATTEMPT: &str = "attempt";
/// Header stamped once on first receipt and preserved across redeliveries
pub const AMQP_HEADERS_CREATED_AT: &str = "created-at";
/// Queue argument naming the dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Queue argument naming the dead letter routing key
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Exchange argument selecting the delayed exchange routing type
pub const AMQP_HEADERS_DELAYED_EXCHANGE_TYPE: &str = "x-delayed-type";
/// Header mirroring the per-message TTL in milliseconds
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";

/// Extracts the attempt counter and the decoded header map from a delivery.
///
/// Header values arrive binary-encoded and are UTF-8-decoded here. The
/// `attempt` header defaults to 1 when absent or unparsable, and `created-at`
/// is stamped exactly once: an existing value is preserved unchanged.
pub fn extract(properties: &AMQPProperties) -> (i64, BTreeMap<String, String>) {
    let mut headers = match properties.headers() {
        Some(table) => decode(table),
        None => BTreeMap::new(),
    };

    let attempt = headers
        .get(AMQP_HEADERS_ATTEMPT)
        .and_then(|value| value.parse::<i64>().ok())
        .unwrap_or(1);

    if !headers.contains_key(AMQP_HEADERS_CREATED_AT) {
        headers.insert(AMQP_HEADERS_CREATED_AT.to_owned(), Utc::now().to_rfc3339());
    }

    headers.insert(AMQP_HEADERS_ATTEMPT.to_owned(), attempt.to_string());

    (attempt, headers)
}

/// Decodes an AMQP field table into a string map.
pub fn decode(table: &FieldTable) -> BTreeMap<String, String> {
    let mut headers = BTreeMap::new();

    for (key, value) in table.inner() {
        let decoded = match value {
            AMQPValue::ByteArray(bytes) => {
                Some(String::from_utf8_lossy(bytes.as_slice()).into_owned())
            }
            AMQPValue::LongString(value) => {
                Some(String::from_utf8_lossy(value.as_bytes()).into_owned())
            }
            AMQPValue::ShortString(value) => Some(value.as_str().to_owned()),
            AMQPValue::ShortShortInt(value) => Some(value.to_string()),
            AMQPValue::ShortShortUInt(value) => Some(value.to_string()),
            AMQPValue::ShortInt(value) => Some(value.to_string()),
            AMQPValue::ShortUInt(value) => Some(value.to_string()),
            AMQPValue::LongInt(value) => Some(value.to_string()),
            AMQPValue::LongUInt(value) => Some(value.to_string()),
            AMQPValue::LongLongInt(value) => Some(value.to_string()),
            AMQPValue::Boolean(value) => Some(value.to_string()),
            other => {
                debug!(key = key.as_str(), "skipping non-scalar header {:?}", other);
                None
            }
        };

        if let Some(decoded) = decoded {
            headers.insert(key.as_str().to_owned(), decoded);
        }
    }

    headers
}

/// Encodes a string map into an AMQP field table with binary values,
/// the wire representation used for redirected (retry/dead) publishes.
pub fn encode(headers: &BTreeMap<String, String>) -> FieldTable {
    let mut table = BTreeMap::<ShortString, AMQPValue>::new();

    for (key, value) in headers {
        table.insert(
            ShortString::from(key.as_str()),
            AMQPValue::ByteArray(ByteArray::from(value.as_bytes().to_vec())),
        );
    }

    FieldTable::from(table)
}

/// A typed header value supplied by publishers.
///
/// Timestamps and unique identifiers are stringified for wire transmission;
/// text and integer values pass through as-is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValue {
    Text(String),
    Int(i64),
    Uint(u32),
    Timestamp(chrono::DateTime<Utc>),
    Id(Uuid),
}

impl From<&HeaderValue> for AMQPValue {
    fn from(value: &HeaderValue) -> AMQPValue {
        match value {
            HeaderValue::Text(text) => AMQPValue::LongString(LongString::from(text.as_str())),
            HeaderValue::Int(int) => AMQPValue::LongLongInt(LongLongInt::from(*int)),
            HeaderValue::Uint(uint) => AMQPValue::LongUInt(LongUInt::from(*uint)),
            HeaderValue::Timestamp(ts) => {
                AMQPValue::LongString(LongString::from(ts.to_rfc3339()))
            }
            HeaderValue::Id(id) => AMQPValue::LongString(LongString::from(id.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use lapin::BasicProperties;

    fn byte_header(key: &str, value: &str) -> FieldTable {
        let mut table = BTreeMap::new();
        table.insert(
            ShortString::from(key),
            AMQPValue::ByteArray(ByteArray::from(value.as_bytes().to_vec())),
        );
        FieldTable::from(table)
    }

    #[test]
    fn extract_defaults_attempt_to_one_and_stamps_created_at() {
        let properties = BasicProperties::default();

        let (attempt, headers) = extract(&properties);

        assert_eq!(attempt, 1);
        assert_eq!(headers.get(AMQP_HEADERS_ATTEMPT), Some(&"1".to_owned()));
        assert!(headers.contains_key(AMQP_HEADERS_CREATED_AT));
    }

    #[test]
    fn extract_preserves_existing_attempt_and_created_at() {
        let mut table = BTreeMap::new();
        table.insert(
            ShortString::from(AMQP_HEADERS_ATTEMPT),
            AMQPValue::ByteArray(ByteArray::from(b"2".to_vec())),
        );
        table.insert(
            ShortString::from(AMQP_HEADERS_CREATED_AT),
            AMQPValue::ByteArray(ByteArray::from(b"2026-01-01T00:00:00+00:00".to_vec())),
        );
        let properties = BasicProperties::default().with_headers(FieldTable::from(table));

        let (attempt, headers) = extract(&properties);

        assert_eq!(attempt, 2);
        assert_eq!(
            headers.get(AMQP_HEADERS_CREATED_AT),
            Some(&"2026-01-01T00:00:00+00:00".to_owned())
        );
    }

    #[test]
    fn extract_falls_back_on_unparsable_attempt() {
        let properties =
            BasicProperties::default().with_headers(byte_header(AMQP_HEADERS_ATTEMPT, "oops"));

        let (attempt, _) = extract(&properties);

        assert_eq!(attempt, 1);
    }

    #[test]
    fn encode_then_decode_round_trips_strings() {
        let mut headers = BTreeMap::new();
        headers.insert("x".to_owned(), "v".to_owned());

        let decoded = decode(&encode(&headers));

        assert_eq!(decoded.get("x"), Some(&"v".to_owned()));
    }

    #[test]
    fn header_values_stringify_timestamps_and_ids() {
        let ts = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
        let id = Uuid::new_v4();

        assert_eq!(
            AMQPValue::from(&HeaderValue::Timestamp(ts)),
            AMQPValue::LongString(LongString::from(ts.to_rfc3339()))
        );
        assert_eq!(
            AMQPValue::from(&HeaderValue::Id(id)),
            AMQPValue::LongString(LongString::from(id.to_string()))
        );
        assert_eq!(
            AMQPValue::from(&HeaderValue::Text("v".to_owned())),
            AMQPValue::LongString(LongString::from("v"))
        );
        assert_eq!(
            AMQPValue::from(&HeaderValue::Int(7)),
            AMQPValue::LongLongInt(LongLongInt::from(7i64))
        );
    }
}
