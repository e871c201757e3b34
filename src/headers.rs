// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Headers
//!
//! This module defines the wire-visible header keys, the application-facing
//! header value type and the conversions between that type and lapin's
//! `AMQPValue`. It also implements the two header transformations used by the
//! exchange service: enriching outgoing headers with origin markers and
//! flattening incoming message properties into a single header map.

use lapin::protocol::basic::AMQPProperties;
use lapin::types::{AMQPValue, LongString, ShortString};
use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;

/// Content-type message property, mirrored into the header map
pub const CONTENT_TYPE: &str = "CONTENT_TYPE";
/// Content-encoding message property, mirrored into the header map
pub const CONTENT_ENCODING: &str = "CONTENT_ENCODING";
/// Reply-queue message property, mirrored into the header map
pub const REPLY_TO: &str = "REPLY_TO";
/// Correlation-id message property, mirrored into the header map
pub const CORRELATION_ID: &str = "CORRELATION_ID";
/// Message-id message property, mirrored into the header map
pub const MESSAGE_ID: &str = "MESSAGE_ID";
/// Timestamp message property, mirrored into the header map
pub const TIMESTAMP: &str = "TIMESTAMP";
/// Type-name message property, mirrored into the header map
pub const TYPE: &str = "TYPE";
/// Application-id message property, mirrored into the header map
pub const APPLICATION_ID: &str = "APPLICATION_ID";
/// User-id message property, mirrored into the header map
pub const USER_ID: &str = "USER_ID";
/// Origin exchange a message was published to
pub const ORIGIN_EXCHANGE_NAME: &str = "EJ_ORIGIN_ECHANGE_NAME";
/// Origin routing key a message was published with
pub const ORIGIN_ROUTING_KEY: &str = "EJ_ORIGIN_ROUTING_KEY";
/// Sender IP address, best-effort
pub const ORIGIN_IP: &str = "EJ_ORIGIN_IP";
/// Reserved requeue counter slot, not written by the core paths
pub const REQUEUE_COUNT: &str = "EJ_REQUEUE_COUNT";
/// Reserved requeue failure-detail slot, not written by the core paths
pub const REQUEUE_EXCEPTION: &str = "EJ_REQUEUE_EXCEPTION";

/// An application-facing header value.
///
/// Covers the value kinds the service reads and writes on the wire; field
/// tables and arrays are not forwarded to handlers.
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    Str(String),
    Bool(bool),
    Short(i16),
    Int(i32),
    Long(i64),
    UInt(u32),
    Timestamp(u64),
}

impl HeaderValue {
    /// Returns the string content when this value is textual.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            HeaderValue::Str(v) => Some(v),
            _ => None,
        }
    }

    pub(crate) fn to_amqp(&self) -> AMQPValue {
        match self {
            HeaderValue::Str(v) => AMQPValue::LongString(LongString::from(v.clone())),
            HeaderValue::Bool(v) => AMQPValue::Boolean(*v),
            HeaderValue::Short(v) => AMQPValue::ShortInt(*v),
            HeaderValue::Int(v) => AMQPValue::LongInt(*v),
            HeaderValue::Long(v) => AMQPValue::LongLongInt(*v),
            HeaderValue::UInt(v) => AMQPValue::LongUInt(*v),
            HeaderValue::Timestamp(v) => AMQPValue::Timestamp(*v),
        }
    }

    pub(crate) fn from_amqp(value: &AMQPValue) -> Option<HeaderValue> {
        match value {
            AMQPValue::LongString(v) => Some(HeaderValue::Str(
                String::from_utf8_lossy(v.as_bytes()).into_owned(),
            )),
            AMQPValue::ShortString(v) => Some(HeaderValue::Str(v.to_string())),
            AMQPValue::Boolean(v) => Some(HeaderValue::Bool(*v)),
            AMQPValue::ShortShortInt(v) => Some(HeaderValue::Short(i16::from(*v))),
            AMQPValue::ShortShortUInt(v) => Some(HeaderValue::Short(i16::from(*v))),
            AMQPValue::ShortInt(v) => Some(HeaderValue::Short(*v)),
            AMQPValue::ShortUInt(v) => Some(HeaderValue::UInt(u32::from(*v))),
            AMQPValue::LongInt(v) => Some(HeaderValue::Int(*v)),
            AMQPValue::LongUInt(v) => Some(HeaderValue::UInt(*v)),
            AMQPValue::LongLongInt(v) => Some(HeaderValue::Long(*v)),
            AMQPValue::Timestamp(v) => Some(HeaderValue::Timestamp(*v)),
            _ => None,
        }
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::Str(value.to_owned())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        HeaderValue::Str(value)
    }
}

/// Converts an application header map into the table lapin publishes.
pub(crate) fn to_amqp_table(
    headers: Option<HashMap<String, HeaderValue>>,
) -> BTreeMap<ShortString, AMQPValue> {
    let mut table = BTreeMap::new();

    if let Some(headers) = headers {
        for (key, value) in headers {
            table.insert(ShortString::from(key), value.to_amqp());
        }
    }

    table
}

/// Enriches outgoing headers with the three origin markers.
pub(crate) fn enrich_publish_headers(
    table: &mut BTreeMap<ShortString, AMQPValue>,
    exchange: &str,
    routing_key: &str,
    sender_ip: IpAddr,
) {
    table.insert(
        ShortString::from(ORIGIN_EXCHANGE_NAME),
        AMQPValue::LongString(LongString::from(exchange)),
    );
    table.insert(
        ShortString::from(ORIGIN_ROUTING_KEY),
        AMQPValue::LongString(LongString::from(routing_key)),
    );
    table.insert(
        ShortString::from(ORIGIN_IP),
        AMQPValue::LongString(LongString::from(sender_ip.to_string())),
    );
}

/// Flattens the built-in message properties and the custom header table of a
/// delivery into one map.
///
/// Properties that are absent on the message are not inserted; custom header
/// values of unsupported kinds (nested tables, arrays) are skipped.
pub(crate) fn headers_from_properties(props: &AMQPProperties) -> HashMap<String, HeaderValue> {
    let mut headers = HashMap::new();

    if let Some(table) = props.headers() {
        for (key, value) in table.inner() {
            if let Some(value) = HeaderValue::from_amqp(value) {
                headers.insert(key.to_string(), value);
            }
        }
    }

    let text_props = [
        (CONTENT_TYPE, props.content_type()),
        (CONTENT_ENCODING, props.content_encoding()),
        (REPLY_TO, props.reply_to()),
        (CORRELATION_ID, props.correlation_id()),
        (MESSAGE_ID, props.message_id()),
        (TYPE, props.kind()),
        (APPLICATION_ID, props.app_id()),
        (USER_ID, props.user_id()),
    ];
    for (key, value) in text_props {
        if let Some(value) = value {
            headers.insert(key.to_owned(), HeaderValue::Str(value.to_string()));
        }
    }

    if let Some(timestamp) = props.timestamp() {
        headers.insert(TIMESTAMP.to_owned(), HeaderValue::Timestamp(*timestamp));
    }

    headers
}

#[cfg(test)]
mod tests {
    use super::*;
    use lapin::types::FieldTable;
    use lapin::BasicProperties;
    use std::net::Ipv4Addr;

    #[test]
    fn header_value_amqp_roundtrip() {
        let values = [
            HeaderValue::Str("abc".to_owned()),
            HeaderValue::Bool(true),
            HeaderValue::Short(-3),
            HeaderValue::Int(42),
            HeaderValue::Long(-7_000_000_000),
            HeaderValue::UInt(12),
            HeaderValue::Timestamp(1_700_000_000),
        ];

        for value in values {
            assert_eq!(HeaderValue::from_amqp(&value.to_amqp()), Some(value));
        }
    }

    #[test]
    fn unsupported_amqp_value_is_skipped() {
        assert_eq!(
            HeaderValue::from_amqp(&AMQPValue::FieldTable(FieldTable::default())),
            None
        );
    }

    #[test]
    fn enrichment_adds_origin_markers() {
        let mut table = BTreeMap::new();
        enrich_publish_headers(
            &mut table,
            "orders",
            "orders.created",
            IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3)),
        );

        assert_eq!(
            table.get(&ShortString::from(ORIGIN_EXCHANGE_NAME)),
            Some(&AMQPValue::LongString(LongString::from("orders")))
        );
        assert_eq!(
            table.get(&ShortString::from(ORIGIN_ROUTING_KEY)),
            Some(&AMQPValue::LongString(LongString::from("orders.created")))
        );
        assert_eq!(
            table.get(&ShortString::from(ORIGIN_IP)),
            Some(&AMQPValue::LongString(LongString::from("10.1.2.3")))
        );
    }

    #[test]
    fn properties_flatten_into_header_map() {
        let mut custom = BTreeMap::new();
        custom.insert(
            ShortString::from("tenant"),
            AMQPValue::LongString(LongString::from("acme")),
        );

        let props = BasicProperties::default()
            .with_content_type(ShortString::from("application/json"))
            .with_reply_to(ShortString::from("reply-q"))
            .with_correlation_id(ShortString::from("corr-1"))
            .with_message_id(ShortString::from("msg-1"))
            .with_timestamp(1_700_000_000)
            .with_type(ShortString::from("alloc::string::String"))
            .with_app_id(ShortString::from("mock-app"))
            .with_user_id(ShortString::from("guest"))
            .with_headers(FieldTable::from(custom));

        let headers = headers_from_properties(&props);

        assert_eq!(headers.get("tenant"), Some(&HeaderValue::Str("acme".into())));
        assert_eq!(
            headers.get(CONTENT_TYPE),
            Some(&HeaderValue::Str("application/json".into()))
        );
        assert_eq!(headers.get(REPLY_TO), Some(&HeaderValue::Str("reply-q".into())));
        assert_eq!(
            headers.get(CORRELATION_ID),
            Some(&HeaderValue::Str("corr-1".into()))
        );
        assert_eq!(
            headers.get(TIMESTAMP),
            Some(&HeaderValue::Timestamp(1_700_000_000))
        );
        // absent properties stay absent
        assert!(!headers.contains_key(CONTENT_ENCODING));
    }
}
