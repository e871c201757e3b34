// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Body Codec
//!
//! This module converts application values to and from wire payloads for the
//! supported content types. JSON is handled by `serde_json`, XML by
//! `quick-xml`, and plain text passes through unchanged. Plain text is only
//! valid for string-like values: a typed payload delivered without a usable
//! content type is a caller error, not something to guess about.

use crate::content_type::ContentKind;
use crate::errors::AmqpError;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Serializes a value into a wire payload for the given content kind.
pub fn encode<E: Serialize>(value: &E, kind: ContentKind) -> Result<Vec<u8>, AmqpError> {
    match kind {
        ContentKind::Json => {
            serde_json::to_vec(value).map_err(|err| AmqpError::JsonCodecError(err.to_string()))
        }
        ContentKind::Xml => quick_xml::se::to_string(value)
            .map(String::into_bytes)
            .map_err(|err| AmqpError::XmlCodecError(err.to_string())),
        ContentKind::Plain => match serde_json::to_value(value) {
            Ok(serde_json::Value::String(text)) => Ok(text.into_bytes()),
            _ => Err(AmqpError::UnsupportedContentTypeError(
                "plain text messages must be strings".to_owned(),
            )),
        },
    }
}

/// Deserializes a wire payload into the expected type.
///
/// `kind` is the content type resolved from the message properties, falling
/// back to the consumer configuration; `None` means neither carried one.
/// Plain and missing content types only decode into string-like targets.
pub fn decode<M: DeserializeOwned>(body: &[u8], kind: Option<ContentKind>) -> Result<M, AmqpError> {
    match kind {
        Some(ContentKind::Json) => {
            serde_json::from_slice(body).map_err(|err| AmqpError::JsonCodecError(err.to_string()))
        }
        Some(ContentKind::Xml) => {
            let text = std::str::from_utf8(body)
                .map_err(|err| AmqpError::XmlCodecError(err.to_string()))?;
            quick_xml::de::from_str(text).map_err(|err| AmqpError::XmlCodecError(err.to_string()))
        }
        Some(ContentKind::Plain) | None => {
            let text = String::from_utf8(body.to_vec()).map_err(|err| {
                AmqpError::UnsupportedContentTypeError(err.to_string())
            })?;
            serde_json::from_value(serde_json::Value::String(text)).map_err(|_| {
                AmqpError::UnsupportedContentTypeError(
                    "message carries no content type usable for the expected payload type"
                        .to_owned(),
                )
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Order {
        id: u32,
        customer: String,
    }

    #[test]
    fn json_roundtrip() {
        let order = Order {
            id: 7,
            customer: "acme".to_owned(),
        };

        let bytes = encode(&order, ContentKind::Json).unwrap();
        let decoded: Order = decode(&bytes, Some(ContentKind::Json)).unwrap();
        assert_eq!(decoded, order);
    }

    #[test]
    fn xml_roundtrip() {
        let order = Order {
            id: 7,
            customer: "acme".to_owned(),
        };

        let bytes = encode(&order, ContentKind::Xml).unwrap();
        let decoded: Order = decode(&bytes, Some(ContentKind::Xml)).unwrap();
        assert_eq!(decoded, order);
    }

    #[test]
    fn plain_text_passes_through_unchanged() {
        let bytes = encode(&"hello".to_owned(), ContentKind::Plain).unwrap();
        assert_eq!(bytes, b"hello");

        let decoded: String = decode(&bytes, Some(ContentKind::Plain)).unwrap();
        assert_eq!(decoded, "hello");
    }

    #[test]
    fn plain_rejects_non_string_values() {
        let order = Order {
            id: 7,
            customer: "acme".to_owned(),
        };

        assert!(matches!(
            encode(&order, ContentKind::Plain),
            Err(AmqpError::UnsupportedContentTypeError(_))
        ));
    }

    #[test]
    fn typed_target_without_content_type_is_rejected() {
        let result: Result<Order, AmqpError> = decode(b"{\"id\":7,\"customer\":\"acme\"}", None);
        assert!(matches!(
            result,
            Err(AmqpError::UnsupportedContentTypeError(_))
        ));
    }

    #[test]
    fn string_target_accepts_missing_content_type() {
        let decoded: String = decode(b"raw text", None).unwrap();
        assert_eq!(decoded, "raw text");
    }

    #[test]
    fn malformed_json_is_a_codec_error() {
        let result: Result<Order, AmqpError> = decode(b"{not json", Some(ContentKind::Json));
        assert!(matches!(result, Err(AmqpError::JsonCodecError(_))));
    }
}
