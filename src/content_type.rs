// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Content-Type Tags
//!
//! This module defines the content types a message body can carry. The tag
//! travels in the `content_type` message property and drives how the body is
//! serialized on publish and deserialized on dispatch.

use std::fmt;

/// Wire value for plain text payloads
pub const TEXT_PLAIN: &str = "text/plain";
/// Wire value for XML payloads
pub const APPLICATION_XML: &str = "application/xml";
/// Wire value for JSON payloads
pub const APPLICATION_JSON: &str = "application/json";

/// The supported message body encodings.
///
/// Producers default to `Json` when no content type is configured.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ContentKind {
    Plain,
    Xml,
    #[default]
    Json,
}

impl ContentKind {
    /// Returns the wire representation of this content kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentKind::Plain => TEXT_PLAIN,
            ContentKind::Xml => APPLICATION_XML,
            ContentKind::Json => APPLICATION_JSON,
        }
    }

    /// Parses a wire content-type value.
    ///
    /// Unknown values yield `None`; the dispatch pipeline then falls back to
    /// the consumer configuration's content kind.
    pub fn parse(value: &str) -> Option<ContentKind> {
        match value {
            TEXT_PLAIN => Some(ContentKind::Plain),
            APPLICATION_XML => Some(ContentKind::Xml),
            APPLICATION_JSON => Some(ContentKind::Json),
            _ => None,
        }
    }
}

impl fmt::Display for ContentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_roundtrip() {
        for kind in [ContentKind::Plain, ContentKind::Xml, ContentKind::Json] {
            assert_eq!(ContentKind::parse(kind.as_str()), Some(kind));
        }
    }

    #[test]
    fn parse_unknown_is_none() {
        assert_eq!(ContentKind::parse("application/octet-stream"), None);
        assert_eq!(ContentKind::parse(""), None);
    }

    #[test]
    fn default_is_json() {
        assert_eq!(ContentKind::default(), ContentKind::Json);
    }
}
