// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Message-Exchange Service
//!
//! This module provides the error taxonomy for the message-exchange layer.
//! The `AmqpError` enum covers connection and channel lifecycle, publishing
//! with confirms, payload encoding/decoding, the reply-wait protocol, and
//! consumer registration.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// Construction-time failures (connection open, malformed configuration)
/// and per-publish/per-call failures surface to the caller through these
/// variants. Per-message consumer failures are contained inside the dispatch
/// pipeline and only logged, so they never appear here.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AmqpError {
    /// Caller misuse: a mandatory configuration field is missing or invalid
    #[error("invalid configuration: {0}")]
    ConfigError(String),

    /// Error preparing the TLS material for a secured connection
    #[error("tls setup failure: {0}")]
    SecurityError(String),

    /// Error establishing a connection to the broker
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel: {0}")]
    ChannelError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos: {0}")]
    QoSDeclarationError(String),

    /// Error registering a consumer on a queue
    #[error("failure to declare consumer on `{0}`")]
    ConsumerError(String),

    /// Error publishing a message or a negative broker confirmation
    #[error("failure to publish: {0}")]
    PublishError(String),

    /// Error serializing or deserializing a JSON payload
    #[error("failure to process json payload: {0}")]
    JsonCodecError(String),

    /// Error serializing or deserializing an XML payload
    #[error("failure to process xml payload: {0}")]
    XmlCodecError(String),

    /// The message carries no content type usable for the expected payload type
    #[error("unsupported content type: {0}")]
    UnsupportedContentTypeError(String),

    /// The reply-wait deadline elapsed before a matching reply arrived
    #[error("timed out waiting for a reply")]
    TimeoutError,

    /// The broker cancelled a subscription (queue deleted, node failure)
    #[error("subscription cancelled by the broker")]
    CancelledError,

    /// Any unanticipated failure, with its original cause rendered to text
    #[error("internal error: {0}")]
    UnknownError(String),
}
