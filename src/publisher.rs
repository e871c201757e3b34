// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Publisher
//!
//! This module implements the publish-with-confirmation path. Every publish
//! runs on its own short-lived channel in publisher-confirm mode: the call
//! returns only once the broker acknowledged the message, and a negative
//! acknowledgment surfaces as an error instead of a silent success. The
//! channel is released on every exit path.

use crate::codec;
use crate::config::ProducerConfig;
use crate::connection::{close_channel, AmqpConnection};
use crate::errors::AmqpError;
use crate::headers::{self, HeaderValue};
use crate::otel::AmqpTracePropagator;
use lapin::options::{BasicPublishOptions, ConfirmSelectOptions};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{AMQPValue, FieldTable, ShortString};
use lapin::{BasicProperties, Channel};
use opentelemetry::{global, Context};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::error;
use uuid::Uuid;

/// Encoding stamped into the content-encoding property
pub(crate) const UTF8_ENCODING: &str = "UTF-8";
/// AMQP delivery mode for messages surviving a broker restart
pub(crate) const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// Publishes application messages to the broker with confirms.
pub struct Publisher {
    connection: Arc<AmqpConnection>,
}

impl Publisher {
    /// Creates a new publisher on the given connection.
    pub fn new(connection: Arc<AmqpConnection>) -> Publisher {
        Publisher { connection }
    }

    /// Publishes a message and waits for the broker confirmation.
    ///
    /// The message body is serialized according to the producer
    /// configuration's content kind; headers are enriched with the origin
    /// exchange, routing key and sender IP before publishing.
    ///
    /// # Returns
    /// * `Result<String, AmqpError>` - the generated message id, usable as a
    ///   correlation handle by the caller.
    pub async fn push<E: Serialize>(
        &self,
        config: &ProducerConfig,
        headers: Option<HashMap<String, HeaderValue>>,
        message: &E,
    ) -> Result<String, AmqpError> {
        validate_producer(config)?;

        let channel = self.connection.create_channel().await?;
        let result = self
            .push_on_channel(&channel, config, headers, message)
            .await;
        close_channel(&channel).await;

        result
    }

    /// Publishes on a caller-owned channel.
    ///
    /// The reply-wait protocol publishes its request on the same channel it
    /// then consumes the reply from, so the channel lifecycle stays with the
    /// caller here.
    pub(crate) async fn push_on_channel<E: Serialize>(
        &self,
        channel: &Channel,
        config: &ProducerConfig,
        headers: Option<HashMap<String, HeaderValue>>,
        message: &E,
    ) -> Result<String, AmqpError> {
        confirm_select(channel).await?;

        let mut table = headers::to_amqp_table(headers);
        headers::enrich_publish_headers(
            &mut table,
            config.exchange(),
            config.routing_key(),
            self.connection.sender_ip(),
        );
        global::get_text_map_propagator(|propagator| {
            propagator.inject_context(&Context::current(), &mut AmqpTracePropagator::new(&mut table))
        });

        let message_id = Uuid::new_v4().to_string();
        let body = codec::encode(message, config.content_kind())?;
        let properties = build_envelope(
            config,
            table,
            &message_id,
            std::any::type_name::<E>(),
            self.connection.username(),
            self.connection.application_name(),
        );

        publish_confirmed(channel, config.exchange(), config.routing_key(), properties, &body)
            .await?;

        Ok(message_id)
    }
}

pub(crate) fn validate_producer(config: &ProducerConfig) -> Result<(), AmqpError> {
    if config.reply_to_queue().is_some() && config.correlation_id().is_none() {
        return Err(AmqpError::ConfigError(
            "a reply-to queue requires a correlation id".to_owned(),
        ));
    }
    Ok(())
}

/// Builds the full message envelope for a publish.
pub(crate) fn build_envelope(
    config: &ProducerConfig,
    table: BTreeMap<ShortString, AMQPValue>,
    message_id: &str,
    type_name: &str,
    username: &str,
    application_name: &str,
) -> BasicProperties {
    let mut properties = BasicProperties::default()
        .with_content_type(ShortString::from(config.content_kind().as_str()))
        .with_content_encoding(ShortString::from(UTF8_ENCODING))
        .with_headers(FieldTable::from(table))
        .with_delivery_mode(PERSISTENT_DELIVERY_MODE)
        .with_message_id(ShortString::from(message_id))
        .with_timestamp(unix_timestamp())
        .with_type(ShortString::from(type_name))
        .with_user_id(ShortString::from(username))
        .with_app_id(ShortString::from(application_name));

    if let Some(reply_to) = config.reply_to_queue() {
        properties = properties.with_reply_to(ShortString::from(reply_to));
    }
    if let Some(correlation_id) = config.correlation_id() {
        properties = properties.with_correlation_id(ShortString::from(correlation_id));
    }

    properties
}

/// Puts a channel into publisher-confirm mode.
pub(crate) async fn confirm_select(channel: &Channel) -> Result<(), AmqpError> {
    match channel.confirm_select(ConfirmSelectOptions::default()).await {
        Ok(()) => Ok(()),
        Err(err) => {
            error!(error = err.to_string(), "error to select confirm mode");
            Err(AmqpError::PublishError(err.to_string()))
        }
    }
}

/// Publishes a payload and blocks until the broker confirms it.
pub(crate) async fn publish_confirmed(
    channel: &Channel,
    exchange: &str,
    routing_key: &str,
    properties: BasicProperties,
    payload: &[u8],
) -> Result<(), AmqpError> {
    let confirm = channel
        .basic_publish(
            exchange,
            routing_key,
            BasicPublishOptions {
                immediate: false,
                mandatory: false,
            },
            payload,
            properties,
        )
        .await
        .map_err(|err| {
            error!(error = err.to_string(), "error publishing message");
            AmqpError::PublishError(err.to_string())
        })?
        .await
        .map_err(|err| {
            error!(error = err.to_string(), "error waiting for the confirm");
            AmqpError::PublishError(err.to_string())
        })?;

    if let Confirmation::Nack(_) = confirm {
        error!("broker negatively acknowledged the publish");
        return Err(AmqpError::PublishError(
            "negative acknowledgment from the broker".to_owned(),
        ));
    }

    Ok(())
}

pub(crate) fn unix_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content_type::ContentKind;

    #[test]
    fn reply_to_requires_correlation_id() {
        let config = ProducerConfig::new("orders", "")
            .unwrap()
            .with_reply_to("reply-q");
        assert!(matches!(
            validate_producer(&config),
            Err(AmqpError::ConfigError(_))
        ));

        let config = config.with_correlation_id("corr-1");
        assert!(validate_producer(&config).is_ok());
    }

    #[test]
    fn envelope_carries_identity_and_delivery_metadata() {
        let config = ProducerConfig::new("orders", "orders.created")
            .unwrap()
            .with_content_kind(ContentKind::Plain)
            .with_reply_to("reply-q")
            .with_correlation_id("corr-1");

        let properties = build_envelope(
            &config,
            BTreeMap::new(),
            "msg-1",
            "alloc::string::String",
            "karim",
            "mock-app",
        );

        assert_eq!(
            properties.content_type().as_ref().map(|v| v.as_str()),
            Some("text/plain")
        );
        assert_eq!(
            properties.content_encoding().as_ref().map(|v| v.as_str()),
            Some("UTF-8")
        );
        assert_eq!(properties.delivery_mode(), &Some(PERSISTENT_DELIVERY_MODE));
        assert_eq!(
            properties.message_id().as_ref().map(|v| v.as_str()),
            Some("msg-1")
        );
        assert_eq!(
            properties.kind().as_ref().map(|v| v.as_str()),
            Some("alloc::string::String")
        );
        assert_eq!(
            properties.user_id().as_ref().map(|v| v.as_str()),
            Some("karim")
        );
        assert_eq!(
            properties.app_id().as_ref().map(|v| v.as_str()),
            Some("mock-app")
        );
        assert_eq!(
            properties.reply_to().as_ref().map(|v| v.as_str()),
            Some("reply-q")
        );
        assert_eq!(
            properties.correlation_id().as_ref().map(|v| v.as_str()),
            Some("corr-1")
        );
        assert!(properties.timestamp().is_some());
    }

    #[test]
    fn envelope_omits_reply_metadata_when_unset() {
        let config = ProducerConfig::new("orders", "").unwrap();
        let properties =
            build_envelope(&config, BTreeMap::new(), "msg-1", "t", "guest", "mock-app");

        assert!(properties.reply_to().is_none());
        assert!(properties.correlation_id().is_none());
    }
}
