// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Per-Message Consumer Pipeline
//!
//! This module processes one delivery end to end: flatten the message
//! properties into a header map, strip the transport metadata, deserialize
//! the body, invoke the application handler, send the courtesy reply when
//! the message asked for one, and resolve the delivery into an ack or a
//! reject. Failures are contained here: they become ack/reject decisions
//! and log lines, never exceptions thrown back into the broker client.

use crate::codec;
use crate::config::ConsumerConfig;
use crate::connection::{close_channel, AmqpConnection};
use crate::content_type::ContentKind;
use crate::dispatcher::MessageHandler;
use crate::errors::AmqpError;
use crate::headers::{self, HeaderValue};
use crate::otel;
use crate::publisher::{
    confirm_select, publish_confirmed, unix_timestamp, PERSISTENT_DELIVERY_MODE, UTF8_ENCODING,
};
use lapin::message::Delivery;
use lapin::options::{BasicAckOptions, BasicRejectOptions};
use lapin::types::{FieldTable, ShortString};
use lapin::BasicProperties;
use opentelemetry::global;
use opentelemetry::trace::{Span, Status};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, error};
use uuid::Uuid;

/// Processes one delivery through the full pipeline.
pub(crate) async fn dispatch_delivery<M, R>(
    connection: &Arc<AmqpConnection>,
    config: &ConsumerConfig,
    handler: &dyn MessageHandler<M, R>,
    delivery: Delivery,
) where
    M: DeserializeOwned + Send,
    R: Serialize + Send + Sync,
{
    let span_name = delivery
        .properties
        .kind()
        .as_ref()
        .map(|kind| kind.to_string())
        .unwrap_or_else(|| config.queue_name().to_owned());
    let (_ctx, mut span) = otel::new_span(
        &delivery.properties,
        &global::tracer("amqp consumer"),
        &span_name,
    );

    debug!(
        queue = config.queue_name(),
        exchange = delivery.exchange.as_str(),
        "received message"
    );

    let mut header_map = headers::headers_from_properties(&delivery.properties);
    let reply_to = take_text(&mut header_map, headers::REPLY_TO);
    let correlation_id = take_text(&mut header_map, headers::CORRELATION_ID);
    let content_type = take_text(&mut header_map, headers::CONTENT_TYPE);
    let message_id = header_map
        .get(headers::MESSAGE_ID)
        .and_then(|value| value.as_str().map(str::to_owned));

    let kind = resolve_content_kind(content_type.as_deref(), config.fallback_content_kind());
    let reply_target = reply_to.as_deref().filter(|queue| !queue.is_empty());

    let result = run_handler(handler, kind, &delivery.data, header_map).await;

    match result {
        Ok(reply) => {
            if let Some(reply_to) = reply_target {
                push_reply(
                    connection,
                    config.queue_name(),
                    reply_to,
                    correlation_id.as_deref(),
                    reply.as_ref(),
                )
                .await;
            }

            if !config.auto_ack() {
                if let Err(err) = delivery.ack(BasicAckOptions { multiple: false }).await {
                    error!(error = err.to_string(), "error whiling ack msg");
                    span.record_error(&err);
                    span.set_status(Status::Error {
                        description: Cow::from("error to ack msg"),
                    });
                    return;
                }
            }
            span.set_status(Status::Ok);
        }
        Err(err) => {
            error!(
                error = err.to_string(),
                message_id = message_id.as_deref().unwrap_or_default(),
                "exception during handling the message"
            );
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from("error handling message"),
            });

            if let Some(reply_to) = reply_target {
                // release the waiting requester instead of leaving it
                // hanging until its timeout
                push_reply::<R>(
                    connection,
                    config.queue_name(),
                    reply_to,
                    correlation_id.as_deref(),
                    None,
                )
                .await;

                if !config.auto_ack() {
                    if let Err(err) = delivery.ack(BasicAckOptions { multiple: false }).await {
                        error!(error = err.to_string(), "error whiling ack msg");
                    }
                }
            } else if !config.auto_ack() {
                // no requester to notify: dead-letter instead of reprocessing
                // the same poison message forever
                if let Err(err) = delivery
                    .reject(BasicRejectOptions { requeue: false })
                    .await
                {
                    error!(error = err.to_string(), "error whiling reject msg");
                }
            }
        }
    }
}

/// Deserializes the body and invokes the application handler.
pub(crate) async fn run_handler<M, R>(
    handler: &dyn MessageHandler<M, R>,
    kind: Option<ContentKind>,
    body: &[u8],
    header_map: HashMap<String, HeaderValue>,
) -> Result<Option<R>, AmqpError>
where
    M: DeserializeOwned + Send,
    R: Serialize + Send + Sync,
{
    let message = codec::decode::<M>(body, kind)?;
    handler.handle(message, header_map).await
}

/// Resolves the content kind of a delivery.
///
/// The message property wins; the consumer configuration's fallback applies
/// only when the property is absent entirely.
pub(crate) fn resolve_content_kind(
    message_content_type: Option<&str>,
    fallback: Option<ContentKind>,
) -> Option<ContentKind> {
    match message_content_type {
        Some(value) => ContentKind::parse(value),
        None => fallback,
    }
}

fn take_text(header_map: &mut HashMap<String, HeaderValue>, key: &str) -> Option<String> {
    match header_map.remove(key) {
        Some(HeaderValue::Str(value)) => Some(value),
        _ => None,
    }
}

/// Publishes the courtesy reply for a consumed message.
///
/// Best-effort: replying is a service to the requester, so failures here are
/// logged and swallowed rather than failing the delivery that was already
/// handled.
async fn push_reply<R: Serialize>(
    connection: &Arc<AmqpConnection>,
    from_queue: &str,
    reply_to: &str,
    correlation_id: Option<&str>,
    reply: Option<&R>,
) {
    let result = async {
        let channel = connection.create_channel().await?;
        let published = publish_reply_on_channel(
            connection,
            &channel,
            from_queue,
            reply_to,
            correlation_id,
            reply,
        )
        .await;
        close_channel(&channel).await;
        published
    }
    .await;

    if let Err(err) = result {
        error!(
            error = err.to_string(),
            reply_to, "failure to publish the reply"
        );
    }
}

async fn publish_reply_on_channel<R: Serialize>(
    connection: &Arc<AmqpConnection>,
    channel: &lapin::Channel,
    from_queue: &str,
    reply_to: &str,
    correlation_id: Option<&str>,
    reply: Option<&R>,
) -> Result<(), AmqpError> {
    confirm_select(channel).await?;

    let mut table = BTreeMap::new();
    headers::enrich_publish_headers(&mut table, "", from_queue, connection.sender_ip());

    let body = match reply {
        Some(reply) => serde_json::to_vec(reply)
            .map_err(|err| AmqpError::JsonCodecError(err.to_string()))?,
        None => vec![],
    };

    let mut properties = BasicProperties::default()
        .with_content_type(ShortString::from(ContentKind::Json.as_str()))
        .with_content_encoding(ShortString::from(UTF8_ENCODING))
        .with_headers(FieldTable::from(table))
        .with_delivery_mode(PERSISTENT_DELIVERY_MODE)
        .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
        .with_timestamp(unix_timestamp())
        .with_user_id(ShortString::from(connection.username()))
        .with_app_id(ShortString::from(connection.application_name()));

    if reply.is_some() {
        properties = properties.with_type(ShortString::from(std::any::type_name::<R>()));
    }
    if let Some(correlation_id) = correlation_id {
        properties = properties.with_correlation_id(ShortString::from(correlation_id));
    }

    publish_confirmed(channel, "", reply_to, properties, &body).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::mock;
    use mockall::predicate::eq;

    mock! {
        Handler {}

        #[async_trait::async_trait]
        impl MessageHandler<String, String> for Handler {
            async fn handle(
                &self,
                message: String,
                headers: HashMap<String, HeaderValue>,
            ) -> Result<Option<String>, AmqpError>;
        }
    }

    #[test]
    fn message_content_type_wins_over_fallback() {
        assert_eq!(
            resolve_content_kind(Some("application/xml"), Some(ContentKind::Json)),
            Some(ContentKind::Xml)
        );
    }

    #[test]
    fn fallback_applies_only_when_property_is_absent() {
        assert_eq!(
            resolve_content_kind(None, Some(ContentKind::Json)),
            Some(ContentKind::Json)
        );
        assert_eq!(resolve_content_kind(None, None), None);
        // an unknown value present on the message does not fall back
        assert_eq!(
            resolve_content_kind(Some("application/grpc"), Some(ContentKind::Json)),
            None
        );
    }

    #[tokio::test]
    async fn handler_receives_decoded_plain_text() {
        let mut handler = MockHandler::new();
        handler
            .expect_handle()
            .with(eq("ping".to_owned()), eq(HashMap::new()))
            .times(1)
            .returning(|_, _| Ok(Some("pong".to_owned())));

        let reply = run_handler(
            &handler,
            Some(ContentKind::Plain),
            b"ping",
            HashMap::new(),
        )
        .await
        .unwrap();

        assert_eq!(reply, Some("pong".to_owned()));
    }

    #[tokio::test]
    async fn handler_failure_propagates_to_the_disposition() {
        let mut handler = MockHandler::new();
        handler
            .expect_handle()
            .times(1)
            .returning(|_, _| Err(AmqpError::UnknownError("boom".to_owned())));

        let result = run_handler(
            &handler,
            Some(ContentKind::Json),
            b"\"ping\"",
            HashMap::new(),
        )
        .await;

        assert_eq!(result, Err(AmqpError::UnknownError("boom".to_owned())));
    }

    #[tokio::test]
    async fn undecodable_message_never_reaches_the_handler() {
        let mut handler = MockHandler::new();
        handler.expect_handle().times(0);

        let result = run_handler(&handler, Some(ContentKind::Json), b"{broken", HashMap::new())
            .await;

        assert!(matches!(result, Err(AmqpError::JsonCodecError(_))));
    }

    #[tokio::test]
    async fn headers_are_forwarded_to_the_handler() {
        let mut expected = HashMap::new();
        expected.insert("tenant".to_owned(), HeaderValue::Str("acme".to_owned()));

        let mut handler = MockHandler::new();
        handler
            .expect_handle()
            .with(eq("ping".to_owned()), eq(expected.clone()))
            .times(1)
            .returning(|_, _| Ok(None));

        let reply = run_handler(&handler, Some(ContentKind::Plain), b"ping", expected)
            .await
            .unwrap();

        assert_eq!(reply, None);
    }
}
