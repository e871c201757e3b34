// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Reply-Wait Protocol
//!
//! AMQP has no built-in call/response, so this module layers synchronous RPC
//! on top of the publish path and a reply queue. The caller publishes a
//! request carrying a reply-to queue and a correlation id, registers a
//! one-shot consumer on that queue, and blocks with a timeout until exactly
//! one outcome is handed over.
//!
//! The reply queue may be shared by several concurrent callers, so a
//! delivery is not necessarily ours: foreign replies are republished to the
//! same queue over a separate channel (isolating publish failures from the
//! receiving channel) and the original delivery is acknowledged, which makes
//! the caller-visible result independent of the delivery order on the queue.
//! A single-assignment slot guarantees that no second outcome can reach the
//! caller, no matter how many deliveries race to produce one.

use crate::config::ProducerConfig;
use crate::connection::{close_channel, AmqpConnection};
use crate::errors::AmqpError;
use crate::headers::HeaderValue;
use crate::publisher::{confirm_select, publish_confirmed, Publisher};
use futures_util::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicQosOptions, BasicRejectOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Consumer};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{error, warn};
use uuid::Uuid;

/// Default deadline for a reply, applied when the caller passes zero
pub(crate) const DEFAULT_WAIT_FOR_REPLY: Duration = Duration::from_secs(2 * 60);

/// One outcome of a reply wait.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ReplyOutcome {
    /// A zero-length reply body: the responder had nothing to say
    Empty,
    /// The raw reply body, decoded by the caller
    Payload(Vec<u8>),
    /// A terminal failure produced while consuming the reply
    Failed(AmqpError),
}

/// Single-assignment handoff between the reply consumer and the caller.
///
/// At most one outcome is ever delivered: claiming takes the sender out of
/// the slot, so a second claim finds it empty and discards its outcome.
pub(crate) struct ReplySlot {
    sender: Mutex<Option<oneshot::Sender<ReplyOutcome>>>,
}

impl ReplySlot {
    pub(crate) fn new() -> (Arc<ReplySlot>, oneshot::Receiver<ReplyOutcome>) {
        let (sender, receiver) = oneshot::channel();
        (
            Arc::new(ReplySlot {
                sender: Mutex::new(Some(sender)),
            }),
            receiver,
        )
    }

    /// Claims the slot and hands the outcome to the waiting caller.
    ///
    /// Returns `false` when another outcome already claimed it; the caller
    /// of `try_resolve` must then discard its outcome.
    pub(crate) fn try_resolve(&self, outcome: ReplyOutcome) -> bool {
        let sender = match self.sender.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        match sender {
            Some(sender) => {
                // the receiver may already be gone after a timeout; the
                // claim still counts so no later delivery re-resolves
                let _ = sender.send(outcome);
                true
            }
            None => false,
        }
    }

    pub(crate) fn is_resolved(&self) -> bool {
        match self.sender.lock() {
            Ok(guard) => guard.is_none(),
            Err(_) => true,
        }
    }

    /// Marks the wait as over without producing an outcome.
    pub(crate) fn abandon(&self) {
        if let Ok(mut guard) = self.sender.lock() {
            guard.take();
        }
    }
}

/// Synchronous request/reply on top of the publish path.
pub struct RpcClient {
    connection: Arc<AmqpConnection>,
    publisher: Publisher,
}

impl RpcClient {
    /// Creates a new RPC client on the given connection.
    pub fn new(connection: Arc<AmqpConnection>) -> RpcClient {
        RpcClient {
            publisher: Publisher::new(connection.clone()),
            connection,
        }
    }

    /// Publishes a request and waits for its reply with the default
    /// two-minute deadline.
    ///
    /// # Returns
    /// * `Ok(None)` - the responder sent an empty reply
    /// * `Ok(Some(reply))` - the JSON reply decoded into `R`
    /// * `Err(AmqpError)` - publish, decode, timeout or cancellation failure
    pub async fn push_and_wait_for_reply<E, R>(
        &self,
        config: &ProducerConfig,
        headers: Option<HashMap<String, HeaderValue>>,
        message: &E,
    ) -> Result<Option<R>, AmqpError>
    where
        E: Serialize,
        R: DeserializeOwned,
    {
        self.push_and_wait_for_reply_within(config, headers, message, DEFAULT_WAIT_FOR_REPLY)
            .await
    }

    /// Publishes a request and waits for its reply.
    ///
    /// The reply-to queue and correlation id from the producer configuration
    /// are used when present; otherwise a server-named exclusive, auto-delete,
    /// non-durable queue is declared and a fresh correlation id generated.
    /// A zero `timeout` falls back to the two-minute default.
    pub async fn push_and_wait_for_reply_within<E, R>(
        &self,
        config: &ProducerConfig,
        headers: Option<HashMap<String, HeaderValue>>,
        message: &E,
        timeout: Duration,
    ) -> Result<Option<R>, AmqpError>
    where
        E: Serialize,
        R: DeserializeOwned,
    {
        let channel = self.connection.create_channel().await?;
        let result = self
            .call_on_channel(&channel, config, headers, message, timeout)
            .await;
        close_channel(&channel).await;

        decode_reply(result?)
    }

    async fn call_on_channel<E: Serialize>(
        &self,
        channel: &Channel,
        config: &ProducerConfig,
        headers: Option<HashMap<String, HeaderValue>>,
        message: &E,
        timeout: Duration,
    ) -> Result<ReplyOutcome, AmqpError> {
        let reply_queue = match config.reply_to_queue() {
            Some(queue) => queue.to_owned(),
            None => declare_reply_queue(channel).await?,
        };
        let correlation_id = match config.correlation_id() {
            Some(id) => id.to_owned(),
            None => Uuid::new_v4().to_string(),
        };

        let call_config = config
            .clone()
            .with_reply_to(&reply_queue)
            .with_correlation_id(&correlation_id);
        self.publisher
            .push_on_channel(channel, &call_config, headers, message)
            .await?;

        self.wait_for_reply(channel, &reply_queue, &correlation_id, timeout)
            .await
    }

    async fn wait_for_reply(
        &self,
        channel: &Channel,
        reply_queue: &str,
        correlation_id: &str,
        timeout: Duration,
    ) -> Result<ReplyOutcome, AmqpError> {
        // one unacknowledged reply at a time on this channel
        channel
            .basic_qos(1, BasicQosOptions::default())
            .await
            .map_err(|err| AmqpError::QoSDeclarationError(err.to_string()))?;

        let consumer = match channel
            .basic_consume(
                reply_queue,
                "",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
        {
            Ok(consumer) => consumer,
            Err(err) => {
                error!(error = err.to_string(), "error to create the reply consumer");
                return Err(AmqpError::ConsumerError(reply_queue.to_owned()));
            }
        };

        let (slot, receiver) = ReplySlot::new();
        tokio::spawn(reply_pump(
            self.connection.clone(),
            consumer,
            slot.clone(),
            reply_queue.to_owned(),
            correlation_id.to_owned(),
        ));

        await_reply(receiver, &slot, timeout).await
    }
}

/// Blocks on the handoff slot until an outcome arrives or the deadline
/// elapses. A timeout abandons the slot so the pump stops doing work.
pub(crate) async fn await_reply(
    receiver: oneshot::Receiver<ReplyOutcome>,
    slot: &ReplySlot,
    timeout: Duration,
) -> Result<ReplyOutcome, AmqpError> {
    let wait = if timeout.is_zero() {
        DEFAULT_WAIT_FOR_REPLY
    } else {
        timeout
    };

    match tokio::time::timeout(wait, receiver).await {
        Ok(Ok(outcome)) => Ok(outcome),
        Ok(Err(_)) => Err(AmqpError::UnknownError(
            "reply wait ended without an outcome".to_owned(),
        )),
        Err(_) => {
            slot.abandon();
            Err(AmqpError::TimeoutError)
        }
    }
}

/// Decodes a reply outcome into the caller's expected type.
pub(crate) fn decode_reply<R: DeserializeOwned>(
    outcome: ReplyOutcome,
) -> Result<Option<R>, AmqpError> {
    match outcome {
        ReplyOutcome::Empty => Ok(None),
        ReplyOutcome::Failed(err) => Err(err),
        ReplyOutcome::Payload(body) => serde_json::from_slice(&body).map(Some).map_err(|err| {
            AmqpError::JsonCodecError(format!(
                "{} (raw reply: {})",
                err,
                String::from_utf8_lossy(&body)
            ))
        }),
    }
}

async fn declare_reply_queue(channel: &Channel) -> Result<String, AmqpError> {
    match channel
        .queue_declare(
            "",
            QueueDeclareOptions {
                passive: false,
                durable: false,
                exclusive: true,
                auto_delete: true,
                nowait: false,
            },
            FieldTable::default(),
        )
        .await
    {
        Ok(queue) => Ok(queue.name().as_str().to_owned()),
        Err(err) => {
            error!(error = err.to_string(), "error to declare the reply queue");
            Err(AmqpError::DeclareQueueError(err.to_string()))
        }
    }
}

/// Drives the one-shot reply consumer until the call resolves.
///
/// The stream ending before an outcome was produced means the broker
/// cancelled the consumer (queue deleted, node failure); the waiting caller
/// is then released with `CancelledError` instead of running into the
/// timeout.
async fn reply_pump(
    connection: Arc<AmqpConnection>,
    mut consumer: Consumer,
    slot: Arc<ReplySlot>,
    reply_queue: String,
    correlation_id: String,
) {
    while let Some(result) = consumer.next().await {
        match result {
            Ok(delivery) => {
                if slot.is_resolved() {
                    // the call already answered; this consumer must stop
                    // doing work
                    error!(
                        queue = reply_queue,
                        "reply consumer received a delivery after completion"
                    );
                    break;
                }

                if let Some(outcome) =
                    handle_reply_delivery(&connection, &reply_queue, &correlation_id, delivery)
                        .await
                {
                    if !slot.try_resolve(outcome) {
                        warn!(queue = reply_queue, "discarding a raced reply outcome");
                    }
                }
            }
            Err(err) => error!(error = err.to_string(), "error consuming reply"),
        }
    }

    slot.try_resolve(ReplyOutcome::Failed(AmqpError::CancelledError));
}

async fn handle_reply_delivery(
    connection: &Arc<AmqpConnection>,
    reply_queue: &str,
    correlation_id: &str,
    delivery: Delivery,
) -> Option<ReplyOutcome> {
    if correlation_matches(&delivery.properties, correlation_id) {
        let outcome = if delivery.data.is_empty() {
            ReplyOutcome::Empty
        } else {
            ReplyOutcome::Payload(delivery.data.clone())
        };

        if let Err(err) = delivery.ack(BasicAckOptions { multiple: false }).await {
            error!(error = err.to_string(), "error whiling ack reply");
        }

        return Some(outcome);
    }

    // a reply for a different concurrent caller arrived first: hand it back
    // to the queue and remove it from this channel's view
    match republish_foreign(connection, reply_queue, &delivery).await {
        Ok(()) => {
            if let Err(err) = delivery.ack(BasicAckOptions { multiple: false }).await {
                error!(error = err.to_string(), "error whiling ack foreign reply");
            }
            None
        }
        Err(err) => {
            error!(error = err.to_string(), "error republishing foreign reply");
            // keep the message in the queue rather than losing it
            if let Err(reject_err) = delivery.reject(BasicRejectOptions { requeue: true }).await {
                error!(
                    error = reject_err.to_string(),
                    "error whiling requeue foreign reply"
                );
            }
            Some(ReplyOutcome::Failed(AmqpError::UnknownError(
                "failure to hand back a foreign reply".to_owned(),
            )))
        }
    }
}

/// Republishes a foreign reply over a fresh channel so a publish failure
/// cannot poison the channel the reply consumer lives on.
async fn republish_foreign(
    connection: &Arc<AmqpConnection>,
    reply_queue: &str,
    delivery: &Delivery,
) -> Result<(), AmqpError> {
    let channel = connection.create_channel().await?;
    let result = async {
        confirm_select(&channel).await?;
        publish_confirmed(
            &channel,
            "",
            reply_queue,
            delivery.properties.clone(),
            &delivery.data,
        )
        .await
    }
    .await;
    close_channel(&channel).await;

    result
}

fn correlation_matches(properties: &BasicProperties, correlation_id: &str) -> bool {
    properties
        .correlation_id()
        .as_ref()
        .map(|id| id.as_str() == correlation_id)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lapin::types::ShortString;

    #[tokio::test]
    async fn slot_resolves_exactly_once() {
        let (slot, receiver) = ReplySlot::new();

        assert!(slot.try_resolve(ReplyOutcome::Payload(b"first".to_vec())));
        assert!(!slot.try_resolve(ReplyOutcome::Payload(b"second".to_vec())));
        assert!(slot.is_resolved());

        assert_eq!(
            receiver.await.unwrap(),
            ReplyOutcome::Payload(b"first".to_vec())
        );
    }

    #[tokio::test]
    async fn abandoned_slot_rejects_late_outcomes() {
        let (slot, receiver) = ReplySlot::new();
        drop(receiver);

        slot.abandon();
        assert!(!slot.try_resolve(ReplyOutcome::Empty));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_times_out_and_stops_the_pump() {
        let (slot, receiver) = ReplySlot::new();

        let result = await_reply(receiver, &slot, Duration::from_secs(3)).await;
        assert_eq!(result, Err(AmqpError::TimeoutError));
        assert!(slot.is_resolved());
    }

    #[tokio::test(start_paused = true)]
    async fn zero_timeout_falls_back_to_the_default() {
        let (slot, receiver) = ReplySlot::new();
        let started = tokio::time::Instant::now();

        let result = await_reply(receiver, &slot, Duration::ZERO).await;
        assert_eq!(result, Err(AmqpError::TimeoutError));
        assert!(started.elapsed() >= DEFAULT_WAIT_FOR_REPLY);
    }

    #[tokio::test]
    async fn outcome_arrives_before_the_deadline() {
        let (slot, receiver) = ReplySlot::new();
        slot.try_resolve(ReplyOutcome::Empty);

        let result = await_reply(receiver, &slot, Duration::from_secs(3)).await;
        assert_eq!(result, Ok(ReplyOutcome::Empty));
    }

    #[test]
    fn empty_reply_decodes_to_none() {
        let decoded: Option<String> = decode_reply(ReplyOutcome::Empty).unwrap();
        assert_eq!(decoded, None);
    }

    #[test]
    fn json_reply_decodes_to_the_expected_type() {
        let decoded: Option<String> =
            decode_reply(ReplyOutcome::Payload(b"\"pong\"".to_vec())).unwrap();
        assert_eq!(decoded, Some("pong".to_owned()));
    }

    #[test]
    fn malformed_reply_carries_the_raw_body() {
        let result: Result<Option<String>, AmqpError> =
            decode_reply(ReplyOutcome::Payload(b"not json".to_vec()));

        match result {
            Err(AmqpError::JsonCodecError(detail)) => assert!(detail.contains("not json")),
            other => panic!("expected a json codec error, got {:?}", other),
        }
    }

    #[test]
    fn failed_outcome_propagates_its_error() {
        let result: Result<Option<String>, AmqpError> =
            decode_reply(ReplyOutcome::Failed(AmqpError::CancelledError));
        assert_eq!(result, Err(AmqpError::CancelledError));
    }

    #[test]
    fn correlation_matching_requires_the_exact_id() {
        let matching = BasicProperties::default().with_correlation_id(ShortString::from("corr-1"));
        assert!(correlation_matches(&matching, "corr-1"));

        let foreign = BasicProperties::default().with_correlation_id(ShortString::from("corr-2"));
        assert!(!correlation_matches(&foreign, "corr-1"));

        let missing = BasicProperties::default();
        assert!(!correlation_matches(&missing, "corr-1"));
    }
}
