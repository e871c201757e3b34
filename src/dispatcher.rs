// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Dispatch & Recovery
//!
//! This module registers long-lived consumers on a queue and keeps them
//! alive across broker-side failures. Each parallel consumer gets its own
//! channel and QoS window; deliveries run through the pipeline in the
//! `consumer` module under a slot of the connection's worker pool.
//!
//! A subscription moves through a small state machine: `Subscribed` while
//! the consumer stream is live, `Cancelled` when the broker drops it (queue
//! deleted, node failure), `Retrying` while the recovery loop re-creates a
//! channel and re-registers the same consumer, and terminal `Abandoned` once
//! the connection shuts down. Recovery retries forever at the configured
//! network-recovery interval; no application restart call is needed.

use crate::config::ConsumerConfig;
use crate::connection::AmqpConnection;
use crate::consumer::dispatch_delivery;
use crate::errors::AmqpError;
use crate::headers::HeaderValue;
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::options::{BasicConsumeOptions, BasicQosOptions};
use lapin::types::FieldTable;
use lapin::{Channel, Consumer};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, warn};

/// Application hook invoked for every delivered message.
///
/// The handler receives the deserialized payload and the cleaned header map
/// (transport metadata removed). Returning `Some(reply)` sends the value
/// back to the requester when the message carried a reply-to queue;
/// returning `None` sends an empty reply instead.
#[async_trait]
pub trait MessageHandler<M, R>: Send + Sync {
    async fn handle(
        &self,
        message: M,
        headers: HashMap<String, HeaderValue>,
    ) -> Result<Option<R>, AmqpError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubscriptionState {
    Subscribed,
    Cancelled,
    Retrying,
    Abandoned,
}

/// Registers message listeners and drives their recovery.
pub struct Dispatcher {
    connection: Arc<AmqpConnection>,
}

impl Dispatcher {
    /// Creates a new dispatcher on the given connection.
    pub fn new(connection: Arc<AmqpConnection>) -> Dispatcher {
        Dispatcher { connection }
    }

    /// Registers `config.consumers()` parallel consumers on the queue.
    ///
    /// Channel or QoS failures surface to the caller. A consumer that cannot
    /// be registered yet (queue not declared at start time) is still armed:
    /// its subscription starts in the recovery loop and keeps retrying until
    /// the queue exists.
    pub async fn set_receive_message_listener<M, R>(
        &self,
        config: ConsumerConfig,
        handler: Arc<dyn MessageHandler<M, R>>,
    ) -> Result<(), AmqpError>
    where
        M: DeserializeOwned + Send + 'static,
        R: Serialize + Send + Sync + 'static,
    {
        for slot in 0..config.consumers() {
            let channel = self.connection.create_channel().await?;
            apply_qos(&channel, config.prefetch_count()).await?;

            let subscription = Subscription {
                connection: self.connection.clone(),
                config: config.clone(),
                handler: handler.clone(),
                slot,
            };

            match register_consumer(&channel, &config).await {
                Ok(consumer) => {
                    tokio::spawn(subscription.run(Some(consumer)));
                }
                Err(err) => {
                    error!(
                        error = err.to_string(),
                        queue = config.queue_name(),
                        "failure to register the consumer, scheduling recovery"
                    );
                    tokio::spawn(subscription.run(None));
                }
            }
        }

        Ok(())
    }
}

/// One parallel-consumer slot and its recovery loop.
struct Subscription<M, R> {
    connection: Arc<AmqpConnection>,
    config: ConsumerConfig,
    handler: Arc<dyn MessageHandler<M, R>>,
    slot: usize,
}

impl<M, R> Subscription<M, R>
where
    M: DeserializeOwned + Send + 'static,
    R: Serialize + Send + Sync + 'static,
{
    async fn run(self, initial: Option<Consumer>) {
        let mut shutdown = self.connection.shutdown_signal();
        let mut current = initial;

        let state = loop {
            let consumer = match current.take() {
                Some(consumer) => consumer,
                None => {
                    self.log_state(SubscriptionState::Retrying);
                    match self.rearm(&mut shutdown).await {
                        Some(consumer) => consumer,
                        None => break SubscriptionState::Abandoned,
                    }
                }
            };

            self.log_state(SubscriptionState::Subscribed);
            if !self.consume_loop(consumer, &mut shutdown).await {
                break SubscriptionState::Abandoned;
            }

            self.log_state(SubscriptionState::Cancelled);
            if !self.connection.automatic_recovery() {
                break SubscriptionState::Abandoned;
            }
        };

        self.log_state(state);
    }

    fn log_state(&self, state: SubscriptionState) {
        match state {
            SubscriptionState::Cancelled => warn!(
                queue = self.config.queue_name(),
                slot = self.slot,
                "consumer unexpectedly stopped listening to new messages"
            ),
            _ => debug!(
                queue = self.config.queue_name(),
                slot = self.slot,
                state = ?state,
                "subscription state changed"
            ),
        }
    }

    /// Pumps deliveries until shutdown (`false`) or broker-side cancellation
    /// of the consumer (`true`), observed as the stream ending.
    async fn consume_loop(
        &self,
        mut consumer: Consumer,
        shutdown: &mut watch::Receiver<bool>,
    ) -> bool {
        loop {
            if self.connection.is_shutting_down() {
                return false;
            }

            tokio::select! {
                _ = shutdown.changed() => return false,
                next = consumer.next() => match next {
                    Some(Ok(delivery)) => {
                        let Some(permit) = self.connection.acquire_worker().await else {
                            return false;
                        };
                        dispatch_delivery(
                            &self.connection,
                            &self.config,
                            self.handler.as_ref(),
                            delivery,
                        )
                        .await;
                        drop(permit);
                    }
                    Some(Err(err)) => {
                        error!(error = err.to_string(), "errors consume msg");
                    }
                    None => return true,
                }
            }
        }
    }

    /// Sleep-then-retry loop re-establishing the subscription.
    ///
    /// Holds a worker-pool slot for its whole duration, like any other
    /// connection task. Returns `None` once shutdown interrupts the loop.
    async fn rearm(&self, shutdown: &mut watch::Receiver<bool>) -> Option<Consumer> {
        let _permit = self.connection.acquire_worker().await?;

        loop {
            tokio::select! {
                _ = shutdown.changed() => return None,
                _ = tokio::time::sleep(self.connection.network_recovery_interval()) => {}
            }
            if self.connection.is_shutting_down() {
                return None;
            }

            match self.try_subscribe().await {
                Ok(consumer) => return Some(consumer),
                Err(err) => error!(
                    error = err.to_string(),
                    queue = self.config.queue_name(),
                    "re-subscribe failed, will retry"
                ),
            }
        }
    }

    async fn try_subscribe(&self) -> Result<Consumer, AmqpError> {
        let channel = self.connection.create_channel().await?;
        apply_qos(&channel, self.config.prefetch_count()).await?;
        register_consumer(&channel, &self.config).await
    }
}

async fn apply_qos(channel: &Channel, prefetch_count: u16) -> Result<(), AmqpError> {
    match channel
        .basic_qos(prefetch_count, BasicQosOptions::default())
        .await
    {
        Ok(()) => Ok(()),
        Err(err) => {
            error!(error = err.to_string(), "failure to configure qos");
            Err(AmqpError::QoSDeclarationError(err.to_string()))
        }
    }
}

async fn register_consumer(
    channel: &Channel,
    config: &ConsumerConfig,
) -> Result<Consumer, AmqpError> {
    match channel
        .basic_consume(
            config.queue_name(),
            "",
            BasicConsumeOptions {
                no_local: false,
                no_ack: config.auto_ack(),
                exclusive: false,
                nowait: false,
            },
            FieldTable::default(),
        )
        .await
    {
        Ok(consumer) => Ok(consumer),
        Err(err) => {
            error!(error = err.to_string(), "error to create the consumer");
            Err(AmqpError::ConsumerError(config.queue_name().to_owned()))
        }
    }
}
