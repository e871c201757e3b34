// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection Management
//!
//! This module owns the broker connection and everything scoped to it: the
//! bounded worker pool used to dispatch delivery callbacks and recovery
//! tasks, the shutdown signal observed by long-lived consumers, and the
//! cached sender IP stamped into outgoing headers. Channels are created on
//! demand and always closed by the caller; the connection itself is torn
//! down exactly once through an idempotent, best-effort `close`.

use crate::config::{ConnectionConfig, TlsMode};
use crate::errors::AmqpError;
use lapin::tcp::{OwnedIdentity, OwnedTLSConfig};
use lapin::types::LongString;
use lapin::{Channel, Connection, ConnectionProperties};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, warn};

/// Max size of the worker pool shared by delivery and recovery tasks
const MAX_POOL_SIZE: usize = 10;
/// How long `close` waits for in-flight worker tasks to finish
const POOL_DRAIN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(2);

const REPLY_SUCCESS: u16 = 200;

/// A live connection to the broker, shared by publishers and consumers.
pub struct AmqpConnection {
    config: ConnectionConfig,
    connection: Connection,
    workers: Arc<Semaphore>,
    pool_size: u32,
    shutdown: watch::Sender<bool>,
    closed: AtomicBool,
    sender_ip: IpAddr,
}

impl AmqpConnection {
    /// Opens a connection to the broker.
    ///
    /// The application name is mandatory: it names the connection on the
    /// broker and identifies the sender on every published message. Candidate
    /// addresses are tried in order until one connects.
    ///
    /// # Returns
    /// * `Result<Arc<AmqpConnection>, AmqpError>` - the shared connection on
    ///   success, or the error mapped from the first failure.
    pub async fn open(config: ConnectionConfig) -> Result<Arc<AmqpConnection>, AmqpError> {
        if config.application_name().trim().is_empty() {
            return Err(AmqpError::ConfigError(
                "application name cannot be empty".to_owned(),
            ));
        }

        debug!("creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(config.application_name().to_owned()));

        let connection = Self::connect_any(&config, options).await?;
        debug!("amqp connected");

        let pool_size = bounded_pool_size(
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        );
        let (shutdown, _) = watch::channel(false);

        let sender_ip = local_ip_address::local_ip()
            .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));

        Ok(Arc::new(AmqpConnection {
            config,
            connection,
            workers: Arc::new(Semaphore::new(pool_size)),
            pool_size: pool_size as u32,
            shutdown,
            closed: AtomicBool::new(false),
            sender_ip,
        }))
    }

    async fn connect_any(
        config: &ConnectionConfig,
        options: ConnectionProperties,
    ) -> Result<Connection, AmqpError> {
        let mut last_error = None;

        for (host, port) in config.candidate_addresses() {
            let uri = config.build_uri(&host, port);
            match Self::connect_one(&uri, options.clone(), config.tls()).await {
                Ok(connection) => return Ok(connection),
                Err(err) => {
                    error!(error = err.to_string(), host, port, "failure to connect");
                    last_error = Some(err);
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| AmqpError::ConnectionError("no broker address".to_owned())))
    }

    async fn connect_one(
        uri: &str,
        options: ConnectionProperties,
        tls: &TlsMode,
    ) -> Result<Connection, AmqpError> {
        let result = match tls {
            TlsMode::Disabled | TlsMode::SystemDefault => Connection::connect(uri, options).await,
            TlsMode::TrustedChain { cert_chain } => {
                Connection::connect_with_config(
                    uri,
                    options,
                    OwnedTLSConfig {
                        identity: None,
                        cert_chain: Some(cert_chain.clone()),
                    },
                )
                .await
            }
            TlsMode::Identity {
                der,
                password,
                cert_chain,
            } => {
                if der.is_empty() {
                    return Err(AmqpError::SecurityError(
                        "client identity is empty".to_owned(),
                    ));
                }
                Connection::connect_with_config(
                    uri,
                    options,
                    OwnedTLSConfig {
                        identity: Some(OwnedIdentity {
                            der: der.clone(),
                            password: password.clone(),
                        }),
                        cert_chain: cert_chain.clone(),
                    },
                )
                .await
            }
        };

        result.map_err(|err| match err {
            lapin::Error::IOError(_) => AmqpError::ConnectionError(err.to_string()),
            _ => AmqpError::UnknownError(err.to_string()),
        })
    }

    /// Creates a fresh channel on this connection.
    pub async fn create_channel(&self) -> Result<Channel, AmqpError> {
        match self.connection.create_channel().await {
            Ok(channel) => Ok(channel),
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError(err.to_string()))
            }
        }
    }

    /// Closes the connection and drains the worker pool.
    ///
    /// Idempotent and best-effort: every internal failure is logged and
    /// suppressed so that shutdown always completes.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        if self.connection.status().connected() {
            match tokio::time::timeout(
                self.config.close_timeout(),
                self.connection.close(REPLY_SUCCESS, "shutting down"),
            )
            .await
            {
                Ok(Ok(())) => debug!("amqp connection closed"),
                Ok(Err(err)) => error!(error = err.to_string(), "error to close the connection"),
                Err(_) => error!("timed out closing the connection"),
            }
        }

        let _ = self.shutdown.send(true);

        // drain: in-flight worker tasks hold permits until they finish
        match tokio::time::timeout(POOL_DRAIN_TIMEOUT, self.workers.acquire_many(self.pool_size))
            .await
        {
            Ok(Ok(_permits)) => debug!("worker pool drained"),
            _ => warn!("worker tasks still running at shutdown"),
        }
    }

    /// Acquires one slot of the worker pool; `None` once shutdown started.
    pub(crate) async fn acquire_worker(&self) -> Option<OwnedSemaphorePermit> {
        self.workers.clone().acquire_owned().await.ok()
    }

    /// Returns a receiver resolving once `close` has been called.
    pub(crate) fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub(crate) fn sender_ip(&self) -> IpAddr {
        self.sender_ip
    }

    pub(crate) fn application_name(&self) -> &str {
        self.config.application_name()
    }

    pub(crate) fn username(&self) -> &str {
        self.config.username()
    }

    pub(crate) fn automatic_recovery(&self) -> bool {
        self.config.automatic_recovery()
    }

    pub(crate) fn network_recovery_interval(&self) -> std::time::Duration {
        self.config.network_recovery_interval()
    }
}

/// Closes a channel, swallowing failures: channels are released on every
/// exit path, including error paths where a close error would mask the
/// original one.
pub(crate) async fn close_channel(channel: &Channel) {
    if !channel.status().connected() {
        return;
    }
    if let Err(err) = channel.close(REPLY_SUCCESS, "releasing channel").await {
        error!(error = err.to_string(), "error to close the channel");
    }
}

fn bounded_pool_size(available_parallelism: usize) -> usize {
    available_parallelism.clamp(1, MAX_POOL_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_size_is_bounded() {
        assert_eq!(bounded_pool_size(1), 1);
        assert_eq!(bounded_pool_size(8), 8);
        assert_eq!(bounded_pool_size(10), 10);
        assert_eq!(bounded_pool_size(64), 10);
        assert_eq!(bounded_pool_size(0), 1);
    }
}
