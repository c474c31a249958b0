// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection Management
//!
//! This module owns the single logical connection to the RabbitMQ broker.
//! `ConnectionManager` establishes the connection with a bounded fixed-delay
//! retry, and a supervising task reacts to broker-delivered error
//! notifications by re-entering the same acquisition routine used at startup,
//! so the connection heals itself without caller intervention.

use crate::{config::ConnectionConfig, errors::AmqpError};
use lapin::{types::LongString, Channel, Connection, ConnectionProperties};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, error, warn};

/// Close reply code used for graceful shutdown
const REPLY_SUCCESS: u16 = 200;

/// Owns one logical connection to the broker for the process lifetime.
///
/// The connection is created on first `prepare()` and recreated transparently
/// when the broker signals an error; it is only torn down by `dispose()`.
/// All channel managers derived from this manager share it.
pub struct ConnectionManager {
    config: ConnectionConfig,
    connection: Mutex<Option<Connection>>,
    reconnect: Arc<Notify>,
    disposed: AtomicBool,
}

impl ConnectionManager {
    /// Creates the manager and spawns its reconnection supervisor.
    ///
    /// The supervisor holds only a weak reference: dropping every `Arc`
    /// (or calling `dispose()`) ends it.
    pub fn new(config: ConnectionConfig) -> Arc<ConnectionManager> {
        let manager = Arc::new(ConnectionManager {
            config,
            connection: Mutex::new(None),
            reconnect: Arc::new(Notify::new()),
            disposed: AtomicBool::new(false),
        });

        Self::spawn_supervisor(&manager);

        manager
    }

    fn spawn_supervisor(manager: &Arc<ConnectionManager>) {
        let weak = Arc::downgrade(manager);
        let signal = manager.reconnect.clone();

        tokio::spawn(async move {
            loop {
                signal.notified().await;

                let Some(manager) = weak.upgrade() else {
                    break;
                };
                if manager.disposed.load(Ordering::SeqCst) {
                    break;
                }

                warn!("connection health event received, reconnecting");
                if let Err(err) = manager.prepare().await {
                    error!(error = err.to_string(), "automatic reconnection failed");
                }
            }
        });
    }

    /// Ensures the connection is open. Idempotent.
    ///
    /// Concurrent callers serialize on the connection slot; the open state is
    /// re-checked under the lock so only the first caller actually connects.
    /// Attempts up to `retry_connection_count` connects with a fixed delay and
    /// fails with `AmqpError::ConnectionError` once the budget is exhausted.
    pub async fn prepare(&self) -> Result<(), AmqpError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(AmqpError::ConnectionDisposed);
        }

        let mut guard = self.connection.lock().await;

        if matches!(guard.as_ref(), Some(conn) if conn.status().connected()) {
            return Ok(());
        }

        debug!("creating amqp connection...");

        for attempt in 1..=self.config.retry_connection_count {
            let options = ConnectionProperties::default()
                .with_connection_name(LongString::from(self.config.connection_name.clone()));

            match Connection::connect(&self.config.uri(), options).await {
                Ok(conn) => {
                    self.watch_health(&conn);
                    debug!("amqp connected");
                    *guard = Some(conn);
                    return Ok(());
                }
                Err(err) => {
                    error!(error = err.to_string(), attempt, "failure to connect");
                    if attempt < self.config.retry_connection_count {
                        tokio::time::sleep(self.config.retry_connection_delay).await;
                    }
                }
            }
        }

        Err(AmqpError::ConnectionError)
    }

    /// Registers the broker error hook that wakes the supervisor.
    fn watch_health(&self, connection: &Connection) {
        let signal = self.reconnect.clone();
        connection.on_error(move |err| {
            error!(error = err.to_string(), "amqp connection errored");
            signal.notify_one();
        });
    }

    /// Whether the underlying connection is currently open.
    pub async fn is_open(&self) -> bool {
        let guard = self.connection.lock().await;
        matches!(guard.as_ref(), Some(conn) if conn.status().connected())
            && !self.disposed.load(Ordering::SeqCst)
    }

    /// Creates a new channel on the open connection.
    ///
    /// Never connects on its own: callers hold the reconnect policy and are
    /// expected to `prepare()` first. Fails with `AmqpError::NotConnected`
    /// while the connection is closed.
    pub async fn create_channel(&self) -> Result<Channel, AmqpError> {
        let guard = self.connection.lock().await;

        let connection = guard
            .as_ref()
            .filter(|conn| conn.status().connected())
            .ok_or(AmqpError::NotConnected)?;

        match connection.create_channel().await {
            Ok(channel) => {
                debug!("channel created");
                Ok(channel)
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError)
            }
        }
    }

    /// Closes the connection with a bounded timeout and releases resources.
    ///
    /// Idempotent; once disposed the manager never reconnects.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        let connection = self.connection.lock().await.take();

        if let Some(connection) = connection {
            match tokio::time::timeout(
                self.config.close_timeout,
                connection.close(REPLY_SUCCESS, "connection disposed"),
            )
            .await
            {
                Ok(Err(err)) => warn!(error = err.to_string(), "error closing connection"),
                Err(_) => warn!("timed out closing connection"),
                Ok(Ok(())) => debug!("amqp connection closed"),
            }
        }

        // wake the supervisor so it observes the disposed flag and exits
        self.reconnect.notify_one();
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> Arc<ConnectionManager> {
        ConnectionManager::new(ConnectionConfig::default())
    }

    #[tokio::test]
    async fn create_channel_requires_open_connection() {
        let manager = manager();

        let result = manager.create_channel().await;

        assert_eq!(result.err(), Some(AmqpError::NotConnected));
    }

    #[tokio::test]
    async fn dispose_is_idempotent() {
        let manager = manager();

        manager.dispose().await;
        manager.dispose().await;

        assert!(manager.is_disposed());
        assert!(!manager.is_open().await);
    }

    #[tokio::test]
    async fn prepare_after_dispose_short_circuits() {
        let manager = manager();
        manager.dispose().await;

        let result = manager.prepare().await;

        assert_eq!(result.err(), Some(AmqpError::ConnectionDisposed));
    }
}
