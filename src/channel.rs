// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! This module manages a communication channel bound to one logical queue.
//! `ChannelManager` lazily (re)creates its channel on first use or after a
//! detected closure, declares the exchange/queue/binding once per manager
//! lifetime, and serializes publishes so concurrent publishers sharing one
//! manager never interleave destructively.

use crate::{
    config::RetryPolicy,
    connection::ConnectionManager,
    errors::AmqpError,
};
use lapin::{
    options::{
        BasicPublishOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    publisher_confirm::Confirmation,
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties, Channel,
};
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tracing::{debug, error, warn};

const REPLY_SUCCESS: u16 = 200;

/// Represents the types of exchanges available in RabbitMQ.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
}

impl From<&ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: &ExchangeKind) -> lapin::ExchangeKind {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
        }
    }
}

/// The (exchange, queue, routing key) triple a channel is bound to, plus the
/// optional declaration arguments.
///
/// Defaults to the `<queue>-ex` / `<queue>-key` naming convention; both names
/// can be overridden per component.
#[derive(Debug, Clone)]
pub struct ChannelTarget {
    pub(crate) queue: String,
    pub(crate) exchange: String,
    pub(crate) routing_key: String,
    pub(crate) kind: ExchangeKind,
    pub(crate) exchange_args: BTreeMap<ShortString, AMQPValue>,
    pub(crate) queue_args: BTreeMap<ShortString, AMQPValue>,
    pub(crate) bind_args: BTreeMap<ShortString, AMQPValue>,
}

impl ChannelTarget {
    pub fn new(queue: &str) -> ChannelTarget {
        ChannelTarget {
            queue: queue.to_owned(),
            exchange: format!("{queue}-ex"),
            routing_key: format!("{queue}-key"),
            kind: ExchangeKind::Direct,
            exchange_args: BTreeMap::default(),
            queue_args: BTreeMap::default(),
            bind_args: BTreeMap::default(),
        }
    }

    pub fn exchange(mut self, name: &str) -> Self {
        self.exchange = name.to_owned();
        self
    }

    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }

    pub fn kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn fanout(mut self) -> Self {
        self.kind = ExchangeKind::Fanout;
        self
    }

    pub fn exchange_arg(mut self, key: &str, value: AMQPValue) -> Self {
        self.exchange_args.insert(ShortString::from(key), value);
        self
    }

    pub fn queue_arg(mut self, key: &str, value: AMQPValue) -> Self {
        self.queue_args.insert(ShortString::from(key), value);
        self
    }

    pub fn bind_arg(mut self, key: &str, value: AMQPValue) -> Self {
        self.bind_args.insert(ShortString::from(key), value);
        self
    }

    pub fn queue_name(&self) -> &str {
        &self.queue
    }

    pub fn exchange_name(&self) -> &str {
        &self.exchange
    }
}

/// Owns a channel bound to one logical queue, with its own
/// create/retry/replace lifecycle on top of the shared connection.
pub struct ChannelManager {
    connection: Arc<ConnectionManager>,
    target: ChannelTarget,
    retry: RetryPolicy,
    channel: tokio::sync::Mutex<Option<Channel>>,
    publish_gate: tokio::sync::Mutex<()>,
    declared: AtomicBool,
    disposed: AtomicBool,
}

impl ChannelManager {
    pub fn new(
        connection: Arc<ConnectionManager>,
        target: ChannelTarget,
        retry: RetryPolicy,
    ) -> ChannelManager {
        ChannelManager {
            connection,
            target,
            retry,
            channel: tokio::sync::Mutex::new(None),
            publish_gate: tokio::sync::Mutex::new(()),
            declared: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn target(&self) -> &ChannelTarget {
        &self.target
    }

    /// Returns an open channel for this manager's target.
    ///
    /// If the current channel is open it is returned unchanged. Otherwise any
    /// stale channel is discarded (close failures swallowed), the owning
    /// connection is ensured open, and the channel is recreated under the
    /// retry policy. The first successful creation declares the
    /// exchange/queue/binding; re-creations after a failure skip the
    /// declaration. Publisher confirms are enabled on every created channel.
    pub async fn get_channel(&self) -> Result<Channel, AmqpError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(AmqpError::ChannelDisposed);
        }

        self.connection.prepare().await?;

        let mut guard = self.channel.lock().await;

        if let Some(channel) = guard.as_ref() {
            if channel.status().connected() {
                return Ok(channel.clone());
            }
        }

        if let Some(stale) = guard.take() {
            if let Err(err) = stale.close(REPLY_SUCCESS, "stale channel").await {
                debug!(error = err.to_string(), "error closing stale channel");
            }
        }

        let channel = self.prepare_channel().await?;
        *guard = Some(channel.clone());

        Ok(channel)
    }

    /// (Re)creates the channel, tolerating transient broker/network errors
    /// with fixed-delay retries; fatal after exhaustion.
    async fn prepare_channel(&self) -> Result<Channel, AmqpError> {
        let mut attempt = 1;

        loop {
            match self.try_create().await {
                Ok(channel) => return Ok(channel),
                Err(err) if err.is_transient() && attempt < self.retry.max_attempts => {
                    warn!(
                        error = err.to_string(),
                        attempt,
                        queue = %self.target.queue,
                        "transient failure to open channel, retrying"
                    );
                    attempt += 1;
                    tokio::time::sleep(self.retry.delay).await;
                }
                Err(err) if err.is_transient() => {
                    error!(
                        error = err.to_string(),
                        queue = %self.target.queue,
                        "exhausted channel retries"
                    );
                    return Err(AmqpError::ChannelError);
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn try_create(&self) -> Result<Channel, AmqpError> {
        self.connection.prepare().await?;
        let channel = self.connection.create_channel().await?;
        self.configure(&channel).await?;
        Ok(channel)
    }

    /// Declares the target topology at most once per manager lifetime and
    /// enables confirm mode.
    async fn configure(&self, channel: &Channel) -> Result<(), AmqpError> {
        if !self.declared.load(Ordering::SeqCst) {
            debug!(queue = %self.target.queue, "declaring topology");

            channel
                .exchange_declare(
                    &self.target.exchange,
                    (&self.target.kind).into(),
                    ExchangeDeclareOptions {
                        durable: true,
                        auto_delete: false,
                        ..ExchangeDeclareOptions::default()
                    },
                    FieldTable::from(self.target.exchange_args.clone()),
                )
                .await
                .map_err(|err| {
                    error!(error = err.to_string(), "error to declare the exchange");
                    AmqpError::DeclareExchangeError(self.target.exchange.clone())
                })?;

            channel
                .queue_declare(
                    &self.target.queue,
                    QueueDeclareOptions {
                        durable: true,
                        exclusive: false,
                        auto_delete: false,
                        ..QueueDeclareOptions::default()
                    },
                    FieldTable::from(self.target.queue_args.clone()),
                )
                .await
                .map_err(|err| {
                    error!(error = err.to_string(), "error to declare the queue");
                    AmqpError::DeclareQueueError(self.target.queue.clone())
                })?;

            channel
                .queue_bind(
                    &self.target.queue,
                    &self.target.exchange,
                    &self.target.routing_key,
                    QueueBindOptions::default(),
                    FieldTable::from(self.target.bind_args.clone()),
                )
                .await
                .map_err(|err| {
                    error!(error = err.to_string(), "error to bind queue to exchange");
                    AmqpError::BindingError(
                        self.target.exchange.clone(),
                        self.target.queue.clone(),
                    )
                })?;

            self.declared.store(true, Ordering::SeqCst);
        }

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error enabling publisher confirms");
                AmqpError::ConfirmSelectError
            })
    }

    /// Publishes on the managed channel and awaits the broker confirmation.
    ///
    /// Publishes are serialized by a dedicated lock, separate from the
    /// channel-replacement lock. The channel must already be open; callers
    /// obtain it via `get_channel()` first.
    pub async fn publish(
        &self,
        body: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        let _gate = self.publish_gate.lock().await;
        let guard = self.channel.lock().await;

        let channel = guard
            .as_ref()
            .filter(|channel| channel.status().connected())
            .ok_or(AmqpError::ChannelNotOpen)?;

        let confirm = channel
            .basic_publish(
                &self.target.exchange,
                &self.target.routing_key,
                BasicPublishOptions::default(),
                body,
                properties,
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error publishing message");
                AmqpError::PublishingError
            })?
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error awaiting publisher confirm");
                AmqpError::PublishingError
            })?;

        match confirm {
            Confirmation::Nack(_) => {
                error!(queue = %self.target.queue, "broker nacked publish");
                Err(AmqpError::PublishingError)
            }
            _ => Ok(()),
        }
    }

    /// Closes and discards the underlying channel; close-time errors are
    /// swallowed. Idempotent.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(channel) = self.channel.lock().await.take() {
            if let Err(err) = channel.close(REPLY_SUCCESS, "channel disposed").await {
                debug!(error = err.to_string(), "error closing channel");
            }
        }
    }

    pub(crate) fn is_declared(&self) -> bool {
        self.declared.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;

    #[test]
    fn target_defaults_follow_naming_convention() {
        let target = ChannelTarget::new("orders");

        assert_eq!(target.queue, "orders");
        assert_eq!(target.exchange, "orders-ex");
        assert_eq!(target.routing_key, "orders-key");
        assert_eq!(target.kind, ExchangeKind::Direct);
    }

    #[test]
    fn target_arguments_are_collected() {
        let target = ChannelTarget::new("orders-retry")
            .queue_arg(
                crate::headers::AMQP_HEADERS_DEAD_LETTER_EXCHANGE,
                AMQPValue::LongString("".into()),
            )
            .queue_arg(
                crate::headers::AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY,
                AMQPValue::LongString("orders".into()),
            );

        assert_eq!(
            target
                .queue_args
                .get(&ShortString::from("x-dead-letter-routing-key")),
            Some(&AMQPValue::LongString("orders".into()))
        );
    }

    #[tokio::test]
    async fn publish_requires_open_channel() {
        let connection = crate::connection::ConnectionManager::new(ConnectionConfig::default());
        let manager = ChannelManager::new(
            connection,
            ChannelTarget::new("orders"),
            RetryPolicy::default(),
        );

        let result = manager
            .publish(b"{}", BasicProperties::default())
            .await;

        assert_eq!(result, Err(AmqpError::ChannelNotOpen));
    }

    #[tokio::test]
    async fn get_channel_after_dispose_fails() {
        let connection = crate::connection::ConnectionManager::new(ConnectionConfig::default());
        let manager = ChannelManager::new(
            connection,
            ChannelTarget::new("orders"),
            RetryPolicy::default(),
        );

        manager.dispose().await;
        manager.dispose().await;

        assert_eq!(
            manager.get_channel().await.err(),
            Some(AmqpError::ChannelDisposed)
        );
        assert!(!manager.is_declared());
    }
}
