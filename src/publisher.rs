// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! This module provides the typed publisher: it serializes a model to JSON,
//! attaches caller-supplied headers, and publishes on a fire-and-retry basis.
//! Only broker "operation interrupted" conditions are retried; everything
//! else propagates immediately.

use crate::{
    channel::{ChannelManager, ChannelTarget},
    config::RetryPolicy,
    connection::ConnectionManager,
    errors::AmqpError,
    headers::HeaderValue,
};
use lapin::{
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties,
};
use serde::Serialize;
use std::{
    collections::{BTreeMap, HashMap},
    marker::PhantomData,
    sync::Arc,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Publishes typed models to a queue's fanout exchange.
///
/// The exchange is `<queue>-ex` (fanout, durable) and the routing key
/// `key-<queue>`; topology is declared lazily, exactly once per publisher.
pub struct QueuePublisher<T: Serialize> {
    channel: ChannelManager,
    retry: RetryPolicy,
    _model: PhantomData<fn(T)>,
}

impl<T: Serialize> QueuePublisher<T> {
    pub fn new(connection: Arc<ConnectionManager>, queue: &str) -> QueuePublisher<T> {
        Self::with_retry(connection, queue, RetryPolicy::default())
    }

    pub fn with_retry(
        connection: Arc<ConnectionManager>,
        queue: &str,
        retry: RetryPolicy,
    ) -> QueuePublisher<T> {
        let target = ChannelTarget::new(queue)
            .fanout()
            .routing_key(&format!("key-{queue}"));

        QueuePublisher {
            channel: ChannelManager::new(connection, target, retry.clone()),
            retry,
            _model: PhantomData,
        }
    }

    /// Publishes the model with the given headers.
    ///
    /// Retries with fixed delay, up to the retry policy's attempt budget, on
    /// broker interruption errors only. Checks the cancellation token
    /// immediately before the wire call and skips publishing (without
    /// failing) once cancellation was requested.
    pub async fn publish(
        &self,
        model: &T,
        headers: Option<&HashMap<String, HeaderValue>>,
        token: &CancellationToken,
    ) -> Result<(), AmqpError> {
        let body = serde_json::to_vec(model).map_err(|err| {
            error!(error = err.to_string(), "failure to serialize payload");
            AmqpError::ParsePayloadError
        })?;

        let mut attempt = 1;

        loop {
            match self.try_publish(&body, headers, token).await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_interruption() && attempt < self.retry.max_attempts => {
                    warn!(
                        error = err.to_string(),
                        attempt, "publish interrupted, retrying"
                    );
                    attempt += 1;
                    tokio::time::sleep(self.retry.delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn try_publish(
        &self,
        body: &[u8],
        headers: Option<&HashMap<String, HeaderValue>>,
        token: &CancellationToken,
    ) -> Result<(), AmqpError> {
        self.channel.get_channel().await?;

        let properties = BasicProperties::default()
            .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
            .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
            .with_headers(build_headers(headers));

        if token.is_cancelled() {
            debug!("cancellation requested, skipping publish");
            return Ok(());
        }

        self.channel.publish(body, properties).await
    }
}

/// Converts caller-supplied header values to their AMQP representation.
/// Timestamps and unique identifiers are stringified; the rest pass through.
fn build_headers(headers: Option<&HashMap<String, HeaderValue>>) -> FieldTable {
    let mut table = BTreeMap::<ShortString, AMQPValue>::new();

    if let Some(headers) = headers {
        for (key, value) in headers {
            table.insert(ShortString::from(key.as_str()), AMQPValue::from(value));
        }
    }

    FieldTable::from(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use lapin::types::LongString;

    #[test]
    fn caller_headers_pass_through_unchanged() {
        let mut headers = HashMap::new();
        headers.insert("x".to_owned(), HeaderValue::Text("v".to_owned()));

        let table = build_headers(Some(&headers));

        assert_eq!(
            table.inner().get(&ShortString::from("x")),
            Some(&AMQPValue::LongString(LongString::from("v")))
        );
        // the publisher never adds attempt/created-at; those are subscriber-side
        assert_eq!(table.inner().len(), 1);
    }

    #[test]
    fn no_headers_yields_empty_table() {
        let table = build_headers(None);

        assert!(table.inner().is_empty());
    }

    #[tokio::test]
    async fn publisher_targets_fanout_with_key_prefix_routing() {
        #[derive(Serialize)]
        struct Model {
            id: u32,
        }

        let connection = ConnectionManager::new(ConnectionConfig::default());
        let publisher: QueuePublisher<Model> = QueuePublisher::new(connection, "orders");

        assert_eq!(publisher.channel.target().exchange_name(), "orders-ex");
        assert_eq!(publisher.channel.target().queue_name(), "orders");
        assert_eq!(publisher.channel.target().routing_key, "key-orders");
        assert_eq!(
            publisher.channel.target().kind,
            crate::channel::ExchangeKind::Fanout
        );
    }
}
