// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Subscriber
//!
//! This module runs the consume loop and the per-delivery failure-routing
//! state machine. Each delivery moves through
//! `Received → Deserializing → Processing` and terminates in exactly one of
//! `Acked-Success`, `Retry-Scheduled`, or `Dead-Lettered`. Retry is
//! implemented entirely via a side delay queue whose per-message TTL
//! dead-letters back into the primary queue; the broker never redelivers the
//! original message itself.

use crate::{
    channel::{ChannelManager, ChannelTarget},
    config::RetryPolicy,
    connection::ConnectionManager,
    errors::AmqpError,
    headers::{
        self, AMQP_HEADERS_ATTEMPT, AMQP_HEADERS_DEAD_LETTER_EXCHANGE,
        AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY, AMQP_HEADERS_DELAYED_EXCHANGE_TYPE,
        AMQP_HEADERS_MESSAGE_TTL,
    },
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions,
        ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties,
};
use serde::de::DeserializeOwned;
use std::{collections::BTreeMap, marker::PhantomData, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Fixed wait before restarting the whole consume setup after a broker error
const SETUP_RETRY_DELAY: Duration = Duration::from_secs(3);

const REPLY_SUCCESS: u16 = 200;

/// Error type produced by processing callbacks and transaction hooks.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Queue names and retry policy for one subscriber, injected into the
/// generic engine instead of being overridden on a base class.
#[derive(Debug, Clone)]
pub struct SubscriberConfig {
    pub(crate) queue: String,
    pub(crate) delayed_queue: String,
    pub(crate) dead_queue: String,
    pub(crate) retry: RetryPolicy,
    pub(crate) transactional: bool,
}

impl SubscriberConfig {
    /// Creates a configuration for the given primary queue, deriving
    /// `<queue>-retry` and `<queue>-dead` side queue names.
    pub fn new(queue: &str) -> SubscriberConfig {
        SubscriberConfig {
            queue: queue.to_owned(),
            delayed_queue: format!("{queue}-retry"),
            dead_queue: format!("{queue}-dead"),
            retry: RetryPolicy::default(),
            transactional: false,
        }
    }

    pub fn delayed_queue(mut self, name: &str) -> Self {
        self.delayed_queue = name.to_owned();
        self
    }

    pub fn dead_queue(mut self, name: &str) -> Self {
        self.dead_queue = name.to_owned();
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn transactional(mut self) -> Self {
        self.transactional = true;
        self
    }

    pub fn queue_name(&self) -> &str {
        &self.queue
    }
}

/// Per-delivery context handed to the processing callback.
pub struct DeliveryContext<T> {
    pub message: T,
    pub headers: BTreeMap<String, String>,
}

/// Processing and failure strategies for one message type.
///
/// `process` holds the business logic; `on_failure` performs side-effecting
/// handling (logging, alerting) and must not fail. It is invoked for every
/// failed delivery regardless of whether the message was retry-scheduled or
/// dead-lettered.
#[async_trait]
pub trait MessageHandler<T>: Send + Sync {
    async fn process(
        &self,
        context: &DeliveryContext<T>,
        token: &CancellationToken,
    ) -> Result<(), HandlerError>;

    async fn on_failure(
        &self,
        error: &(dyn std::error::Error + Send + Sync),
        context: Option<&DeliveryContext<T>>,
        attempt: i64,
    );
}

/// Explicit commit/rollback boundary wrapped around the processing callback.
///
/// Commit is tied to the success branch; rollback to the same branch that
/// decides retry vs. dead-letter routing.
#[async_trait]
pub trait UnitOfWork: Send + Sync {
    async fn begin(&self) -> Result<(), HandlerError>;
    async fn commit(&self) -> Result<(), HandlerError>;
    async fn rollback(&self) -> Result<(), HandlerError>;
}

/// A failed message on its way to a side queue.
#[derive(Debug, Clone)]
pub struct RedirectEnvelope {
    pub(crate) body: Vec<u8>,
    pub(crate) content_type: Option<String>,
    pub(crate) headers: BTreeMap<String, String>,
    pub(crate) expiration_ms: Option<u64>,
}

/// Destination for redirected messages. `ChannelManager` is the production
/// implementation; tests substitute a mock so the per-delivery state machine
/// runs without a broker.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RedirectSink: Send + Sync {
    async fn send(&self, envelope: RedirectEnvelope) -> Result<(), AmqpError>;
}

#[async_trait]
impl RedirectSink for ChannelManager {
    async fn send(&self, envelope: RedirectEnvelope) -> Result<(), AmqpError> {
        self.get_channel().await?;

        let mut properties = BasicProperties::default()
            .with_delivery_mode(2)
            .with_correlation_id(ShortString::from(Uuid::new_v4().to_string()))
            .with_headers(headers::encode(&envelope.headers));

        if let Some(content_type) = &envelope.content_type {
            properties = properties.with_content_type(ShortString::from(content_type.as_str()));
        }

        if let Some(expiration_ms) = envelope.expiration_ms {
            properties = properties.with_expiration(ShortString::from(expiration_ms.to_string()));
        }

        self.publish(&envelope.body, properties).await
    }
}

/// Which side queue a failed delivery is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Route {
    Delayed,
    Dead,
}

/// Increments the attempt counter and decides the routing branch: within the
/// budget the message is delay-scheduled, beyond it dead-lettered.
pub(crate) fn classify_failure(attempt: i64, max_attempts: u32) -> (i64, Route) {
    let next = attempt + 1;
    if next <= i64::from(max_attempts) {
        (next, Route::Delayed)
    } else {
        (next, Route::Dead)
    }
}

/// Routes failed messages to the delay or dead queue.
pub(crate) struct FailureRouter<S> {
    delayed: S,
    dead: S,
    retry: RetryPolicy,
}

impl<S: RedirectSink> FailureRouter<S> {
    pub(crate) fn new(delayed: S, dead: S, retry: RetryPolicy) -> FailureRouter<S> {
        FailureRouter {
            delayed,
            dead,
            retry,
        }
    }

    /// Routes a processing failure and returns the incremented attempt count.
    ///
    /// Delayed envelopes carry the updated `attempt` header and a per-message
    /// expiration equal to the retry delay, so the broker's TTL/dead-letter
    /// mechanics redeliver them to the primary queue without any polling.
    pub(crate) async fn route(
        &self,
        envelope: RedirectEnvelope,
        attempt: i64,
    ) -> Result<i64, AmqpError> {
        let (next, route) = classify_failure(attempt, self.retry.max_attempts);

        match route {
            Route::Delayed => {
                warn!(attempt = next, "processing failed, scheduling retry");
                self.to_delayed(envelope, next).await?;
            }
            Route::Dead => {
                error!(attempt = next, "too many attempts, sending to dead queue");
                self.to_dead(envelope).await?;
            }
        }

        Ok(next)
    }

    pub(crate) async fn to_delayed(
        &self,
        mut envelope: RedirectEnvelope,
        attempt: i64,
    ) -> Result<(), AmqpError> {
        let ttl_ms = self.retry.delay.as_millis() as u64;

        envelope
            .headers
            .insert(AMQP_HEADERS_ATTEMPT.to_owned(), attempt.to_string());
        envelope
            .headers
            .insert(AMQP_HEADERS_MESSAGE_TTL.to_owned(), ttl_ms.to_string());
        envelope.expiration_ms = Some(ttl_ms);

        self.delayed.send(envelope).await.map_err(|err| {
            error!(error = err.to_string(), "error publishing to delay queue");
            AmqpError::RedirectError("delay".to_owned())
        })
    }

    pub(crate) async fn to_dead(&self, envelope: RedirectEnvelope) -> Result<(), AmqpError> {
        self.dead.send(envelope).await.map_err(|err| {
            error!(error = err.to_string(), "error publishing to dead queue");
            AmqpError::RedirectError("dead".to_owned())
        })
    }
}

/// Delay queue target: TTL expiry dead-letters into the default exchange
/// with the primary queue as routing key, which is what redelivers the
/// message after the configured delay.
fn delayed_target(config: &SubscriberConfig) -> ChannelTarget {
    ChannelTarget::new(&config.delayed_queue)
        .exchange_arg(
            AMQP_HEADERS_DELAYED_EXCHANGE_TYPE,
            AMQPValue::LongString(LongString::from("direct")),
        )
        .queue_arg(
            AMQP_HEADERS_DEAD_LETTER_EXCHANGE,
            AMQPValue::LongString(LongString::from("")),
        )
        .queue_arg(
            AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY,
            AMQPValue::LongString(LongString::from(config.queue.clone())),
        )
}

/// Dead queue target: terminal, its dead-letter exchange points at itself
/// so no further automatic routing occurs.
fn dead_target(config: &SubscriberConfig) -> ChannelTarget {
    ChannelTarget::new(&config.dead_queue).queue_arg(
        AMQP_HEADERS_DEAD_LETTER_EXCHANGE,
        AMQPValue::LongString(LongString::from(format!("{}-ex", config.dead_queue))),
    )
}

/// Generic subscriber engine for one queue and message type.
///
/// Consumes with prefetch 1 and manual acknowledgment, invokes the injected
/// handler per delivery, and funnels every failure into the delay/dead
/// routing so a single bad message can never crash the consume loop.
pub struct QueueSubscriber<T, H, S = ChannelManager> {
    config: SubscriberConfig,
    connection: Arc<ConnectionManager>,
    handler: Arc<H>,
    unit_of_work: Option<Arc<dyn UnitOfWork>>,
    router: FailureRouter<S>,
    _model: PhantomData<fn() -> T>,
}

impl<T, H> QueueSubscriber<T, H>
where
    T: DeserializeOwned + Send + Sync,
    H: MessageHandler<T>,
{
    pub fn new(
        connection: Arc<ConnectionManager>,
        config: SubscriberConfig,
        handler: Arc<H>,
    ) -> QueueSubscriber<T, H> {
        let delayed = ChannelManager::new(
            connection.clone(),
            delayed_target(&config),
            config.retry.clone(),
        );
        let dead = ChannelManager::new(
            connection.clone(),
            dead_target(&config),
            config.retry.clone(),
        );
        let router = FailureRouter::new(delayed, dead, config.retry.clone());

        QueueSubscriber {
            config,
            connection,
            handler,
            unit_of_work: None,
            router,
            _model: PhantomData,
        }
    }
}

impl<T, H, S> QueueSubscriber<T, H, S>
where
    T: DeserializeOwned + Send + Sync,
    H: MessageHandler<T>,
    S: RedirectSink,
{
    /// Installs the transaction hook wrapped around processing.
    pub fn unit_of_work(mut self, unit_of_work: Arc<dyn UnitOfWork>) -> Self {
        self.unit_of_work = Some(unit_of_work);
        self.config.transactional = true;
        self
    }

    /// Runs the subscriber until the token is cancelled.
    ///
    /// The whole setup (connection, channel, topology, consumer) restarts
    /// with a fixed wait whenever the broker interrupts it; cancellation is
    /// the only way out.
    pub async fn start(&self, token: CancellationToken) -> Result<(), AmqpError> {
        loop {
            if token.is_cancelled() {
                return Ok(());
            }

            match self.run(&token).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    error!(
                        error = err.to_string(),
                        queue = %self.config.queue,
                        "consume loop failed, restarting"
                    );
                    tokio::select! {
                        _ = token.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(SETUP_RETRY_DELAY) => {}
                    }
                }
            }
        }
    }

    async fn run(&self, token: &CancellationToken) -> Result<(), AmqpError> {
        self.connection.prepare().await?;
        let channel = self.connection.create_channel().await?;

        let exchange = format!("{}-ex", self.config.queue);
        let routing_key = format!("{}-key", self.config.queue);

        channel
            .exchange_declare(
                &exchange,
                lapin::ExchangeKind::Fanout,
                ExchangeDeclareOptions {
                    durable: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to declare the exchange");
                AmqpError::DeclareExchangeError(exchange.clone())
            })?;

        channel
            .queue_declare(
                &self.config.queue,
                QueueDeclareOptions {
                    durable: true,
                    exclusive: false,
                    auto_delete: false,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to declare the queue");
                AmqpError::DeclareQueueError(self.config.queue.clone())
            })?;

        channel
            .queue_bind(
                &self.config.queue,
                &exchange,
                &routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to bind queue to exchange");
                AmqpError::BindingError(exchange.clone(), self.config.queue.clone())
            })?;

        // one unacknowledged delivery at a time per subscriber instance
        channel
            .basic_qos(1, BasicQosOptions::default())
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to configure qos");
                AmqpError::QoSDeclarationError(self.config.queue.clone())
            })?;

        let mut consumer = channel
            .basic_consume(
                &self.config.queue,
                &format!("{}-consumer", self.config.queue),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to create the consumer");
                AmqpError::ConsumerError(self.config.queue.clone())
            })?;

        debug!(queue = %self.config.queue, "subscriber started");

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!(queue = %self.config.queue, "cancellation requested, stopping subscriber");
                    if let Err(err) = channel.close(REPLY_SUCCESS, "subscriber stopped").await {
                        warn!(error = err.to_string(), "error closing consume channel");
                    }
                    self.connection.dispose().await;
                    return Ok(());
                }
                delivery = consumer.next() => {
                    match delivery {
                        Some(Ok(delivery)) => {
                            if let Err(err) = self.handle(delivery, token).await {
                                error!(error = err.to_string(), "failure handling delivery");
                            }
                        }
                        Some(Err(err)) => {
                            error!(error = err.to_string(), "error receiving delivery");
                        }
                        None => {
                            warn!(queue = %self.config.queue, "consumer stream ended");
                            return Err(AmqpError::ConsumerError(self.config.queue.clone()));
                        }
                    }
                }
            }
        }
    }

    /// Drives one delivery through the state machine.
    ///
    /// The original delivery is acknowledged exactly once in each terminal
    /// state, and only after any redirect publish has confirmed; when the
    /// redirect itself fails the delivery is nacked back to the broker so
    /// the message is never silently dropped.
    async fn handle(&self, delivery: Delivery, token: &CancellationToken) -> Result<(), AmqpError> {
        let (attempt, headers) = headers::extract(&delivery.properties);
        let content_type = delivery
            .properties
            .content_type()
            .as_ref()
            .map(|value| value.as_str().to_owned());

        let envelope = RedirectEnvelope {
            body: delivery.data.clone(),
            content_type,
            headers: headers.clone(),
            expiration_ms: None,
        };

        let message = match serde_json::from_slice::<T>(&delivery.data) {
            Ok(message) => message,
            Err(err) => {
                // malformed messages are presumed non-recoverable
                warn!(
                    error = err.to_string(),
                    queue = %self.config.queue,
                    "poison message, routing to dead queue"
                );
                // ack precedes the failure callback on this path
                return match self.router.to_dead(envelope).await {
                    Ok(()) => {
                        let acked = self.ack(&delivery).await;
                        self.handler.on_failure(&err, None, attempt).await;
                        acked
                    }
                    Err(redirect_err) => {
                        error!(
                            error = redirect_err.to_string(),
                            "redirect failed, requeueing original delivery"
                        );
                        self.handler.on_failure(&err, None, attempt).await;
                        self.nack(&delivery).await
                    }
                };
            }
        };

        let context = DeliveryContext { message, headers };

        if self.config.transactional {
            if let Some(unit_of_work) = &self.unit_of_work {
                if let Err(err) = unit_of_work.begin().await {
                    error!(error = err.to_string(), "failure opening transaction scope");
                    self.handler
                        .on_failure(err.as_ref(), Some(&context), attempt)
                        .await;
                    return self.nack(&delivery).await;
                }
            }
        }

        match self.process_in_scope(&context, token).await {
            Ok(()) => {
                debug!(queue = %self.config.queue, "message successfully processed");
                self.ack(&delivery).await
            }
            Err(err) => {
                let outcome = self.router.route(envelope, attempt).await;
                let (next, outcome) = match outcome {
                    Ok(next) => (next, Ok(())),
                    Err(redirect_err) => (attempt + 1, Err(redirect_err)),
                };
                self.finish(&delivery, outcome, err.as_ref(), Some(&context), next)
                    .await
            }
        }
    }

    /// Processing wrapped in the optional transaction boundary: commit only
    /// on success, rollback on the same branch that routes retry/dead.
    async fn process_in_scope(
        &self,
        context: &DeliveryContext<T>,
        token: &CancellationToken,
    ) -> Result<(), HandlerError> {
        match self.handler.process(context, token).await {
            Ok(()) => {
                if self.config.transactional {
                    if let Some(unit_of_work) = &self.unit_of_work {
                        unit_of_work.commit().await?;
                    }
                }
                Ok(())
            }
            Err(err) => {
                if self.config.transactional {
                    if let Some(unit_of_work) = &self.unit_of_work {
                        if let Err(rollback_err) = unit_of_work.rollback().await {
                            warn!(
                                error = rollback_err.to_string(),
                                "failure rolling back transaction scope"
                            );
                        }
                    }
                }
                Err(err)
            }
        }
    }

    /// Terminal bookkeeping for the processing-failure path: failure
    /// callback, then ack (redirect confirmed) or nack with requeue
    /// (redirect failed).
    async fn finish(
        &self,
        delivery: &Delivery,
        outcome: Result<(), AmqpError>,
        error: &(dyn std::error::Error + Send + Sync),
        context: Option<&DeliveryContext<T>>,
        attempt: i64,
    ) -> Result<(), AmqpError> {
        self.handler.on_failure(error, context, attempt).await;

        match outcome {
            Ok(()) => self.ack(delivery).await,
            Err(redirect_err) => {
                error!(
                    error = redirect_err.to_string(),
                    "redirect failed, requeueing original delivery"
                );
                self.nack(delivery).await
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), AmqpError> {
        delivery
            .ack(BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                AmqpError::AckMessageError
            })
    }

    async fn nack(&self, delivery: &Delivery) -> Result<(), AmqpError> {
        delivery
            .nack(BasicNackOptions {
                multiple: false,
                requeue: true,
            })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling nack msg");
                AmqpError::NackMessageError
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::ConnectionConfig, headers::AMQP_HEADERS_CREATED_AT};
    use lapin::acker::Acker;
    use mockall::Sequence;
    use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

    fn envelope(attempt: i64) -> RedirectEnvelope {
        let mut headers = BTreeMap::new();
        headers.insert(AMQP_HEADERS_ATTEMPT.to_owned(), attempt.to_string());
        headers.insert(
            AMQP_HEADERS_CREATED_AT.to_owned(),
            "2026-01-01T00:00:00+00:00".to_owned(),
        );

        RedirectEnvelope {
            body: b"{}".to_vec(),
            content_type: Some(JSON.to_owned()),
            headers,
            expiration_ms: None,
        }
    }

    const JSON: &str = "application/json";

    fn policy() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_secs(10))
    }

    #[test]
    fn failure_classification_respects_the_attempt_budget() {
        assert_eq!(classify_failure(1, 3), (2, Route::Delayed));
        assert_eq!(classify_failure(2, 3), (3, Route::Delayed));
        assert_eq!(classify_failure(3, 3), (4, Route::Dead));
        assert_eq!(classify_failure(1, 0), (2, Route::Dead));
    }

    #[tokio::test]
    async fn first_failure_is_delay_scheduled_with_incremented_attempt() {
        let mut delayed = MockRedirectSink::new();
        delayed
            .expect_send()
            .withf(|env| {
                env.headers.get(AMQP_HEADERS_ATTEMPT) == Some(&"2".to_owned())
                    && env.expiration_ms == Some(10_000)
                    && env.headers.get(AMQP_HEADERS_MESSAGE_TTL) == Some(&"10000".to_owned())
            })
            .times(1)
            .returning(|_| Ok(()));

        let mut dead = MockRedirectSink::new();
        dead.expect_send().never();

        let router = FailureRouter::new(delayed, dead, policy());

        let next = router.route(envelope(1), 1).await.unwrap();

        assert_eq!(next, 2);
    }

    #[tokio::test]
    async fn two_failures_then_success_routes_to_delay_twice() {
        let mut sequence = Sequence::new();
        let mut delayed = MockRedirectSink::new();
        delayed
            .expect_send()
            .withf(|env| env.headers.get(AMQP_HEADERS_ATTEMPT) == Some(&"2".to_owned()))
            .times(1)
            .in_sequence(&mut sequence)
            .returning(|_| Ok(()));
        delayed
            .expect_send()
            .withf(|env| env.headers.get(AMQP_HEADERS_ATTEMPT) == Some(&"3".to_owned()))
            .times(1)
            .in_sequence(&mut sequence)
            .returning(|_| Ok(()));

        let mut dead = MockRedirectSink::new();
        dead.expect_send().never();

        let router = FailureRouter::new(delayed, dead, policy());

        // first delivery fails, redelivery fails again, third attempt succeeds
        assert_eq!(router.route(envelope(1), 1).await.unwrap(), 2);
        assert_eq!(router.route(envelope(2), 2).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn exhausted_budget_routes_to_dead_with_headers_untouched() {
        let mut delayed = MockRedirectSink::new();
        delayed.expect_send().never();

        let mut dead = MockRedirectSink::new();
        dead.expect_send()
            .withf(|env| {
                // the dead envelope keeps the last observed attempt header
                env.headers.get(AMQP_HEADERS_ATTEMPT) == Some(&"3".to_owned())
                    && env.expiration_ms.is_none()
            })
            .times(1)
            .returning(|_| Ok(()));

        let router = FailureRouter::new(delayed, dead, policy());

        let next = router.route(envelope(3), 3).await.unwrap();

        assert_eq!(next, 4);
    }

    #[tokio::test]
    async fn created_at_is_preserved_across_redirects() {
        let mut delayed = MockRedirectSink::new();
        delayed
            .expect_send()
            .withf(|env| {
                env.headers.get(AMQP_HEADERS_CREATED_AT)
                    == Some(&"2026-01-01T00:00:00+00:00".to_owned())
            })
            .times(1)
            .returning(|_| Ok(()));

        let dead = MockRedirectSink::new();
        let router = FailureRouter::new(delayed, dead, policy());

        router.route(envelope(1), 1).await.unwrap();
    }

    #[tokio::test]
    async fn redirect_publish_failure_is_surfaced_not_swallowed() {
        let mut delayed = MockRedirectSink::new();
        delayed
            .expect_send()
            .times(1)
            .returning(|_| Err(AmqpError::PublishingError));

        let dead = MockRedirectSink::new();
        let router = FailureRouter::new(delayed, dead, policy());

        let result = router.route(envelope(1), 1).await;

        assert_eq!(result, Err(AmqpError::RedirectError("delay".to_owned())));
    }

    #[test]
    fn side_queue_targets_follow_the_wire_conventions() {
        let config = SubscriberConfig::new("orders");

        let delayed = delayed_target(&config);
        assert_eq!(delayed.queue_name(), "orders-retry");
        assert_eq!(delayed.exchange_name(), "orders-retry-ex");
        assert_eq!(
            delayed
                .queue_args
                .get(&ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE)),
            Some(&AMQPValue::LongString(LongString::from("")))
        );
        assert_eq!(
            delayed
                .queue_args
                .get(&ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY)),
            Some(&AMQPValue::LongString(LongString::from("orders")))
        );

        let dead = dead_target(&config);
        assert_eq!(dead.queue_name(), "orders-dead");
        assert_eq!(
            dead.queue_args
                .get(&ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE)),
            Some(&AMQPValue::LongString(LongString::from("orders-dead-ex")))
        );
    }

    #[test]
    fn subscriber_config_derives_side_queue_names() {
        let config = SubscriberConfig::new("orders");

        assert_eq!(config.queue_name(), "orders");
        assert_eq!(config.delayed_queue, "orders-retry");
        assert_eq!(config.dead_queue, "orders-dead");
        assert!(!config.transactional);
    }

    #[derive(serde::Deserialize)]
    struct Order {
        id: u32,
    }

    #[derive(Default)]
    struct RecordingHandler {
        fail_processing: bool,
        processed: AtomicUsize,
        failures: AtomicUsize,
        last_attempt: AtomicI64,
    }

    #[async_trait]
    impl MessageHandler<Order> for RecordingHandler {
        async fn process(
            &self,
            context: &DeliveryContext<Order>,
            _token: &CancellationToken,
        ) -> Result<(), HandlerError> {
            self.processed.fetch_add(1, Ordering::SeqCst);
            assert!(context.message.id > 0);
            if self.fail_processing {
                return Err("processing failed".into());
            }
            Ok(())
        }

        async fn on_failure(
            &self,
            _error: &(dyn std::error::Error + Send + Sync),
            _context: Option<&DeliveryContext<Order>>,
            attempt: i64,
        ) {
            self.failures.fetch_add(1, Ordering::SeqCst);
            self.last_attempt.store(attempt, Ordering::SeqCst);
        }
    }

    fn subscriber(
        handler: Arc<RecordingHandler>,
        delayed: MockRedirectSink,
        dead: MockRedirectSink,
    ) -> QueueSubscriber<Order, RecordingHandler, MockRedirectSink> {
        QueueSubscriber {
            config: SubscriberConfig::new("orders"),
            connection: ConnectionManager::new(ConnectionConfig::default()),
            handler,
            unit_of_work: None,
            router: FailureRouter::new(delayed, dead, policy()),
            _model: PhantomData,
        }
    }

    fn delivery(data: &[u8]) -> Delivery {
        Delivery {
            delivery_tag: 1,
            exchange: ShortString::from("orders-ex"),
            routing_key: ShortString::from("orders-key"),
            redelivered: false,
            properties: BasicProperties::default(),
            data: data.to_vec(),
            acker: Acker::default(),
        }
    }

    #[tokio::test]
    async fn malformed_body_routes_to_dead_exactly_once() {
        let mut delayed = MockRedirectSink::new();
        delayed.expect_send().never();

        let mut dead = MockRedirectSink::new();
        dead.expect_send()
            .withf(|env| {
                env.body == b"not-json"
                    && env.headers.get(AMQP_HEADERS_ATTEMPT) == Some(&"1".to_owned())
            })
            .times(1)
            .returning(|_| Ok(()));

        let handler = Arc::new(RecordingHandler::default());
        let engine = subscriber(handler.clone(), delayed, dead);
        let token = CancellationToken::new();

        let result = engine.handle(delivery(b"not-json"), &token).await;

        assert!(result.is_ok());
        assert_eq!(handler.processed.load(Ordering::SeqCst), 0);
        assert_eq!(handler.failures.load(Ordering::SeqCst), 1);
        assert_eq!(handler.last_attempt.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn successful_processing_acks_without_redirects() {
        let mut delayed = MockRedirectSink::new();
        delayed.expect_send().never();
        let mut dead = MockRedirectSink::new();
        dead.expect_send().never();

        let handler = Arc::new(RecordingHandler::default());
        let engine = subscriber(handler.clone(), delayed, dead);
        let token = CancellationToken::new();

        let result = engine.handle(delivery(br#"{"id":7}"#), &token).await;

        assert!(result.is_ok());
        assert_eq!(handler.processed.load(Ordering::SeqCst), 1);
        assert_eq!(handler.failures.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn processing_failure_schedules_retry_and_reports() {
        let mut delayed = MockRedirectSink::new();
        delayed
            .expect_send()
            .withf(|env| {
                env.body == br#"{"id":7}"#
                    && env.headers.get(AMQP_HEADERS_ATTEMPT) == Some(&"2".to_owned())
            })
            .times(1)
            .returning(|_| Ok(()));
        let mut dead = MockRedirectSink::new();
        dead.expect_send().never();

        let handler = Arc::new(RecordingHandler {
            fail_processing: true,
            ..RecordingHandler::default()
        });
        let engine = subscriber(handler.clone(), delayed, dead);
        let token = CancellationToken::new();

        let result = engine.handle(delivery(br#"{"id":7}"#), &token).await;

        assert!(result.is_ok());
        assert_eq!(handler.processed.load(Ordering::SeqCst), 1);
        assert_eq!(handler.failures.load(Ordering::SeqCst), 1);
        assert_eq!(handler.last_attempt.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_redirect_still_reports_with_incremented_attempt() {
        let mut delayed = MockRedirectSink::new();
        delayed
            .expect_send()
            .times(1)
            .returning(|_| Err(AmqpError::PublishingError));
        let mut dead = MockRedirectSink::new();
        dead.expect_send().never();

        let handler = Arc::new(RecordingHandler {
            fail_processing: true,
            ..RecordingHandler::default()
        });
        let engine = subscriber(handler.clone(), delayed, dead);
        let token = CancellationToken::new();

        let result = engine.handle(delivery(br#"{"id":7}"#), &token).await;

        assert!(result.is_ok());
        assert_eq!(handler.failures.load(Ordering::SeqCst), 1);
        assert_eq!(handler.last_attempt.load(Ordering::SeqCst), 2);
    }
}
