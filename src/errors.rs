// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Resilience Layer
//!
//! This module provides the error taxonomy for the RabbitMQ resilience layer.
//! The `AmqpError` enum covers connection and channel lifecycle failures,
//! declaration problems, publishing failures, and consumer-side errors.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Connection could not be established after exhausting the retry budget
    #[error("failure to connect")]
    ConnectionError,

    /// Operation attempted on a connection manager that was already disposed
    #[error("connection was disposed")]
    ConnectionDisposed,

    /// A channel was requested while the connection is closed
    #[error("no open connection available")]
    NotConnected,

    /// Channel could not be opened after exhausting the retry budget
    #[error("failure to create a channel")]
    ChannelError,

    /// Operation attempted on a channel manager that was already disposed
    #[error("channel was disposed")]
    ChannelDisposed,

    /// Publish attempted while the managed channel is not open
    #[error("channel is not open")]
    ChannelNotOpen,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding queue `{1}` to exchange `{0}`
    #[error("failure to bind exchange `{0}` to queue `{1}`")]
    BindingError(String, String),

    /// Error enabling publisher-confirmation mode
    #[error("failure to enable publisher confirms")]
    ConfirmSelectError,

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error publishing a message
    #[error("failure to publish")]
    PublishingError,

    /// Error parsing a message payload
    #[error("failure to parse payload")]
    ParsePayloadError,

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error redirecting a failed message to the `{0}` queue
    #[error("failure to redirect message to the `{0}` queue")]
    RedirectError(String),

    /// Error consuming a message
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),
}

impl AmqpError {
    /// Transient connectivity failures worth retrying at the channel layer.
    ///
    /// Covers the socket/broker-unreachable/invalid-operation class: the
    /// connection dropped between health check and use, or the channel
    /// create itself failed against a live but unstable broker.
    pub(crate) fn is_transient(&self) -> bool {
        matches!(self, AmqpError::NotConnected | AmqpError::ChannelError)
    }

    /// Broker-interruption failures that publishers retry with fixed backoff.
    ///
    /// Everything else (payload serialization, declaration failures) is not
    /// recoverable by retrying the publish and propagates immediately.
    pub(crate) fn is_interruption(&self) -> bool {
        matches!(
            self,
            AmqpError::NotConnected
                | AmqpError::ChannelError
                | AmqpError::ChannelNotOpen
                | AmqpError::PublishingError
        )
    }
}
