// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the RabbitMQ Client
//!
//! `AmqpError` covers both the errors surfaced to application code (closed
//! client, unavailable channel, topology conflicts, unconfirmed publishes,
//! publish and subscribe failures) and the lower-level failures reported by
//! the broker adapter, which the publisher and subscriber wrap with context.

use std::time::Duration;
use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Invalid or unreadable configuration
    #[error("invalid configuration `{0}`")]
    ConfigError(String),

    /// Operation attempted on a client that was explicitly disposed
    #[error("client was disposed")]
    ClientClosedError,

    /// No usable channel could be obtained from the connection manager
    #[error("channel unavailable `{0}`")]
    ChannelUnavailableError(String),

    /// A declare call conflicts with the definition held by the broker
    #[error("topology conflict on `{0}`")]
    TopologyConflictError(String),

    /// The broker did not confirm the publish in time. The message may or may
    /// not have been accepted.
    #[error("message `{message_id}` was not confirmed within {timeout:?}")]
    PublishUnconfirmedError { message_id: String, timeout: Duration },

    /// The broker negatively acknowledged the publish
    #[error("message `{0}` was rejected by the broker")]
    PublishRejectedError(String),

    /// Publish failure with the exchange and routing key it was aimed at
    #[error("failure to publish to exchange `{exchange}` with key `{routing_key}`")]
    PublishError {
        exchange: String,
        routing_key: String,
        #[source]
        source: Box<AmqpError>,
    },

    /// Subscription setup failure for the given queue
    #[error("failure to set up subscription for queue `{queue}`")]
    SubscribeSetupError {
        queue: String,
        #[source]
        source: Box<AmqpError>,
    },

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect `{0}`")]
    ConnectionError(String),

    /// Error creating or configuring a channel
    #[error("failure to create a channel `{0}`")]
    ChannelError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error declaring a consumer on the given queue
    #[error("failure to declare consumer `{0}`")]
    ConsumerDeclarationError(String),

    /// Error receiving a delivery
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// Error sending a message to the broker
    #[error("failure to publish `{0}`")]
    PublishingError(String),

    /// Error while waiting for the broker confirmation
    #[error("failure to receive publish confirmation `{0}`")]
    ConfirmationError(String),

    /// Error acknowledging a message
    #[error("failure to ack message `{0}`")]
    AckMessageError(u64),

    /// Error negative-acknowledging a message
    #[error("failure to nack message `{0}`")]
    NackMessageError(u64),
}

impl AmqpError {
    /// Errors that keep their identity when a publish or subscribe wraps a
    /// lower-level failure.
    pub(crate) fn passes_through(&self) -> bool {
        matches!(
            self,
            AmqpError::ClientClosedError
                | AmqpError::ChannelUnavailableError(_)
                | AmqpError::TopologyConflictError(_)
                | AmqpError::PublishUnconfirmedError { .. }
        )
    }
}
