// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Protocol Capabilities
//!
//! The connection manager, publisher and subscriber only talk to the broker
//! through the traits in this module. `crate::channel` implements them on top
//! of lapin; tests substitute mocks so no live broker is needed.
//!
//! All channels handed out by an [`AmqpConnection`] must be safe to share
//! between tasks. Publisher confirmations returned by [`AmqpChannel::publish`]
//! are correlated to the single message they were created for.

use crate::{
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::{future::BoxFuture, stream::BoxStream};
use lapin::BasicProperties;
use std::sync::Arc;

#[cfg(test)]
use mockall::automock;

/// Lifecycle notifications raised by connections, channels and consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    Shutdown { reason: String },
    Blocked { reason: String },
    Unblocked,
    CallbackError { error: String },
    /// A recorded exchange, queue or binding was rejected while replaying
    /// topology on a recovered channel.
    RecoveryError { entity: String, error: String },
}

/// Observer invoked synchronously for every lifecycle event.
pub type LifecycleListener = Arc<dyn Fn(LifecycleEvent) + Send + Sync>;

/// Outcome of a publisher confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    Ack,
    Nack,
    /// The channel is not in confirm mode.
    NotRequested,
}

/// Resolves once the broker confirms (or refuses) a published message.
pub type PendingConfirm = BoxFuture<'static, Result<Confirmation, AmqpError>>;

/// Deliveries pushed by the broker for one consumer.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, AmqpError>>;

/// Inbound message received by a consumer.
#[derive(Debug, Clone, Default)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: BasicProperties,
    pub data: Vec<u8>,
}

impl Delivery {
    pub fn message_id(&self) -> Option<String> {
        self.properties
            .message_id()
            .as_ref()
            .map(|id| id.to_string())
    }
}

/// Opens broker connections.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AmqpConnector: Send + Sync {
    async fn connect(&self, client_name: &str) -> Result<Arc<dyn AmqpConnection>, AmqpError>;
}

/// Logical session to the broker.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AmqpConnection: Send + Sync {
    fn is_open(&self) -> bool;

    fn on_event(&self, listener: LifecycleListener);

    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// Multiplexed sub-session used for every broker operation.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AmqpChannel: Send + Sync {
    fn id(&self) -> u16;

    fn is_open(&self) -> bool;

    fn on_event(&self, listener: LifecycleListener);

    /// Puts the channel in publisher-confirm mode.
    async fn confirm_select(&self) -> Result<(), AmqpError>;

    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError>;

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    async fn set_prefetch(&self, count: u16) -> Result<(), AmqpError>;

    /// Sends a message. The returned future resolves with its confirmation.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
        mandatory: bool,
    ) -> Result<PendingConfirm, AmqpError>;

    /// Starts a manual-ack consumer on the queue.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError>;

    async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), AmqpError>;

    async fn nack(&self, delivery_tag: u64, multiple: bool, requeue: bool)
        -> Result<(), AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}
