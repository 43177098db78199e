// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! Confirmed publishing: every message is declared against a durable exchange,
//! sent as a persistent JSON message and then awaited until the broker
//! confirms it or the confirm timeout elapses. The caller gets the generated
//! message id back so it can correlate logs and retries.

use crate::{
    broker::Confirmation,
    connection::Client,
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    otel,
};
use async_trait::async_trait;
use lapin::{types::ShortString, BasicProperties};
use opentelemetry::Context;
use std::sync::Arc;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

const PERSISTENT_DELIVERY_MODE: u8 = 2;

const NOT_IN_CONFIRM_MODE: &str = "channel not in confirm mode";

#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publishes `payload` and waits for the broker confirmation.
    ///
    /// Returns the message id assigned to the message. A message whose
    /// confirmation does not arrive in time fails with
    /// [`AmqpError::PublishUnconfirmedError`]; it is not retried, since the
    /// broker may still have routed it.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        kind: &ExchangeKind,
        payload: &[u8],
    ) -> Result<String, AmqpError>;
}

/// [`Publisher`] that sends through the channel cached by a [`Client`].
pub struct RabbitMQPublisher {
    client: Arc<dyn Client>,
}

impl RabbitMQPublisher {
    /// Creates a new RabbitMQ publisher.
    ///
    /// # Parameters
    /// * `client` - Connection manager that hands out the confirm-mode channel
    ///
    /// # Returns
    /// A new `RabbitMQPublisher` wrapped in an `Arc`
    pub fn new(client: Arc<dyn Client>) -> Arc<RabbitMQPublisher> {
        Arc::new(RabbitMQPublisher { client })
    }

    fn failure(
        &self,
        err: AmqpError,
        exchange: &str,
        routing_key: &str,
        message_id: &str,
    ) -> AmqpError {
        error!(
            error = err.to_string(),
            exchange, routing_key, message_id, "error publishing message"
        );

        if err.passes_through() {
            return err;
        }

        AmqpError::PublishError {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            source: Box::new(err),
        }
    }
}

#[async_trait]
impl Publisher for RabbitMQPublisher {
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        kind: &ExchangeKind,
        payload: &[u8],
    ) -> Result<String, AmqpError> {
        let message_id = Uuid::new_v4().to_string();

        let _serialized = match self.client.publish_lock() {
            Some(lock) => Some(lock.lock().await),
            None => None,
        };

        let channel = match self.client.get_or_create_channel().await {
            Ok(channel) => channel,
            Err(AmqpError::ClientClosedError) => {
                error!(exchange, routing_key, "publish on a disposed client");
                return Err(AmqpError::ClientClosedError);
            }
            Err(err) => {
                error!(error = err.to_string(), exchange, "no channel available to publish");
                return Err(match err {
                    AmqpError::ChannelUnavailableError(_) => err,
                    other => AmqpError::ChannelUnavailableError(other.to_string()),
                });
            }
        };

        let def = ExchangeDefinition::new(exchange).kind(kind).durable();
        channel
            .declare_exchange(&def)
            .await
            .map_err(|err| self.failure(err, exchange, routing_key, &message_id))?;

        let properties = BasicProperties::default()
            .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
            .with_delivery_mode(PERSISTENT_DELIVERY_MODE)
            .with_priority(0)
            .with_message_id(ShortString::from(message_id.clone()))
            .with_headers(otel::inject_headers(&Context::current()));

        let pending = channel
            .publish(exchange, routing_key, payload, properties, false)
            .await
            .map_err(|err| self.failure(err, exchange, routing_key, &message_id))?;

        let timeout = self.client.configs().rabbitmq.confirm_timeout();
        match tokio::time::timeout(timeout, pending).await {
            Err(_) => {
                error!(
                    message_id = message_id.as_str(),
                    exchange,
                    routing_key,
                    timeout_ms = timeout.as_millis() as u64,
                    "publish was not confirmed in time"
                );
                Err(AmqpError::PublishUnconfirmedError { message_id, timeout })
            }
            Ok(Err(err)) => Err(self.failure(err, exchange, routing_key, &message_id)),
            Ok(Ok(Confirmation::Nack)) => Err(self.failure(
                AmqpError::PublishRejectedError(message_id.clone()),
                exchange,
                routing_key,
                &message_id,
            )),
            Ok(Ok(Confirmation::NotRequested)) => {
                warn!(message_id = message_id.as_str(), exchange, "channel is not in confirm mode");
                Err(self.failure(
                    AmqpError::ConfirmationError(NOT_IN_CONFIRM_MODE.to_owned()),
                    exchange,
                    routing_key,
                    &message_id,
                ))
            }
            Ok(Ok(Confirmation::Ack)) => {
                debug!(
                    message_id = message_id.as_str(),
                    exchange,
                    routing_key,
                    "message published and confirmed"
                );
                self.client.topology().record_exchange(&def);
                Ok(message_id)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        broker::MockAmqpChannel,
        testing::{
            confirm_after, confirmed, manager_with, never_confirmed, open_channel, test_configs,
        },
    };
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Mutex,
        },
        time::Duration,
    };
    use tokio::time::Instant;

    fn declaring_channel() -> MockAmqpChannel {
        let mut channel = open_channel(1);
        channel.expect_declare_exchange().returning(|_| Ok(()));
        channel
    }

    #[tokio::test]
    async fn sends_a_persistent_json_message_with_a_fresh_id() {
        let sent = Arc::new(Mutex::new(Vec::<(String, BasicProperties, bool)>::new()));
        let mut channel = open_channel(1);
        channel
            .expect_declare_exchange()
            .withf(|def| {
                def.name() == "orders"
                    && def.is_durable()
                    && def.exchange_kind() == &ExchangeKind::Topic
            })
            .times(2)
            .returning(|_| Ok(()));
        let sink = sent.clone();
        channel
            .expect_publish()
            .times(2)
            .returning(move |_, routing_key, _, properties, mandatory| {
                sink.lock()
                    .unwrap()
                    .push((routing_key.to_owned(), properties, mandatory));
                Ok(confirmed())
            });

        let client = manager_with(channel, test_configs());
        let publisher = RabbitMQPublisher::new(client.clone());

        let first = publisher
            .publish("orders", "orders.created", &ExchangeKind::Topic, br#"{"id":1}"#)
            .await
            .unwrap();
        let second = publisher
            .publish("orders", "orders.created", &ExchangeKind::Topic, br#"{"id":2}"#)
            .await
            .unwrap();
        assert_ne!(first, second);

        let sent = sent.lock().unwrap();
        let (routing_key, properties, mandatory) = &sent[0];
        assert_eq!(routing_key, "orders.created");
        assert!(!mandatory);
        assert_eq!(properties.delivery_mode(), &Some(2));
        assert_eq!(properties.priority(), &Some(0));
        assert_eq!(
            properties.content_type().as_ref().map(|c| c.as_str()),
            Some(JSON_CONTENT_TYPE)
        );
        assert_eq!(
            properties.message_id().as_ref().map(|id| id.to_string()),
            Some(first)
        );

        assert_eq!(client.topology().snapshot().exchanges.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unconfirmed_publish_times_out_without_retry() {
        let mut channel = declaring_channel();
        channel
            .expect_publish()
            .times(1)
            .returning(|_, _, _, _, _| Ok(never_confirmed()));

        let publisher = RabbitMQPublisher::new(manager_with(channel, test_configs()));
        let started = Instant::now();

        let err = publisher
            .publish("orders", "orders.created", &ExchangeKind::Topic, b"{}")
            .await
            .unwrap_err();

        assert!(started.elapsed() >= Duration::from_millis(250));
        match err {
            AmqpError::PublishUnconfirmedError { message_id, timeout } => {
                assert!(!message_id.is_empty());
                assert_eq!(timeout, Duration::from_millis(250));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn conflicting_exchange_is_reported_before_sending() {
        let mut channel = open_channel(1);
        channel
            .expect_declare_exchange()
            .returning(|def| Err(AmqpError::TopologyConflictError(def.name().to_owned())));
        channel.expect_publish().never();

        let client = manager_with(channel, test_configs());
        let publisher = RabbitMQPublisher::new(client.clone());

        let err = publisher
            .publish("orders", "orders.created", &ExchangeKind::Fanout, b"{}")
            .await
            .unwrap_err();

        assert_eq!(err, AmqpError::TopologyConflictError("orders".to_owned()));
        assert!(client.topology().snapshot().is_empty());
    }

    #[tokio::test]
    async fn transport_failure_is_wrapped_with_the_destination() {
        let mut channel = declaring_channel();
        channel
            .expect_publish()
            .returning(|_, _, _, _, _| Err(AmqpError::PublishingError("frame too large".to_owned())));

        let publisher = RabbitMQPublisher::new(manager_with(channel, test_configs()));
        let err = publisher
            .publish("orders", "orders.created", &ExchangeKind::Topic, b"{}")
            .await
            .unwrap_err();

        assert_eq!(
            err,
            AmqpError::PublishError {
                exchange: "orders".to_owned(),
                routing_key: "orders.created".to_owned(),
                source: Box::new(AmqpError::PublishingError("frame too large".to_owned())),
            }
        );
    }

    #[tokio::test]
    async fn broker_nack_is_a_rejected_publish() {
        let mut channel = declaring_channel();
        channel
            .expect_publish()
            .returning(|_, _, _, _, _| Ok(confirm_after(Duration::ZERO, Confirmation::Nack)));

        let publisher = RabbitMQPublisher::new(manager_with(channel, test_configs()));
        let err = publisher
            .publish("orders", "orders.created", &ExchangeKind::Topic, b"{}")
            .await
            .unwrap_err();

        match err {
            AmqpError::PublishError { source, .. } => {
                assert!(matches!(*source, AmqpError::PublishRejectedError(_)))
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_confirm_mode_is_a_failed_publish() {
        let mut channel = declaring_channel();
        channel.expect_publish().returning(|_, _, _, _, _| {
            Ok(confirm_after(Duration::ZERO, Confirmation::NotRequested))
        });

        let client = manager_with(channel, test_configs());
        let err = RabbitMQPublisher::new(client.clone())
            .publish("orders", "orders.created", &ExchangeKind::Topic, b"{}")
            .await
            .unwrap_err();

        assert_eq!(
            err,
            AmqpError::PublishError {
                exchange: "orders".to_owned(),
                routing_key: "orders.created".to_owned(),
                source: Box::new(AmqpError::ConfirmationError(
                    "channel not in confirm mode".to_owned()
                )),
            }
        );
        assert!(client.topology().snapshot().is_empty());
    }

    #[tokio::test]
    async fn disposed_client_refuses_to_publish() {
        let channel = open_channel(1);
        let client = manager_with(channel, test_configs());
        client.dispose().await;

        let err = RabbitMQPublisher::new(client)
            .publish("orders", "orders.created", &ExchangeKind::Topic, b"{}")
            .await
            .unwrap_err();

        assert_eq!(err, AmqpError::ClientClosedError);
    }

    async fn max_publishes_in_flight(serialize_publish: bool) -> usize {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_in_flight = Arc::new(AtomicUsize::new(0));

        let mut channel = declaring_channel();
        let (current, max) = (in_flight.clone(), max_in_flight.clone());
        channel.expect_publish().returning(move |_, _, _, _, _| {
            let now = current.fetch_add(1, Ordering::SeqCst) + 1;
            max.fetch_max(now, Ordering::SeqCst);
            let current = current.clone();
            let confirm = confirm_after(Duration::from_millis(100), Confirmation::Ack);
            Ok(Box::pin(async move {
                let confirmation = confirm.await;
                current.fetch_sub(1, Ordering::SeqCst);
                confirmation
            }) as crate::broker::PendingConfirm)
        });

        let mut configs = test_configs();
        configs.rabbitmq.serialize_publish = serialize_publish;
        let publisher = RabbitMQPublisher::new(manager_with(channel, configs));

        let (first, second) = tokio::join!(
            publisher.publish("orders", "orders.created", &ExchangeKind::Topic, b"1"),
            publisher.publish("orders", "orders.created", &ExchangeKind::Topic, b"2"),
        );
        first.unwrap();
        second.unwrap();

        max_in_flight.load(Ordering::SeqCst)
    }

    #[tokio::test(start_paused = true)]
    async fn serialized_publishes_never_overlap() {
        assert_eq!(max_publishes_in_flight(true).await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unserialized_publishes_share_the_channel() {
        assert_eq!(max_publishes_in_flight(false).await, 2);
    }
}
