// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection and Channel Adapter
//!
//! lapin-backed implementation of the broker capabilities. This is the only
//! module that talks to lapin directly; errors are classified into
//! [`AmqpError`] variants and logged here.
//!
//! lapin owns the socket, so the configured socket timeouts bound the
//! operations that wait on it: the read timeout bounds channel creation, the
//! write timeout bounds handing a message to the connection.

use crate::{
    broker::{
        AmqpChannel, AmqpConnection, AmqpConnector, Confirmation, Delivery, DeliveryStream,
        LifecycleEvent, LifecycleListener, PendingConfirm,
    },
    configs::RabbitMQConfigs,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    protocol::{AMQPErrorKind, AMQPSoftError},
    publisher_confirm::Confirmation as LapinConfirmation,
    types::{FieldTable, LongString},
    uri::AMQPUri,
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::{sync::Arc, time::Duration};
use tracing::{debug, error};

/// Reply code sent with client-initiated closes.
const REPLY_SUCCESS: u16 = 200;

/// Opens lapin connections to the configured broker.
pub struct LapinConnector {
    uri: AMQPUri,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl LapinConnector {
    pub fn new(cfg: &RabbitMQConfigs) -> LapinConnector {
        LapinConnector {
            uri: cfg.amqp_uri(),
            read_timeout: cfg.socket_read_timeout(),
            write_timeout: cfg.socket_write_timeout(),
        }
    }
}

#[async_trait]
impl AmqpConnector for LapinConnector {
    async fn connect(&self, client_name: &str) -> Result<Arc<dyn AmqpConnection>, AmqpError> {
        debug!("creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(client_name.to_owned()));

        let conn = match Connection::connect_uri(self.uri.clone(), options).await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionError(err.to_string()))
            }
        }?;
        debug!("amqp connected");

        Ok(Arc::new(LapinConnection {
            inner: conn,
            read_timeout: self.read_timeout,
            write_timeout: self.write_timeout,
        }))
    }
}

pub struct LapinConnection {
    inner: Connection,
    read_timeout: Duration,
    write_timeout: Duration,
}

#[async_trait]
impl AmqpConnection for LapinConnection {
    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    fn on_event(&self, listener: LifecycleListener) {
        self.inner.on_error(move |err| {
            listener(LifecycleEvent::Shutdown {
                reason: err.to_string(),
            })
        });
    }

    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        debug!("creating amqp channel...");
        let channel = match tokio::time::timeout(self.read_timeout, self.inner.create_channel())
            .await
        {
            Ok(Ok(c)) => Ok(c),
            Ok(Err(err)) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError(err.to_string()))
            }
            Err(_) => {
                error!(timeout = ?self.read_timeout, "timed out creating the channel");
                Err(AmqpError::ChannelError("channel open timed out".to_owned()))
            }
        }?;
        debug!(channel_id = channel.id(), "channel created");

        Ok(Arc::new(LapinChannel {
            inner: channel,
            write_timeout: self.write_timeout,
        }))
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.inner
            .close(REPLY_SUCCESS, "client disposed")
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to close the connection");
                AmqpError::ConnectionError(err.to_string())
            })
    }
}

pub struct LapinChannel {
    inner: Channel,
    write_timeout: Duration,
}

#[async_trait]
impl AmqpChannel for LapinChannel {
    fn id(&self) -> u16 {
        self.inner.id()
    }

    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    fn on_event(&self, listener: LifecycleListener) {
        self.inner.on_error(move |err| {
            listener(LifecycleEvent::Shutdown {
                reason: err.to_string(),
            })
        });
    }

    async fn confirm_select(&self) -> Result<(), AmqpError> {
        self.inner
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to enable publisher confirms");
                AmqpError::ChannelError(err.to_string())
            })
    }

    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        debug!("creating exchange: {}", def.name);

        match self
            .inner
            .exchange_declare(
                &def.name,
                (&def.kind).into(),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    auto_delete: def.auto_delete,
                    internal: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = def.name.as_str(),
                    "error to declare the exchange"
                );
                Err(declare_error(&err, &def.name, AmqpError::DeclareExchangeError))
            }
            _ => {
                debug!("exchange: {} was created", def.name);
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        debug!("creating queue: {}", def.name);

        match self
            .inner
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.auto_delete,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = def.name.as_str(),
                    "error to declare the queue"
                );
                Err(declare_error(&err, &def.name, AmqpError::DeclareQueueError))
            }
            _ => {
                debug!("queue: {} was created", def.name);
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            binding.queue_name, binding.exchange_name, binding.routing_key
        );

        self.inner
            .queue_bind(
                &binding.queue_name,
                &binding.exchange_name,
                &binding.routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to bind queue to exchange");
                AmqpError::BindingExchangeToQueueError(
                    binding.exchange_name.clone(),
                    binding.queue_name.clone(),
                )
            })
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), AmqpError> {
        self.inner
            .basic_qos(count, BasicQosOptions { global: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), count, "error to configure qos");
                AmqpError::QoSDeclarationError(err.to_string())
            })
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
        mandatory: bool,
    ) -> Result<PendingConfirm, AmqpError> {
        let sent = self.inner.basic_publish(
            exchange,
            routing_key,
            BasicPublishOptions {
                mandatory,
                immediate: false,
            },
            payload,
            properties,
        );

        let confirm = match tokio::time::timeout(self.write_timeout, sent).await {
            Ok(Ok(confirm)) => Ok(confirm),
            Ok(Err(err)) => {
                error!(error = err.to_string(), "error publishing message");
                Err(AmqpError::PublishingError(err.to_string()))
            }
            Err(_) => {
                error!(timeout = ?self.write_timeout, "timed out publishing message");
                Err(AmqpError::PublishingError("write timed out".to_owned()))
            }
        }?;

        Ok(Box::pin(async move {
            match confirm.await {
                Ok(LapinConfirmation::Ack(_)) => Ok(Confirmation::Ack),
                Ok(LapinConfirmation::Nack(_)) => Ok(Confirmation::Nack),
                Ok(LapinConfirmation::NotRequested) => Ok(Confirmation::NotRequested),
                Err(err) => Err(AmqpError::ConfirmationError(err.to_string())),
            }
        }))
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        let consumer = self
            .inner
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to create the consumer");
                AmqpError::ConsumerDeclarationError(queue.to_owned())
            })?;

        Ok(consumer
            .map(|result| match result {
                Ok(delivery) => Ok(Delivery::from(delivery)),
                Err(err) => Err(AmqpError::ConsumerError(err.to_string())),
            })
            .boxed())
    }

    async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), AmqpError> {
        self.inner
            .basic_ack(delivery_tag, BasicAckOptions { multiple })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), delivery_tag, "error whiling ack msg");
                AmqpError::AckMessageError(delivery_tag)
            })
    }

    async fn nack(
        &self,
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    ) -> Result<(), AmqpError> {
        self.inner
            .basic_nack(delivery_tag, BasicNackOptions { multiple, requeue })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), delivery_tag, "error whiling nack msg");
                AmqpError::NackMessageError(delivery_tag)
            })
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.inner
            .close(REPLY_SUCCESS, "client disposed")
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to close the channel");
                AmqpError::ChannelError(err.to_string())
            })
    }
}

impl From<lapin::message::Delivery> for Delivery {
    fn from(delivery: lapin::message::Delivery) -> Delivery {
        Delivery {
            delivery_tag: delivery.delivery_tag,
            exchange: delivery.exchange.to_string(),
            routing_key: delivery.routing_key.to_string(),
            redelivered: delivery.redelivered,
            properties: delivery.properties,
            data: delivery.data,
        }
    }
}

/// A `PRECONDITION_FAILED` reply means the broker already holds a different
/// definition under that name.
fn declare_error(err: &lapin::Error, name: &str, fallback: fn(String) -> AmqpError) -> AmqpError {
    if let lapin::Error::ProtocolError(amqp) = err {
        if let AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED) = amqp.kind() {
            return AmqpError::TopologyConflictError(name.to_owned());
        }
    }

    fallback(name.to_owned())
}
