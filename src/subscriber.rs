// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Subscriber
//!
//! Binds a durable queue to an exchange and starts a manual-ack consumer with
//! a prefetch of one, so each handler call finishes and is settled before the
//! broker pushes the next delivery.
//!
//! [`Subscriber::subscribe`] returns as soon as the consumer is registered.
//! With `dispatch_consumers_async` the delivery loop is spawned onto the
//! runtime workers. Without it the loop is driven on a dedicated blocking
//! thread, so a handler that blocks never stalls the runtime.

use crate::{
    broker::{AmqpChannel, DeliveryStream},
    connection::Client,
    consumer::consume,
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    handler::ConsumerHandler,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use opentelemetry::global;
use std::sync::Arc;
use tokio::{runtime::Handle, task::JoinHandle};
use tracing::{error, info, warn};
use uuid::Uuid;

const PREFETCH_COUNT: u16 = 1;

#[async_trait]
pub trait Subscriber: Send + Sync {
    /// Declares the queue and exchange, binds them with `routing_key` and
    /// starts delivering messages to `handler`.
    async fn subscribe(
        &self,
        exchange: &str,
        routing_key: &str,
        kind: &ExchangeKind,
        queue: &str,
        handler: Arc<dyn ConsumerHandler>,
    ) -> Result<Subscription, AmqpError>;
}

/// Handle on a registered consumer.
#[derive(Debug)]
pub struct Subscription {
    queue: String,
    consumer_tag: String,
    task: JoinHandle<()>,
}

impl Subscription {
    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    /// Whether the delivery loop is still receiving messages.
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Waits until the delivery loop ends.
    pub async fn closed(self) {
        if let Err(err) = self.task.await {
            error!(
                error = err.to_string(),
                queue = self.queue.as_str(),
                "consumer task aborted"
            );
        }
    }
}

/// [`Subscriber`] that consumes through the channel cached by a [`Client`].
pub struct RabbitMQSubscriber {
    client: Arc<dyn Client>,
}

impl RabbitMQSubscriber {
    /// Creates a subscriber sharing `client` with the rest of the application.
    ///
    /// # Parameters
    /// * `client` - Connection manager that hands out the channel
    ///
    /// # Returns
    /// The subscriber, ready to be shared across tasks
    pub fn new(client: Arc<dyn Client>) -> Arc<RabbitMQSubscriber> {
        Arc::new(RabbitMQSubscriber { client })
    }

    fn setup_failure(&self, err: AmqpError, queue: &str) -> AmqpError {
        error!(error = err.to_string(), queue, "failure to set up the subscription");

        if err.passes_through() {
            return err;
        }

        AmqpError::SubscribeSetupError {
            queue: queue.to_owned(),
            source: Box::new(err),
        }
    }

    async fn install(
        &self,
        channel: &dyn AmqpChannel,
        queue: &QueueDefinition,
        exchange: &ExchangeDefinition,
        binding: &QueueBinding,
    ) -> Result<(), AmqpError> {
        channel.declare_queue(queue).await?;
        channel.set_prefetch(PREFETCH_COUNT).await?;
        channel.declare_exchange(exchange).await?;
        channel.bind_queue(binding).await
    }
}

#[async_trait]
impl Subscriber for RabbitMQSubscriber {
    async fn subscribe(
        &self,
        exchange: &str,
        routing_key: &str,
        kind: &ExchangeKind,
        queue: &str,
        handler: Arc<dyn ConsumerHandler>,
    ) -> Result<Subscription, AmqpError> {
        let channel = self
            .client
            .get_or_create_channel()
            .await
            .map_err(|err| self.setup_failure(err, queue))?;

        let queue_def = QueueDefinition::new(queue).durable();
        let exchange_def = ExchangeDefinition::new(exchange).kind(kind).durable();
        let binding = QueueBinding::new(queue)
            .exchange(exchange)
            .routing_key(routing_key);

        self.install(channel.as_ref(), &queue_def, &exchange_def, &binding)
            .await
            .map_err(|err| self.setup_failure(err, queue))?;

        let consumer_tag = format!("{}-{}", queue, Uuid::new_v4());
        let deliveries = channel
            .consume(queue, &consumer_tag)
            .await
            .map_err(|err| self.setup_failure(err, queue))?;

        let topology = self.client.topology();
        topology.record_exchange(&exchange_def);
        topology.record_queue(&queue_def);
        topology.record_binding(&binding);

        info!(
            queue,
            exchange,
            routing_key,
            consumer_tag = consumer_tag.as_str(),
            "subscription is set up successfully"
        );

        let delivery_loop = run_consumer(
            deliveries,
            queue.to_owned(),
            handler,
            channel,
            self.client.clone(),
        );

        let task = if self.client.configs().rabbitmq.dispatch_consumers_async {
            tokio::spawn(delivery_loop)
        } else {
            let runtime = Handle::current();
            tokio::task::spawn_blocking(move || runtime.block_on(delivery_loop))
        };

        Ok(Subscription {
            queue: queue.to_owned(),
            consumer_tag,
            task,
        })
    }
}

/// Settles deliveries one at a time on the channel they arrived on.
async fn run_consumer(
    mut deliveries: DeliveryStream,
    queue: String,
    handler: Arc<dyn ConsumerHandler>,
    channel: Arc<dyn AmqpChannel>,
    client: Arc<dyn Client>,
) {
    let tracer = global::tracer("amqp consumer");

    while let Some(result) = deliveries.next().await {
        match result {
            Ok(delivery) => {
                if let Err(err) = consume(
                    &tracer,
                    &delivery,
                    &queue,
                    handler.as_ref(),
                    channel.as_ref(),
                    client.as_ref(),
                )
                .await
                {
                    error!(error = err.to_string(), queue = queue.as_str(), "error consume msg");
                }
            }

            Err(err) => {
                error!(error = err.to_string(), queue = queue.as_str(), "errors consume msg")
            }
        }
    }

    warn!(queue = queue.as_str(), "consumer stream ended, no more deliveries will be handled");
}
