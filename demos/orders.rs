// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Binds a durable queue, then publishes one order and consumes it back.
//!
//! Needs a broker on `RABBITMQ_HOST`/`RABBITMQ_PORT` (defaults to
//! localhost:5672). Run with `RUST_LOG=debug cargo run --example orders`.

use async_trait::async_trait;
use opentelemetry::Context;
use rabbitmq_client::{
    configs::ClientConfigs,
    connection::{Client, ConnectionManager},
    exchange::ExchangeKind,
    handler::{ConsumerHandler, HandlerError},
    publisher::{Publisher, RabbitMQPublisher},
    subscriber::{RabbitMQSubscriber, Subscriber},
};
use serde::{Deserialize, Serialize};
use std::{error::Error, sync::Arc};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Serialize, Deserialize)]
struct OrderCreated {
    id: u64,
    customer: String,
}

struct OrderHandler;

#[async_trait]
impl ConsumerHandler for OrderHandler {
    async fn handle(&self, _ctx: &Context, message: &str) -> Result<(), HandlerError> {
        let order: OrderCreated =
            serde_json::from_str(message).map_err(|err| HandlerError::new(err.to_string()))?;
        info!(order_id = order.id, customer = order.customer.as_str(), "order received");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let configs = ClientConfigs::default().with_overrides(|key| std::env::var(key).ok())?;

    let client = Arc::new(ConnectionManager::new(configs));
    let publisher = RabbitMQPublisher::new(client.clone());
    let subscriber = RabbitMQSubscriber::new(client.clone());

    let order = OrderCreated {
        id: 1,
        customer: "ada".to_owned(),
    };
    let payload = serde_json::to_vec(&order)?;

    let subscription = subscriber
        .subscribe(
            "orders",
            "orders.created",
            &ExchangeKind::Topic,
            "orders.created.q",
            Arc::new(OrderHandler),
        )
        .await?;

    let message_id = publisher
        .publish("orders", "orders.created", &ExchangeKind::Topic, &payload)
        .await?;
    info!(message_id = message_id.as_str(), "order published");

    tokio::select! {
        _ = subscription.closed() => {}
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
    }

    client.dispose().await;
    Ok(())
}
