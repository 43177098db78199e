// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Consumer
//!
//! Settles one delivery: the handler runs inside a consumer span, and its
//! outcome decides whether the delivery is acknowledged or negatively
//! acknowledged with requeue. A panicking handler is treated as a failure
//! and additionally reported to the lifecycle observers.

use crate::{
    broker::{AmqpChannel, Delivery, LifecycleEvent},
    connection::Client,
    errors::AmqpError,
    handler::ConsumerHandler,
    otel,
};
use futures_util::FutureExt;
use opentelemetry::{
    global::BoxedTracer,
    trace::{Span, Status},
};
use std::{any::Any, borrow::Cow, panic::AssertUnwindSafe};
use tracing::{debug, error};

/// How a delivery was settled with the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Settlement {
    Acked,
    Requeued,
}

pub(crate) async fn consume(
    tracer: &BoxedTracer,
    delivery: &Delivery,
    queue: &str,
    handler: &dyn ConsumerHandler,
    channel: &dyn AmqpChannel,
    client: &dyn Client,
) -> Result<Settlement, AmqpError> {
    let message_id = delivery.message_id().unwrap_or_default();
    let message_id = message_id.as_str();
    let delivery_tag = delivery.delivery_tag;

    let (ctx, mut span) = otel::new_span(&delivery.properties, tracer, queue);

    debug!(
        queue,
        delivery_tag,
        redelivered = delivery.redelivered,
        "received: {} - exchange: {}",
        message_id,
        delivery.exchange,
    );

    let message = String::from_utf8_lossy(&delivery.data);

    let failure = match AssertUnwindSafe(handler.handle(&ctx, &message))
        .catch_unwind()
        .await
    {
        Ok(Ok(())) => None,
        Ok(Err(err)) => Some(err.to_string()),
        Err(panic) => {
            let reason = panic_reason(panic.as_ref());
            client.notify(LifecycleEvent::CallbackError {
                error: reason.clone(),
            });
            Some(reason)
        }
    };

    let Some(reason) = failure else {
        debug!(message_id, queue, "message successfully processed");
        return match channel.ack(delivery_tag, false).await {
            Ok(()) => {
                span.set_status(Status::Ok);
                Ok(Settlement::Acked)
            }
            Err(err) => {
                error!(
                    error = err.to_string(),
                    message_id, queue, delivery_tag, "error whiling ack msg"
                );
                span.record_error(&err);
                span.set_status(Status::Error {
                    description: Cow::from("error to ack msg"),
                });
                Err(err)
            }
        };
    };

    error!(
        error = reason.as_str(),
        message_id, queue, delivery_tag, "error whiling handling msg, requeuing"
    );
    span.set_status(Status::Error {
        description: Cow::from(reason),
    });

    match channel.nack(delivery_tag, false, true).await {
        Ok(()) => Ok(Settlement::Requeued),
        Err(err) => {
            error!(
                error = err.to_string(),
                message_id, queue, delivery_tag, "error whiling nack msg"
            );
            span.record_error(&err);
            Err(err)
        }
    }
}

fn panic_reason(panic: &(dyn Any + Send)) -> String {
    if let Some(reason) = panic.downcast_ref::<&str>() {
        return format!("handler panicked: {reason}");
    }
    if let Some(reason) = panic.downcast_ref::<String>() {
        return format!("handler panicked: {reason}");
    }
    "handler panicked".to_owned()
}
