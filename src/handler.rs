// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use async_trait::async_trait;
use opentelemetry::Context;
use thiserror::Error;

/// Reason a handler could not process a message. The delivery is requeued.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(reason: impl Into<String>) -> HandlerError {
        HandlerError(reason.into())
    }
}

/// Application callback invoked once per delivery with the UTF-8 body.
///
/// `Ok` acknowledges the delivery; `Err` negatively acknowledges it with
/// requeue, so the broker will deliver it again. A handler that keeps failing
/// for a message sees that message forever.
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    async fn handle(&self, ctx: &Context, message: &str) -> Result<(), HandlerError>;
}
