// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Recovery
//!
//! Publishers and subscribers record every exchange, queue and binding they
//! successfully declare. When the connection manager replaces a closed
//! channel and topology recovery is enabled, the recorded topology is
//! installed again on the fresh channel, in declaration order: exchanges,
//! then queues, then bindings. An entity the broker rejects during a replay
//! is dropped from the record and replay carries on with the rest.

use crate::{
    broker::AmqpChannel,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopologySnapshot {
    pub exchanges: Vec<ExchangeDefinition>,
    pub queues: Vec<QueueDefinition>,
    pub bindings: Vec<QueueBinding>,
}

impl TopologySnapshot {
    pub fn is_empty(&self) -> bool {
        self.exchanges.is_empty() && self.queues.is_empty() && self.bindings.is_empty()
    }
}

/// Thread-safe record of the broker topology declared through one client.
#[derive(Debug, Default)]
pub struct TopologyRegistry {
    declared: Mutex<TopologySnapshot>,
}

impl TopologyRegistry {
    pub fn new() -> TopologyRegistry {
        TopologyRegistry::default()
    }

    fn lock(&self) -> MutexGuard<'_, TopologySnapshot> {
        // every mutation leaves the snapshot valid, so poisoning is ignored
        self.declared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records an exchange. A redeclaration with the same name replaces the
    /// previous definition.
    pub fn record_exchange(&self, def: &ExchangeDefinition) {
        let mut declared = self.lock();
        declared.exchanges.retain(|e| e.name != def.name);
        declared.exchanges.push(def.clone());
    }

    pub fn record_queue(&self, def: &QueueDefinition) {
        let mut declared = self.lock();
        declared.queues.retain(|q| q.name != def.name);
        declared.queues.push(def.clone());
    }

    pub fn record_binding(&self, binding: &QueueBinding) {
        let mut declared = self.lock();
        if !declared.bindings.contains(binding) {
            declared.bindings.push(binding.clone());
        }
    }

    pub fn snapshot(&self) -> TopologySnapshot {
        self.lock().clone()
    }

    /// Declares every recorded entity on the given channel.
    ///
    /// Stops at the first rejected declaration. The rejected entity is
    /// forgotten, so a later replay no longer trips over it.
    pub async fn install(&self, channel: &dyn AmqpChannel) -> Result<(), ReplayFailure> {
        let snapshot = self.snapshot();
        if snapshot.is_empty() {
            return Ok(());
        }

        for exchange in &snapshot.exchanges {
            if let Err(error) = channel.declare_exchange(exchange).await {
                self.lock().exchanges.retain(|e| e.name != exchange.name);
                return Err(ReplayFailure::new(format!("exchange {}", exchange.name), error));
            }
        }

        for queue in &snapshot.queues {
            if let Err(error) = channel.declare_queue(queue).await {
                self.lock().queues.retain(|q| q.name != queue.name);
                return Err(ReplayFailure::new(format!("queue {}", queue.name), error));
            }
        }

        for binding in &snapshot.bindings {
            if let Err(error) = channel.bind_queue(binding).await {
                self.lock().bindings.retain(|b| b != binding);
                return Err(ReplayFailure::new(
                    format!(
                        "binding {} to {} with {}",
                        binding.queue_name, binding.exchange_name, binding.routing_key
                    ),
                    error,
                ));
            }
        }

        debug!(
            exchanges = snapshot.exchanges.len(),
            queues = snapshot.queues.len(),
            bindings = snapshot.bindings.len(),
            "topology recovered"
        );

        Ok(())
    }
}

/// A recorded entity the broker refused to declare again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayFailure {
    pub entity: String,
    pub error: AmqpError,
}

impl ReplayFailure {
    fn new(entity: String, error: AmqpError) -> ReplayFailure {
        ReplayFailure { entity, error }
    }
}
