// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

/// Queue declared by a subscriber.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) exclusive: bool,
    pub(crate) auto_delete: bool,
}

impl QueueDefinition {
    /// Transient, shared queue named `name`.
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            ..QueueDefinition::default()
        }
    }

    /// Keeps the queue across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Restricts the queue to the declaring connection; the broker drops it
    /// when that connection closes.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Deletes the queue once its last consumer goes away.
    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    /// Gets the queue name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Checks whether the queue survives broker restarts.
    pub fn is_durable(&self) -> bool {
        self.durable
    }
}

/// Routes messages published to `exchange_name` with `routing_key` into
/// `queue_name`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueBinding {
    pub(crate) queue_name: String,
    pub(crate) exchange_name: String,
    pub(crate) routing_key: String,
}

impl QueueBinding {
    /// Creates a binding for `queue`, with no exchange and an empty key yet.
    ///
    /// # Parameters
    /// * `queue` - Name of the bound queue
    ///
    /// # Returns
    /// A binding to complete with [`QueueBinding::exchange`] and
    /// [`QueueBinding::routing_key`]
    pub fn new(queue: &str) -> QueueBinding {
        QueueBinding {
            queue_name: queue.to_owned(),
            ..QueueBinding::default()
        }
    }

    /// Sets the source exchange.
    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange_name = exchange.to_owned();
        self
    }

    /// Sets the routing key matched against published messages.
    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }

    /// Gets the bound queue name.
    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Gets the source exchange name.
    pub fn exchange_name(&self) -> &str {
        &self.exchange_name
    }

    /// Gets the routing key.
    pub fn key(&self) -> &str {
        &self.routing_key
    }
}
