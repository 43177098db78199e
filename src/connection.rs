// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Lifecycle Management
//!
//! [`ConnectionManager`] owns one broker connection and one cached channel.
//! Both are created lazily on the first [`Client::get_or_create_channel`]
//! call and replaced on demand once the broker reports them closed. Every
//! check-create-cache sequence runs inside a single critical section, so
//! concurrent callers never open duplicate connections or channels.
//!
//! Lifecycle callbacks only log and forward events to observers. Staleness is
//! detected when a caller next asks for a channel, never in background.

use crate::{
    broker::{AmqpChannel, AmqpConnection, AmqpConnector, LifecycleEvent, LifecycleListener},
    channel::LapinConnector,
    configs::ClientConfigs,
    errors::AmqpError,
    topology::TopologyRegistry,
};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Capability shared by publishers and subscribers: access to a usable channel
/// and to the state attached to the owning connection.
#[async_trait]
pub trait Client: Send + Sync {
    /// Returns the cached channel, or a fresh one when it is absent or closed.
    async fn get_or_create_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError>;

    /// Closes the channel and connection. Later channel requests fail with
    /// [`AmqpError::ClientClosedError`].
    async fn dispose(&self);

    fn configs(&self) -> &ClientConfigs;

    fn topology(&self) -> &TopologyRegistry;

    /// Lock publishers hold for a whole publish-and-confirm, when publishes
    /// on the shared channel have to be serialized.
    fn publish_lock(&self) -> Option<&Mutex<()>>;

    /// Raises an event through the registered lifecycle observers.
    fn notify(&self, event: LifecycleEvent);
}

#[derive(Default)]
struct ConnectionState {
    connection: Option<Arc<dyn AmqpConnection>>,
    channel: Option<Arc<dyn AmqpChannel>>,
    disposed: bool,
}

/// Owns the broker connection and the single cached channel handed out to
/// publishers and subscribers. Both are created on first use and recreated
/// once the broker closes them.
pub struct ConnectionManager {
    configs: ClientConfigs,
    client_name: String,
    connector: Arc<dyn AmqpConnector>,
    state: Mutex<ConnectionState>,
    publish_lock: Mutex<()>,
    topology: TopologyRegistry,
    observers: Vec<LifecycleListener>,
}

impl ConnectionManager {
    /// Creates a manager that connects through lapin.
    pub fn new(configs: ClientConfigs) -> ConnectionManager {
        let connector = Arc::new(LapinConnector::new(&configs.rabbitmq));
        ConnectionManager::with_connector(configs, connector)
    }

    /// Creates a manager that opens connections through `connector`.
    ///
    /// # Parameters
    /// * `configs` - Application and broker settings
    /// * `connector` - Opens the broker connections
    ///
    /// # Returns
    /// A manager that has not connected yet
    pub fn with_connector(
        configs: ClientConfigs,
        connector: Arc<dyn AmqpConnector>,
    ) -> ConnectionManager {
        ConnectionManager {
            client_name: configs.client_name(),
            configs,
            connector,
            state: Mutex::new(ConnectionState::default()),
            publish_lock: Mutex::new(()),
            topology: TopologyRegistry::new(),
            observers: vec![],
        }
    }

    /// Registers an observer for connection, channel and consumer events.
    ///
    /// Observers run synchronously on the thread raising the event.
    pub fn with_observer(mut self, observer: LifecycleListener) -> Self {
        self.observers.push(observer);
        self
    }

    /// Connection label reported to the broker.
    pub fn client_name(&self) -> &str {
        &self.client_name
    }

    pub async fn is_disposed(&self) -> bool {
        self.state.lock().await.disposed
    }

    fn listener(&self, source: &'static str) -> LifecycleListener {
        let client_name = self.client_name.clone();
        let observers = self.observers.clone();

        Arc::new(move |event: LifecycleEvent| {
            log_event(&client_name, source, &event);
            for observer in &observers {
                observer(event.clone());
            }
        })
    }

    async fn connect(&self) -> Result<Arc<dyn AmqpConnection>, AmqpError> {
        let cfg = &self.configs.rabbitmq;
        let attempts = cfg.connect_attempts();
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            info!(client = %self.client_name, attempt, "establishing rabbitmq connection...");

            match tokio::time::timeout(
                cfg.connection_timeout(),
                self.connector.connect(&self.client_name),
            )
            .await
            {
                Ok(Ok(connection)) => {
                    connection.on_event(self.listener("connection"));
                    info!(client = %self.client_name, "rabbitmq connection established");
                    return Ok(connection);
                }
                Ok(Err(err)) => last_error = err.to_string(),
                Err(_) => {
                    last_error = format!(
                        "connection timed out after {:?}",
                        cfg.connection_timeout()
                    )
                }
            }

            error!(
                error = last_error.as_str(),
                attempt, attempts, "failure to connect to rabbitmq"
            );

            if attempt < attempts {
                tokio::time::sleep(cfg.network_recovery_interval()).await;
            }
        }

        Err(AmqpError::ChannelUnavailableError(last_error))
    }

    /// Opens a channel in confirm mode. On a recovering manager the recorded
    /// topology is replayed onto it first.
    async fn open_channel(
        &self,
        connection: &dyn AmqpConnection,
        recovering: bool,
    ) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        let mut channel = self.confirmed_channel(connection).await?;

        if recovering && self.configs.rabbitmq.topology_recovery {
            debug!(channel_id = channel.id(), "recovering topology");

            // each failure drops one recorded entity, so this terminates
            while let Err(failure) = self.topology.install(channel.as_ref()).await {
                self.listener("topology")(LifecycleEvent::RecoveryError {
                    entity: failure.entity,
                    error: failure.error.to_string(),
                });

                if !channel.is_open() {
                    channel = self.confirmed_channel(connection).await?;
                }
            }
        }

        info!(
            client = %self.client_name,
            channel_id = channel.id(),
            "rabbitmq channel created"
        );
        Ok(channel)
    }

    async fn confirmed_channel(
        &self,
        connection: &dyn AmqpConnection,
    ) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        let channel = connection.create_channel().await.map_err(|err| {
            error!(error = err.to_string(), "failure to create the channel");
            AmqpError::ChannelUnavailableError(err.to_string())
        })?;

        channel.on_event(self.listener("channel"));

        if let Err(err) = channel.confirm_select().await {
            error!(
                error = err.to_string(),
                channel_id = channel.id(),
                "failure to enable publisher confirms"
            );
            if let Err(close_err) = channel.close().await {
                warn!(error = close_err.to_string(), "failure to close rejected channel");
            }
            return Err(AmqpError::ChannelUnavailableError(err.to_string()));
        }

        Ok(channel)
    }
}

#[async_trait]
impl Client for ConnectionManager {
    async fn get_or_create_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        let mut state = self.state.lock().await;

        if state.disposed {
            return Err(AmqpError::ClientClosedError);
        }

        if let Some(channel) = &state.channel {
            if channel.is_open() {
                return Ok(channel.clone());
            }
            warn!(
                client = %self.client_name,
                channel_id = channel.id(),
                "cached channel is closed, creating a new one"
            );
        }
        let recovering = state.channel.is_some();

        let connection = match &state.connection {
            Some(connection) if connection.is_open() => connection.clone(),
            _ => {
                let connection = self.connect().await?;
                state.connection = Some(connection.clone());
                connection
            }
        };

        let channel = self.open_channel(connection.as_ref(), recovering).await?;
        state.channel = Some(channel.clone());

        Ok(channel)
    }

    async fn dispose(&self) {
        let mut state = self.state.lock().await;
        if state.disposed {
            return;
        }
        state.disposed = true;

        if let Some(channel) = state.channel.take() {
            if channel.is_open() {
                if let Err(err) = channel.close().await {
                    warn!(error = err.to_string(), "failure to close the channel");
                }
            }
        }

        if let Some(connection) = state.connection.take() {
            if connection.is_open() {
                if let Err(err) = connection.close().await {
                    warn!(error = err.to_string(), "failure to close the connection");
                }
            }
        }

        info!(client = %self.client_name, "rabbitmq resources disposed");
    }

    fn configs(&self) -> &ClientConfigs {
        &self.configs
    }

    fn topology(&self) -> &TopologyRegistry {
        &self.topology
    }

    fn publish_lock(&self) -> Option<&Mutex<()>> {
        self.configs
            .rabbitmq
            .serialize_publish
            .then_some(&self.publish_lock)
    }

    fn notify(&self, event: LifecycleEvent) {
        self.listener("consumer")(event);
    }
}

fn log_event(client_name: &str, source: &str, event: &LifecycleEvent) {
    match event {
        LifecycleEvent::Shutdown { reason } => {
            warn!(client = client_name, source, reason = %reason, "rabbitmq shutdown")
        }
        LifecycleEvent::Blocked { reason } => {
            warn!(client = client_name, source, reason = %reason, "rabbitmq connection blocked")
        }
        LifecycleEvent::Unblocked => {
            info!(client = client_name, source, "rabbitmq connection unblocked")
        }
        LifecycleEvent::CallbackError { error } => {
            error!(client = client_name, source, error = %error, "rabbitmq callback exception")
        }
        LifecycleEvent::RecoveryError { entity, error } => {
            error!(
                client = client_name,
                source,
                entity = %entity,
                error = %error,
                "failure to recover topology entity, it is no longer recorded"
            )
        }
    }
}
