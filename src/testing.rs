// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Mock builders shared by the unit tests.

use crate::{
    broker::{
        AmqpChannel, AmqpConnection, Confirmation, Delivery, DeliveryStream, MockAmqpChannel,
        MockAmqpConnection, MockAmqpConnector, PendingConfirm,
    },
    configs::{AppConfigs, ClientConfigs},
    connection::ConnectionManager,
    errors::AmqpError,
    handler::{ConsumerHandler, HandlerError},
};
use async_trait::async_trait;
use futures_util::{future, stream, StreamExt};
use lapin::{types::ShortString, BasicProperties};
use opentelemetry::Context;
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

pub(crate) fn test_configs() -> ClientConfigs {
    let mut configs = ClientConfigs {
        app: AppConfigs {
            name: "orders-service".to_owned(),
            host: "test-host".to_owned(),
        },
        ..ClientConfigs::default()
    };
    configs.rabbitmq.dispatch_consumers_async = false;
    configs
}

/// An open channel that accepts confirm mode, listeners and close.
pub(crate) fn open_channel(id: u16) -> MockAmqpChannel {
    let mut channel = MockAmqpChannel::new();
    channel.expect_id().return_const(id);
    channel.expect_is_open().return_const(true);
    channel.expect_on_event().returning(|_| ());
    channel.expect_confirm_select().returning(|| Ok(()));
    channel.expect_close().returning(|| Ok(()));
    channel
}

/// An open connection handing out the given channels in order.
pub(crate) fn connection_with(channels: Vec<MockAmqpChannel>) -> MockAmqpConnection {
    let mut channels: VecDeque<Arc<dyn AmqpChannel>> = channels
        .into_iter()
        .map(|c| Arc::new(c) as Arc<dyn AmqpChannel>)
        .collect();

    let mut connection = MockAmqpConnection::new();
    connection.expect_is_open().return_const(true);
    connection.expect_on_event().returning(|_| ());
    connection.expect_close().returning(|| Ok(()));
    connection
        .expect_create_channel()
        .returning(move || channels.pop_front().ok_or(AmqpError::InternalError));
    connection
}

pub(crate) fn connector_with(connection: MockAmqpConnection) -> MockAmqpConnector {
    let connection: Arc<dyn AmqpConnection> = Arc::new(connection);
    let mut connector = MockAmqpConnector::new();
    connector
        .expect_connect()
        .returning(move |_| Ok(connection.clone()));
    connector
}

/// A manager whose first channel is the given mock.
pub(crate) fn manager_with(channel: MockAmqpChannel, configs: ClientConfigs) -> Arc<ConnectionManager> {
    Arc::new(ConnectionManager::with_connector(
        configs,
        Arc::new(connector_with(connection_with(vec![channel]))),
    ))
}

pub(crate) fn confirmed() -> PendingConfirm {
    Box::pin(future::ready(Ok(Confirmation::Ack)))
}

pub(crate) fn never_confirmed() -> PendingConfirm {
    Box::pin(future::pending())
}

pub(crate) fn confirm_after(delay: Duration, confirmation: Confirmation) -> PendingConfirm {
    Box::pin(async move {
        tokio::time::sleep(delay).await;
        Ok(confirmation)
    })
}

pub(crate) fn delivery(tag: u64, body: &str) -> Delivery {
    Delivery {
        delivery_tag: tag,
        exchange: "orders".to_owned(),
        routing_key: "orders.created".to_owned(),
        properties: BasicProperties::default()
            .with_message_id(ShortString::from(format!("msg-{tag}"))),
        data: body.as_bytes().to_vec(),
        ..Delivery::default()
    }
}

pub(crate) fn deliveries(items: Vec<Delivery>) -> DeliveryStream {
    stream::iter(items.into_iter().map(Ok)).boxed()
}

/// Shared, ordered record of what handlers and channels did.
#[derive(Clone, Default)]
pub(crate) struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub(crate) fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub(crate) fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

/// Handler that records every message and fails the ones containing
/// `fail_marker`.
pub(crate) struct RecordingHandler {
    pub(crate) log: EventLog,
    pub(crate) fail_marker: Option<&'static str>,
    pub(crate) panic_marker: Option<&'static str>,
    in_flight: AtomicUsize,
    pub(crate) max_in_flight: AtomicUsize,
}

impl RecordingHandler {
    pub(crate) fn new(log: EventLog) -> RecordingHandler {
        RecordingHandler {
            log,
            fail_marker: None,
            panic_marker: None,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub(crate) fn failing_on(mut self, marker: &'static str) -> RecordingHandler {
        self.fail_marker = Some(marker);
        self
    }

    pub(crate) fn panicking_on(mut self, marker: &'static str) -> RecordingHandler {
        self.panic_marker = Some(marker);
        self
    }
}

#[async_trait]
impl ConsumerHandler for RecordingHandler {
    async fn handle(&self, _ctx: &Context, message: &str) -> Result<(), HandlerError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.log.push(format!("handle {message}"));

        tokio::task::yield_now().await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.panic_marker.is_some_and(|marker| message.contains(marker)) {
            panic!("handler blew up on {message}");
        }
        if self.fail_marker.is_some_and(|marker| message.contains(marker)) {
            return Err(HandlerError::new(format!("cannot process {message}")));
        }
        Ok(())
    }
}

/// Records acks and nacks into the log.
pub(crate) fn settling_channel(id: u16, log: &EventLog) -> MockAmqpChannel {
    let mut channel = open_channel(id);
    let acks = log.clone();
    channel.expect_ack().returning(move |tag, multiple| {
        acks.push(format!("ack {tag} multiple={multiple}"));
        Ok(())
    });
    let nacks = log.clone();
    channel
        .expect_nack()
        .returning(move |tag, multiple, requeue| {
            nacks.push(format!("nack {tag} multiple={multiple} requeue={requeue}"));
            Ok(())
        });
    channel
}
