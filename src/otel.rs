// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration
//!
//! Trace context travels with each message inside the AMQP headers: the
//! publisher injects the current context, the consumer extracts it and opens
//! a consumer span around the handler call.

use lapin::{
    protocol::basic::AMQPProperties,
    types::{AMQPValue, FieldTable, ShortString},
};
use opentelemetry::{
    global::{self, BoxedSpan, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{SpanKind, Tracer},
    Context,
};
use std::{borrow::Cow, collections::BTreeMap};
use tracing::warn;

/// Adapter between OpenTelemetry propagators and an AMQP header table.
pub(crate) struct HeaderPropagator<'a> {
    headers: &'a mut BTreeMap<ShortString, AMQPValue>,
}

impl<'a> HeaderPropagator<'a> {
    pub(crate) fn new(headers: &'a mut BTreeMap<ShortString, AMQPValue>) -> Self {
        Self { headers }
    }
}

impl Injector for HeaderPropagator<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.headers.insert(
            key.to_lowercase().into(),
            AMQPValue::LongString(value.into()),
        );
    }
}

impl Extractor for HeaderPropagator<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        let AMQPValue::LongString(value) = self.headers.get(key)? else {
            return None;
        };

        match std::str::from_utf8(value.as_bytes()) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(header = key, error = err.to_string(), "trace header is not utf-8");
                None
            }
        }
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(ShortString::as_str).collect()
    }
}

/// Header table carrying the given context, ready for an outgoing message.
pub(crate) fn inject_headers(ctx: &Context) -> FieldTable {
    let mut headers = BTreeMap::<ShortString, AMQPValue>::default();

    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(ctx, &mut HeaderPropagator::new(&mut headers))
    });

    FieldTable::from(headers)
}

/// Extracts the propagated context from an incoming message and starts a
/// consumer span named after the queue.
pub(crate) fn new_span(
    props: &AMQPProperties,
    tracer: &BoxedTracer,
    name: &str,
) -> (Context, BoxedSpan) {
    let mut headers = props
        .headers()
        .as_ref()
        .map(|table| table.inner().clone())
        .unwrap_or_default();

    let ctx = global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeaderPropagator::new(&mut headers))
    });

    let span = tracer
        .span_builder(Cow::from(name.to_owned()))
        .with_kind(SpanKind::Consumer)
        .start_with_context(tracer, &ctx);

    (ctx, span)
}
