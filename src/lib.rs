// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod consumer;
mod otel;

pub mod broker;
pub mod channel;
pub mod configs;
pub mod connection;
pub mod errors;
pub mod exchange;
pub mod handler;
pub mod publisher;
pub mod queue;
pub mod subscriber;
pub mod topology;

#[cfg(test)]
mod testing;
