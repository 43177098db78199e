// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Exchange types and the definitions used to declare them.

use crate::errors::AmqpError;
use std::{fmt, str::FromStr};

/// Routing algorithm of an exchange. `Topic` matches dot-separated routing
/// keys against `*` and `#` patterns; `Headers` ignores the routing key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Headers => "headers",
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExchangeKind {
    type Err = AmqpError;

    fn from_str(value: &str) -> Result<ExchangeKind, AmqpError> {
        match value.to_ascii_lowercase().as_str() {
            "direct" => Ok(ExchangeKind::Direct),
            "fanout" => Ok(ExchangeKind::Fanout),
            "topic" => Ok(ExchangeKind::Topic),
            "headers" => Ok(ExchangeKind::Headers),
            other => Err(AmqpError::ConfigError(format!(
                "unsupported exchange type `{other}`"
            ))),
        }
    }
}

impl From<&ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: &ExchangeKind) -> lapin::ExchangeKind {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        }
    }
}

/// Exchange declared by publishers and subscribers. Declarations are never
/// passive: a missing exchange is created, a mismatching one is a conflict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeDefinition {
    pub(crate) name: String,
    pub(crate) kind: ExchangeKind,
    pub(crate) durable: bool,
    pub(crate) auto_delete: bool,
}

impl ExchangeDefinition {
    /// Transient direct exchange named `name`.
    pub fn new(name: &str) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.to_owned(),
            kind: ExchangeKind::default(),
            durable: false,
            auto_delete: false,
        }
    }

    pub fn kind(mut self, kind: &ExchangeKind) -> Self {
        self.kind = kind.clone();
        self
    }

    /// Survives broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Removed by the broker once its last binding goes away.
    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn exchange_kind(&self) -> &ExchangeKind {
        &self.kind
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }
}
