// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Client Configuration
//!
//! Plain configuration structs consumed by the connection manager. They are
//! read once at startup, usually from a JSON document, and can be overridden
//! through `RABBITMQ_*` environment variables.

use crate::errors::AmqpError;
use lapin::uri::{AMQPAuthority, AMQPQueryString, AMQPScheme, AMQPUri, AMQPUserInfo};
use serde::Deserialize;
use std::{path::Path, time::Duration};
use tracing::error;

/// Application identity, used to label the broker connection.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AppConfigs {
    pub name: String,
    pub host: String,
}

impl Default for AppConfigs {
    fn default() -> Self {
        AppConfigs {
            name: env!("CARGO_PKG_NAME").to_owned(),
            host: std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_owned()),
        }
    }
}

/// Broker connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RabbitMQConfigs {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
    pub connection_timeout_ms: u64,
    pub socket_read_timeout_ms: u64,
    pub socket_write_timeout_ms: u64,
    pub automatic_recovery: bool,
    pub network_recovery_interval_ms: u64,
    pub recovery_attempts: u32,
    pub topology_recovery: bool,
    pub dispatch_consumers_async: bool,
    pub confirm_timeout_ms: u64,
    /// Run publish-and-confirm one at a time per connection manager.
    pub serialize_publish: bool,
}

impl Default for RabbitMQConfigs {
    fn default() -> Self {
        RabbitMQConfigs {
            host: "localhost".to_owned(),
            port: 5672,
            user: "admin".to_owned(),
            password: "admin".to_owned(),
            vhost: "/".to_owned(),
            connection_timeout_ms: 1000,
            socket_read_timeout_ms: 1000,
            socket_write_timeout_ms: 1000,
            automatic_recovery: true,
            network_recovery_interval_ms: 1000,
            recovery_attempts: 3,
            topology_recovery: true,
            dispatch_consumers_async: true,
            confirm_timeout_ms: 250,
            serialize_publish: true,
        }
    }
}

impl RabbitMQConfigs {
    /// Builds the broker address from its parts. Credentials and vhost are
    /// kept raw, so reserved characters in them need no escaping.
    pub fn amqp_uri(&self) -> AMQPUri {
        AMQPUri {
            scheme: AMQPScheme::AMQP,
            authority: AMQPAuthority {
                userinfo: AMQPUserInfo {
                    username: self.user.clone(),
                    password: self.password.clone(),
                },
                host: self.host.clone(),
                port: self.port,
            },
            vhost: self.vhost.clone(),
            query: AMQPQueryString::default(),
        }
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn socket_read_timeout(&self) -> Duration {
        Duration::from_millis(self.socket_read_timeout_ms)
    }

    pub fn socket_write_timeout(&self) -> Duration {
        Duration::from_millis(self.socket_write_timeout_ms)
    }

    pub fn network_recovery_interval(&self) -> Duration {
        Duration::from_millis(self.network_recovery_interval_ms)
    }

    pub fn confirm_timeout(&self) -> Duration {
        Duration::from_millis(self.confirm_timeout_ms)
    }

    /// Number of connect attempts made on a single channel request.
    pub fn connect_attempts(&self) -> u32 {
        if self.automatic_recovery {
            self.recovery_attempts.max(1)
        } else {
            1
        }
    }
}

/// Full configuration of a client: application identity plus broker settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClientConfigs {
    pub app: AppConfigs,
    pub rabbitmq: RabbitMQConfigs,
}

impl ClientConfigs {
    /// Parses a JSON document. Missing fields keep their defaults.
    pub fn from_json(raw: &str) -> Result<ClientConfigs, AmqpError> {
        serde_json::from_str(raw).map_err(|err| {
            error!(error = err.to_string(), "failure to parse configs");
            AmqpError::ConfigError(err.to_string())
        })
    }

    /// Reads and parses a JSON file, then applies environment overrides.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<ClientConfigs, AmqpError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|err| {
            error!(
                error = err.to_string(),
                path = %path.display(),
                "failure to read configs file"
            );
            AmqpError::ConfigError(err.to_string())
        })?;

        ClientConfigs::from_json(&raw)?.with_overrides(|key| std::env::var(key).ok())
    }

    /// Applies overrides looked up by variable name, e.g. `RABBITMQ_HOST`.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<ClientConfigs, AmqpError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(name) = lookup("APP_NAME") {
            self.app.name = name;
        }
        if let Some(host) = lookup("RABBITMQ_HOST") {
            self.rabbitmq.host = host;
        }
        if let Some(port) = lookup("RABBITMQ_PORT") {
            self.rabbitmq.port = port.parse().map_err(|_| {
                error!(port = %port, "invalid RABBITMQ_PORT");
                AmqpError::ConfigError(format!("invalid port `{port}`"))
            })?;
        }
        if let Some(user) = lookup("RABBITMQ_USER") {
            self.rabbitmq.user = user;
        }
        if let Some(password) = lookup("RABBITMQ_PASSWORD") {
            self.rabbitmq.password = password;
        }
        if let Some(vhost) = lookup("RABBITMQ_VHOST") {
            self.rabbitmq.vhost = vhost;
        }

        Ok(self)
    }

    /// Label the broker shows for this client's connection.
    pub fn client_name(&self) -> String {
        format!("App: {}, Machine: {}", self.app.name, self.app.host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_follow_broker_conventions() {
        let cfg = RabbitMQConfigs::default();

        assert_eq!(cfg.port, 5672);
        assert_eq!(cfg.confirm_timeout(), Duration::from_millis(250));
        assert!(cfg.automatic_recovery);
        assert!(cfg.topology_recovery);

        let uri = cfg.amqp_uri();
        assert_eq!(uri.scheme, AMQPScheme::AMQP);
        assert_eq!(uri.authority.host, "localhost");
        assert_eq!(uri.authority.userinfo.username, "admin");
        assert_eq!(uri.vhost, "/");
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg = ClientConfigs::from_json(
            r#"{"app": {"name": "billing", "host": "node-1"},
                "rabbitmq": {"host": "broker", "vhost": "orders", "automatic_recovery": false}}"#,
        )
        .unwrap();

        assert_eq!(cfg.client_name(), "App: billing, Machine: node-1");
        let uri = cfg.rabbitmq.amqp_uri();
        assert_eq!(uri.authority.host, "broker");
        assert_eq!(uri.authority.port, 5672);
        assert_eq!(uri.vhost, "orders");
        assert_eq!(cfg.rabbitmq.connect_attempts(), 1);
        assert_eq!(cfg.rabbitmq.socket_read_timeout_ms, 1000);
    }

    #[test]
    fn malformed_json_is_a_config_error() {
        let err = ClientConfigs::from_json("{\"rabbitmq\": {\"port\": \"x\"}}").unwrap_err();
        assert!(matches!(err, AmqpError::ConfigError(_)));
    }

    #[test]
    fn environment_overrides_win() {
        let env = HashMap::from([
            ("RABBITMQ_HOST", "rabbit.internal"),
            ("RABBITMQ_PORT", "5673"),
            ("RABBITMQ_VHOST", "/prod"),
        ]);

        let cfg = ClientConfigs::default()
            .with_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        let uri = cfg.rabbitmq.amqp_uri();
        assert_eq!(uri.authority.host, "rabbit.internal");
        assert_eq!(uri.authority.port, 5673);
        assert_eq!(uri.vhost, "/prod");
    }

    #[test]
    fn reserved_characters_in_credentials_survive() {
        let env = HashMap::from([
            ("RABBITMQ_USER", "ops@orders"),
            ("RABBITMQ_PASSWORD", "p@ss/w#rd"),
            ("RABBITMQ_VHOST", "tenant/a%b"),
        ]);

        let cfg = ClientConfigs::default()
            .with_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        let uri = cfg.rabbitmq.amqp_uri();
        assert_eq!(
            uri.authority.userinfo,
            AMQPUserInfo {
                username: "ops@orders".to_owned(),
                password: "p@ss/w#rd".to_owned(),
            }
        );
        assert_eq!(uri.authority.host, "localhost");
        assert_eq!(uri.vhost, "tenant/a%b");
    }

    #[test]
    fn invalid_port_override_is_rejected() {
        let err = ClientConfigs::default()
            .with_overrides(|key| (key == "RABBITMQ_PORT").then(|| "amqp".to_owned()))
            .unwrap_err();

        assert_eq!(err, AmqpError::ConfigError("invalid port `amqp`".to_owned()));
    }

    #[test]
    fn recovery_attempts_never_drop_below_one() {
        let cfg = RabbitMQConfigs {
            recovery_attempts: 0,
            ..RabbitMQConfigs::default()
        };
        assert_eq!(cfg.connect_attempts(), 1);
    }
}
