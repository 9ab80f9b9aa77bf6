// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Driver Configuration
//!
//! This module turns the raw connection bundle handed over by the host
//! application into an immutable, typed [`Config`]. The bundle is loosely
//! typed: options may be missing, `null`, empty strings, or booleans written
//! as strings. Every default is applied here, once, so the rest of the
//! driver never looks up a raw key.
//!
//! Recognized layout:
//!
//! ```json
//! {
//!   "queue": "default",
//!   "hosts": [{ "host": "localhost", "port": 5672, "user": "guest", "password": "guest", "vhost": "/" }],
//!   "lazy": true,
//!   "worker": "octane",
//!   "options": {
//!     "queue": {
//!       "exchange": "application-x",
//!       "exchange_type": "topic",
//!       "exchange_routing_key": "process.%s",
//!       "failed_exchange": "failed-exchange",
//!       "failed_routing_key": "application-x.%s.failed",
//!       "queue_max_priority": 20,
//!       "quorum": false,
//!       "reroute_failed": true,
//!       "prioritize_delayed": true
//!     }
//!   }
//! }
//! ```

use crate::{errors::QueueError, exchange::ExchangeKind};
use serde_json::{Map, Value};
use std::env;
use tracing::{debug, warn};

/// Placeholder replaced by the queue name in routing key templates.
pub const QUEUE_NAME_PLACEHOLDER: &str = "%s";

pub const DEFAULT_QUEUE: &str = "default";
pub const DEFAULT_ROUTING_KEY: &str = "%s";
pub const DEFAULT_FAILED_ROUTING_KEY: &str = "%s.failed";
pub const DEFAULT_QUEUE_MAX_PRIORITY: u8 = 2;

/// Worker name that turns on reconnect-on-failure for long-lived processes.
pub const RECONNECTING_WORKER: &str = "octane";

/// A single broker endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
}

impl Default for HostConfig {
    fn default() -> Self {
        HostConfig {
            host: "localhost".to_owned(),
            port: 5672,
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            vhost: "/".to_owned(),
        }
    }
}

/// Connection-level settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Endpoints tried in order until one accepts the connection.
    pub hosts: Vec<HostConfig>,
    /// Defer connecting until the first operation needs the channel.
    pub lazy: bool,
    /// Reconnect and retry an operation once when the connection was lost.
    pub reconnect: bool,
    pub connection_name: String,
    /// Heartbeat interval in seconds, negotiated with the broker.
    pub heartbeat: Option<u16>,
    /// Socket connect timeout in milliseconds.
    pub connection_timeout: Option<u64>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            hosts: vec![HostConfig::default()],
            lazy: true,
            reconnect: false,
            connection_name: env!("CARGO_PKG_NAME").to_owned(),
            heartbeat: None,
            connection_timeout: None,
        }
    }
}

impl ConnectionConfig {
    /// Builds the AMQP URI for a host, carrying the transport timeouts as
    /// query parameters.
    pub fn uri(&self, host: &HostConfig) -> String {
        let mut uri = format!(
            "amqp://{}:{}@{}:{}/{}",
            percent_encode(&host.user),
            percent_encode(&host.password),
            host.host,
            host.port,
            percent_encode(&host.vhost)
        );

        let mut query = vec![];
        if let Some(heartbeat) = self.heartbeat {
            query.push(format!("heartbeat={heartbeat}"));
        }
        if let Some(timeout) = self.connection_timeout {
            query.push(format!("connection_timeout={timeout}"));
        }
        if !query.is_empty() {
            uri.push('?');
            uri.push_str(&query.join("&"));
        }

        uri
    }
}

/// Queue and topology settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// Queue used when an operation does not name one.
    pub queue: String,
    pub exchange: Option<String>,
    pub exchange_type: ExchangeKind,
    /// Routing key template, `%s` is the queue name.
    pub exchange_routing_key: String,
    pub failed_exchange: Option<String>,
    /// Failed routing key template, `%s` is the queue name.
    pub failed_routing_key: String,
    pub queue_max_priority: u8,
    pub quorum: bool,
    pub reroute_failed: bool,
    pub prioritize_delayed: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            queue: DEFAULT_QUEUE.to_owned(),
            exchange: None,
            exchange_type: ExchangeKind::Direct,
            exchange_routing_key: DEFAULT_ROUTING_KEY.to_owned(),
            failed_exchange: None,
            failed_routing_key: DEFAULT_FAILED_ROUTING_KEY.to_owned(),
            queue_max_priority: DEFAULT_QUEUE_MAX_PRIORITY,
            quorum: false,
            reroute_failed: false,
            prioritize_delayed: false,
        }
    }
}

impl QueueConfig {
    pub fn is_reroute_failed(&self) -> bool {
        self.reroute_failed
    }

    pub fn is_prioritize_delayed(&self) -> bool {
        self.prioritize_delayed
    }

    pub fn is_quorum(&self) -> bool {
        self.quorum
    }

    pub fn queue_max_priority(&self) -> u8 {
        self.queue_max_priority
    }
}

/// Fully resolved driver configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Config {
    pub connection: ConnectionConfig,
    pub queue: QueueConfig,
}

impl Config {
    /// Resolves a configuration bundle given as JSON text.
    pub fn from_json(raw: &str) -> Result<Config, QueueError> {
        let value: Value =
            serde_json::from_str(raw).map_err(|err| QueueError::Config(err.to_string()))?;
        Config::from_value(&value)
    }

    /// Resolves a configuration bundle.
    ///
    /// `null` or an empty object yields the defaults.
    pub fn from_value(raw: &Value) -> Result<Config, QueueError> {
        let empty = Map::new();
        let root = match raw {
            Value::Null => &empty,
            Value::Object(map) => map,
            other => {
                return Err(QueueError::Config(format!(
                    "configuration must be an object, got `{other}`"
                )))
            }
        };

        let connection = resolve_connection(root)?;

        let options = match root.get("options").and_then(|o| o.get("queue")) {
            None | Some(Value::Null) => &empty,
            Some(Value::Object(map)) => map,
            Some(_) => {
                return Err(QueueError::Config(
                    "`options.queue` must be an object".to_owned(),
                ))
            }
        };

        let queue = resolve_queue(root, options)?;

        debug!(
            queue = queue.queue.as_str(),
            exchange = queue.exchange.as_deref().unwrap_or_default(),
            quorum = queue.quorum,
            reconnect = connection.reconnect,
            "queue configuration resolved"
        );

        Ok(Config { connection, queue })
    }

    /// Resolves the configuration from `RABBITMQ_*` environment variables.
    pub fn from_env() -> Result<Config, QueueError> {
        let mut host = Map::new();
        for (var, key) in [
            ("RABBITMQ_HOST", "host"),
            ("RABBITMQ_PORT", "port"),
            ("RABBITMQ_USER", "user"),
            ("RABBITMQ_PASSWORD", "password"),
            ("RABBITMQ_VHOST", "vhost"),
        ] {
            if let Ok(value) = env::var(var) {
                host.insert(key.to_owned(), Value::String(value));
            }
        }

        let mut options = Map::new();
        for (var, key) in [
            ("RABBITMQ_EXCHANGE", "exchange"),
            ("RABBITMQ_EXCHANGE_TYPE", "exchange_type"),
            ("RABBITMQ_FAILED_EXCHANGE", "failed_exchange"),
            ("RABBITMQ_REROUTE_FAILED", "reroute_failed"),
            ("RABBITMQ_QUORUM", "quorum"),
            ("RABBITMQ_QUEUE_MAX_PRIORITY", "queue_max_priority"),
            ("RABBITMQ_PRIORITIZE_DELAYED", "prioritize_delayed"),
        ] {
            if let Ok(value) = env::var(var) {
                options.insert(key.to_owned(), Value::String(value));
            }
        }

        let mut root = Map::new();
        root.insert("hosts".to_owned(), Value::Array(vec![Value::Object(host)]));
        if let Ok(queue) = env::var("RABBITMQ_QUEUE") {
            root.insert("queue".to_owned(), Value::String(queue));
        }
        if let Ok(reconnect) = env::var("RABBITMQ_RECONNECT") {
            root.insert("reconnect".to_owned(), Value::String(reconnect));
        }
        let mut nested = Map::new();
        nested.insert("queue".to_owned(), Value::Object(options));
        root.insert("options".to_owned(), Value::Object(nested));

        Config::from_value(&Value::Object(root))
    }
}

fn resolve_connection(root: &Map<String, Value>) -> Result<ConnectionConfig, QueueError> {
    let defaults = ConnectionConfig::default();

    let hosts = match root.get("hosts") {
        None | Some(Value::Null) => defaults.hosts,
        Some(Value::Array(items)) if items.is_empty() => defaults.hosts,
        Some(Value::Array(items)) => items
            .iter()
            .map(resolve_host)
            .collect::<Result<Vec<_>, _>>()?,
        Some(_) => return Err(QueueError::Config("`hosts` must be a list".to_owned())),
    };

    let worker = string_option(root, "worker")?;
    let reconnect = bool_option(root, "reconnect")?
        || worker.as_deref() == Some(RECONNECTING_WORKER);

    Ok(ConnectionConfig {
        hosts,
        lazy: match root.get("lazy") {
            None | Some(Value::Null) => defaults.lazy,
            Some(_) => bool_option(root, "lazy")?,
        },
        reconnect,
        connection_name: string_option(root, "connection_name")?
            .unwrap_or(defaults.connection_name),
        heartbeat: int_option(root, "heartbeat")?
            .map(|v| to_range(v, "heartbeat"))
            .transpose()?,
        connection_timeout: int_option(root, "connection_timeout")?
            .map(|v| to_range(v, "connection_timeout"))
            .transpose()?,
    })
}

fn resolve_host(raw: &Value) -> Result<HostConfig, QueueError> {
    let Value::Object(map) = raw else {
        return Err(QueueError::Config("each host must be an object".to_owned()));
    };
    let defaults = HostConfig::default();

    Ok(HostConfig {
        host: string_option(map, "host")?.unwrap_or(defaults.host),
        port: match int_option(map, "port")? {
            Some(port) => to_range(port, "port")?,
            None => defaults.port,
        },
        user: string_option(map, "user")?.unwrap_or(defaults.user),
        password: string_option(map, "password")?.unwrap_or(defaults.password),
        vhost: string_option(map, "vhost")?.unwrap_or(defaults.vhost),
    })
}

fn resolve_queue(
    root: &Map<String, Value>,
    options: &Map<String, Value>,
) -> Result<QueueConfig, QueueError> {
    let defaults = QueueConfig::default();

    let exchange_type = match string_option(options, "exchange_type")? {
        Some(raw) => raw.parse::<ExchangeKind>()?,
        None => defaults.exchange_type,
    };

    let exchange_routing_key = match string_option(options, "exchange_routing_key")? {
        Some(template) => template,
        None => match string_option(options, "routing_key_prefix")? {
            Some(prefix) => format!("{prefix}{QUEUE_NAME_PLACEHOLDER}"),
            None => defaults.exchange_routing_key,
        },
    };

    let failed_routing_key = match string_option(options, "failed_routing_key")? {
        Some(template) => template,
        None => match string_option(options, "failed_routing_key_suffix")? {
            Some(suffix) => format!("{QUEUE_NAME_PLACEHOLDER}.{suffix}"),
            None => defaults.failed_routing_key,
        },
    };

    let queue_max_priority = match int_option(options, "queue_max_priority")? {
        Some(priority) => to_range(priority, "queue_max_priority")?,
        None => defaults.queue_max_priority,
    };

    let config = QueueConfig {
        queue: string_option(root, "queue")?.unwrap_or(defaults.queue),
        exchange: string_option(options, "exchange")?,
        exchange_type,
        exchange_routing_key,
        failed_exchange: string_option(options, "failed_exchange")?,
        failed_routing_key,
        queue_max_priority,
        quorum: bool_option(options, "quorum")?,
        reroute_failed: bool_option(options, "reroute_failed")?,
        prioritize_delayed: bool_option(options, "prioritize_delayed")?,
    };

    if config.reroute_failed && config.failed_exchange.is_none() {
        warn!("reroute_failed is set without a failed_exchange, failed jobs will not be rerouted");
    }

    Ok(config)
}

/// Reads a string option; missing, `null` and `""` all mean "not set".
fn string_option(map: &Map<String, Value>, key: &str) -> Result<Option<String>, QueueError> {
    match map.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.is_empty() => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(QueueError::Config(format!(
            "`{key}` must be a string, got `{other}`"
        ))),
    }
}

/// Reads a boolean option; only an explicit truthy value turns it on.
fn bool_option(map: &Map<String, Value>, key: &str) -> Result<bool, QueueError> {
    match map.get(key) {
        None | Some(Value::Null) => Ok(false),
        Some(Value::Bool(b)) => Ok(*b),
        Some(Value::Number(n)) => Ok(n.as_i64().is_some_and(|n| n != 0)),
        Some(Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "" | "0" | "false" | "no" | "off" => Ok(false),
            "1" | "true" | "yes" | "on" => Ok(true),
            other => Err(QueueError::Config(format!(
                "`{key}` must be a boolean, got `{other}`"
            ))),
        },
        Some(other) => Err(QueueError::Config(format!(
            "`{key}` must be a boolean, got `{other}`"
        ))),
    }
}

/// Reads an integer option; missing, `null` and `""` all mean "not set".
fn int_option(map: &Map<String, Value>, key: &str) -> Result<Option<i64>, QueueError> {
    match map.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n.as_i64().map(Some).ok_or_else(|| {
            QueueError::Config(format!("`{key}` must be an integer, got `{n}`"))
        }),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => s.trim().parse::<i64>().map(Some).map_err(|_| {
            QueueError::Config(format!("`{key}` must be an integer, got `{s}`"))
        }),
        Some(other) => Err(QueueError::Config(format!(
            "`{key}` must be an integer, got `{other}`"
        ))),
    }
}

fn to_range<T: TryFrom<i64>>(value: i64, key: &str) -> Result<T, QueueError> {
    T::try_from(value).map_err(|_| QueueError::Config(format!("`{key}` is out of range: {value}")))
}

fn percent_encode(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char)
            }
            other => out.push_str(&format!("%{other:02x}")),
        }
    }
    out
}
