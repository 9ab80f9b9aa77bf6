// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Naming
//!
//! This module computes every name and argument map the driver declares on
//! the broker: exchanges, routing keys, failed-job routing keys, the
//! arguments of job queues and those of the TTL queues used for delayed
//! delivery. Everything here is a pure function of the resolved
//! [`QueueConfig`], so the same configuration always produces the same
//! topology.
//!
//! Two dead-letter policies coexist and must not be confused:
//! - job queues dead-letter to the failed exchange only when rerouting is
//!   enabled; otherwise the arguments are omitted entirely;
//! - delay queues always dead-letter, and an unset exchange means the
//!   default exchange, written as an empty string.

use crate::{
    config::{QueueConfig, QUEUE_NAME_PLACEHOLDER},
    errors::QueueError,
    exchange::ExchangeKind,
    queue::QueueArguments,
};
use tracing::debug;

/// Constant for the argument used to specify the maximum message priority
pub const AMQP_HEADERS_MAX_PRIORITY: &str = "x-max-priority";
/// Constant for the argument used to specify a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Constant for the argument used to specify a dead letter routing key
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Constant for the argument used to specify the queue type
pub const AMQP_HEADERS_QUEUE_TYPE: &str = "x-queue-type";
/// Constant for the argument used to specify message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Constant for the argument used to specify the idle queue expiry
pub const AMQP_HEADERS_EXPIRES: &str = "x-expires";

pub const QUORUM_QUEUE_TYPE: &str = "quorum";

/// Name of the default exchange as written in dead-letter arguments.
pub const DEFAULT_EXCHANGE: &str = "";

/// Computes exchange names, routing keys and queue arguments for a
/// configuration.
#[derive(Debug, Clone)]
pub struct TopologyNamer {
    config: QueueConfig,
}

impl TopologyNamer {
    pub fn new(config: QueueConfig) -> TopologyNamer {
        TopologyNamer { config }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// The queue an operation targets: the given one, or the configured
    /// default when absent or empty.
    pub fn queue<'q>(&'q self, queue: Option<&'q str>) -> &'q str {
        match queue {
            Some(name) if !name.is_empty() => name,
            _ => &self.config.queue,
        }
    }

    /// Resolves the exchange type.
    ///
    /// Without an explicit value the configured type is used; an explicit
    /// empty value means direct.
    pub fn exchange_type(&self, raw: Option<&str>) -> Result<ExchangeKind, QueueError> {
        match raw {
            None => Ok(self.config.exchange_type),
            Some(raw) => raw.parse(),
        }
    }

    /// Resolves the exchange to publish to.
    ///
    /// A non-empty explicit name wins, an explicit empty name means "no
    /// exchange", and an absent name falls back to the configuration.
    pub fn exchange(&self, explicit: Option<&str>) -> Option<String> {
        resolve_exchange(explicit, self.config.exchange.as_deref())
    }

    /// Resolves the failed-job exchange, with the same precedence as
    /// [`TopologyNamer::exchange`].
    pub fn failed_exchange(&self, explicit: Option<&str>) -> Option<String> {
        resolve_exchange(explicit, self.config.failed_exchange.as_deref())
    }

    pub fn routing_key(&self, queue: &str) -> String {
        apply_template(&self.config.exchange_routing_key, queue)
    }

    pub fn failed_routing_key(&self, queue: &str) -> String {
        apply_template(&self.config.failed_routing_key, queue)
    }

    /// Builds the `queue.declare` arguments of a job queue.
    pub fn queue_arguments(&self, queue: &str) -> QueueArguments {
        let mut args = QueueArguments::new();

        // Quorum queues reject priority arguments.
        if self.config.is_prioritize_delayed() {
            if self.config.is_quorum() {
                debug!(queue, "dropping x-max-priority for quorum queue");
            } else if self.config.queue_max_priority() > 0 {
                args = args.with_int(
                    AMQP_HEADERS_MAX_PRIORITY,
                    i64::from(self.config.queue_max_priority()),
                );
            }
        }

        if self.config.is_reroute_failed() {
            if let Some(failed_exchange) = self.failed_exchange(None) {
                args = args
                    .with_str(AMQP_HEADERS_DEAD_LETTER_EXCHANGE, &failed_exchange)
                    .with_str(
                        AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY,
                        &self.failed_routing_key(queue),
                    );
            }
        }

        if self.config.is_quorum() {
            args = args.with_str(AMQP_HEADERS_QUEUE_TYPE, QUORUM_QUEUE_TYPE);
        }

        args
    }

    /// Builds the `queue.declare` arguments of a delay queue: messages
    /// expire after `ttl` milliseconds and are dead-lettered back to the
    /// target queue's exchange and routing key. The queue itself expires
    /// after staying unused for twice the TTL.
    pub fn delay_queue_arguments(&self, queue: &str, ttl: i64) -> QueueArguments {
        let exchange = self.exchange(None).unwrap_or_else(|| DEFAULT_EXCHANGE.to_owned());

        QueueArguments::new()
            .with_str(AMQP_HEADERS_DEAD_LETTER_EXCHANGE, &exchange)
            .with_str(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY, &self.routing_key(queue))
            .with_int(AMQP_HEADERS_MESSAGE_TTL, ttl)
            .with_int(AMQP_HEADERS_EXPIRES, ttl.saturating_mul(2))
    }

    /// Name of the delay queue holding messages for `queue` during `ttl`
    /// milliseconds. One delay queue exists per distinct delay.
    pub fn delay_queue_name(&self, queue: &str, ttl: i64) -> String {
        format!("{queue}.delay.{ttl}")
    }
}

fn resolve_exchange(explicit: Option<&str>, configured: Option<&str>) -> Option<String> {
    match explicit.or(configured) {
        Some(name) if !name.is_empty() => Some(name.to_owned()),
        _ => None,
    }
}

/// Substitutes the queue name into a routing key template. An empty queue
/// name leaves a dangling leading separator, which is trimmed.
fn apply_template(template: &str, queue: &str) -> String {
    let key = template.replace(QUEUE_NAME_PLACEHOLDER, queue);
    if queue.is_empty() {
        key.trim_start_matches('.').to_owned()
    } else {
        key
    }
}
