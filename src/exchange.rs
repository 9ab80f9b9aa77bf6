// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Management for RabbitMQ
//!
//! This module provides the exchange types understood by the driver and a
//! builder for exchange declarations. Exchange types arrive as raw strings
//! from the configuration bundle or from per-push options, so parsing them is
//! a validation step: unknown names are rejected instead of being passed to
//! the broker.

use crate::errors::QueueError;
use lapin::options::ExchangeDeclareOptions;
use std::{fmt, str::FromStr};

/// Represents the types of exchanges available in RabbitMQ.
///
/// Each exchange type has specific routing behavior:
/// - Direct: Routes messages to queues based on an exact match of routing keys
/// - Fanout: Broadcasts messages to all bound queues regardless of routing keys
/// - Topic: Routes messages based on wildcard pattern matching of routing keys
/// - Headers: Routes based on message header values instead of routing keys
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
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

impl FromStr for ExchangeKind {
    type Err = QueueError;

    /// Parses an exchange type name, case-insensitively.
    ///
    /// An empty string is the "not configured" marker and resolves to
    /// `Direct`; any other unknown name is a validation error.
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "" | "direct" => Ok(ExchangeKind::Direct),
            "fanout" => Ok(ExchangeKind::Fanout),
            "topic" => Ok(ExchangeKind::Topic),
            "headers" => Ok(ExchangeKind::Headers),
            other => Err(QueueError::Validation(format!(
                "unknown exchange type `{other}`"
            ))),
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: ExchangeKind) -> Self {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        }
    }
}

/// Definition of a RabbitMQ exchange with its declaration flags.
///
/// Defaults to a durable direct exchange, which is what job routing needs.
#[derive(Debug, Clone)]
pub struct ExchangeDefinition {
    pub(crate) name: String,
    pub(crate) kind: ExchangeKind,
    pub(crate) durable: bool,
    pub(crate) auto_delete: bool,
    pub(crate) passive: bool,
    pub(crate) internal: bool,
}

impl ExchangeDefinition {
    /// Creates a new durable direct exchange definition with the given name.
    pub fn new(name: &str) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.to_owned(),
            kind: ExchangeKind::Direct,
            durable: true,
            auto_delete: false,
            passive: false,
            internal: false,
        }
    }

    /// Sets the exchange type.
    pub fn kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = kind;
        self
    }

    /// Makes the exchange transient, so it does not survive a broker restart.
    pub fn transient(mut self) -> Self {
        self.durable = false;
        self
    }

    /// Sets the exchange to auto-delete when the last binding is removed.
    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    /// Makes the declaration passive: the broker only checks for existence
    /// and replies NOT_FOUND instead of creating the exchange.
    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    /// Makes the exchange internal, preventing direct publishing.
    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn options(&self) -> ExchangeDeclareOptions {
        ExchangeDeclareOptions {
            passive: self.passive,
            durable: self.durable,
            auto_delete: self.auto_delete,
            internal: self.internal,
            nowait: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_exchange_types() {
        assert_eq!("topic".parse::<ExchangeKind>(), Ok(ExchangeKind::Topic));
        assert_eq!("FANOUT".parse::<ExchangeKind>(), Ok(ExchangeKind::Fanout));
        assert_eq!("headers".parse::<ExchangeKind>(), Ok(ExchangeKind::Headers));
        assert_eq!("".parse::<ExchangeKind>(), Ok(ExchangeKind::Direct));
    }

    #[test]
    fn rejects_unknown_exchange_type() {
        let err = "x-delayed-message".parse::<ExchangeKind>().unwrap_err();
        assert!(matches!(err, QueueError::Validation(_)));
    }

    #[test]
    fn definition_defaults_to_durable_direct() {
        let def = ExchangeDefinition::new("jobs");
        let opts = def.options();

        assert_eq!(def.kind, ExchangeKind::Direct);
        assert!(opts.durable);
        assert!(!opts.passive);

        let opts = ExchangeDefinition::new("jobs").passive().transient().options();
        assert!(opts.passive);
        assert!(!opts.durable);
    }

    #[test]
    fn definition_flags_map_to_declare_options() {
        let def = ExchangeDefinition::new("audit")
            .kind(ExchangeKind::Fanout)
            .auto_delete()
            .internal();
        let opts = def.options();

        assert_eq!(def.name(), "audit");
        assert_eq!(def.kind, ExchangeKind::Fanout);
        assert!(opts.auto_delete);
        assert!(opts.internal);
        assert!(opts.durable);
        assert!(!opts.passive);
    }
}
