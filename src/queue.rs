// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Management for RabbitMQ
//!
//! This module provides queue declarations, queue-to-exchange bindings and the
//! ordered argument map sent with `queue.declare`. Argument order is kept
//! stable so the same configuration always yields the same declaration.

use lapin::{
    options::QueueDeclareOptions,
    types::{AMQPValue, FieldTable, LongLongInt, LongString, ShortString},
};
use std::collections::BTreeMap;

/// A single `queue.declare` argument value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgumentValue {
    Int(i64),
    Str(String),
}

impl From<&ArgumentValue> for AMQPValue {
    fn from(value: &ArgumentValue) -> Self {
        match value {
            ArgumentValue::Int(v) => AMQPValue::LongLongInt(LongLongInt::from(*v)),
            ArgumentValue::Str(v) => AMQPValue::LongString(LongString::from(v.as_str())),
        }
    }
}

/// Ordered `queue.declare` arguments.
///
/// Insertion order is preserved and re-inserting a key replaces its value in
/// place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueArguments {
    entries: Vec<(String, ArgumentValue)>,
}

impl QueueArguments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: &str, value: ArgumentValue) {
        match self.entries.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key.to_owned(), value)),
        }
    }

    pub fn with_int(mut self, key: &str, value: i64) -> Self {
        self.insert(key, ArgumentValue::Int(value));
        self
    }

    pub fn with_str(mut self, key: &str, value: &str) -> Self {
        self.insert(key, ArgumentValue::Str(value.to_owned()));
        self
    }

    pub fn get(&self, key: &str) -> Option<&ArgumentValue> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn keys(&self) -> Vec<&str> {
        self.entries.iter().map(|(k, _)| k.as_str()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ArgumentValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl From<&QueueArguments> for FieldTable {
    fn from(args: &QueueArguments) -> Self {
        let table: BTreeMap<ShortString, AMQPValue> = args
            .iter()
            .map(|(k, v)| (ShortString::from(k), AMQPValue::from(v)))
            .collect();

        FieldTable::from(table)
    }
}

/// Definition of a RabbitMQ queue with its declaration flags and arguments.
///
/// Queues are durable unless stated otherwise; jobs must survive a broker
/// restart.
#[derive(Debug, Clone)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) auto_delete: bool,
    pub(crate) exclusive: bool,
    pub(crate) passive: bool,
    pub(crate) arguments: QueueArguments,
}

impl QueueDefinition {
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            durable: true,
            auto_delete: false,
            exclusive: false,
            passive: false,
            arguments: QueueArguments::default(),
        }
    }

    /// Sets whether the queue survives a broker restart.
    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    /// Sets the queue to auto-delete once its last consumer goes away.
    pub fn auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = auto_delete;
        self
    }

    /// Makes the queue exclusive to the declaring connection.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Makes the declaration passive: an existence check that never creates
    /// the queue.
    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    pub fn arguments(mut self, arguments: QueueArguments) -> Self {
        self.arguments = arguments;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn options(&self) -> QueueDeclareOptions {
        QueueDeclareOptions {
            passive: self.passive,
            durable: self.durable,
            exclusive: self.exclusive,
            auto_delete: self.auto_delete,
            nowait: false,
        }
    }
}

/// Configuration for binding a queue to an exchange.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueBinding {
    pub(crate) queue_name: String,
    pub(crate) exchange_name: String,
    pub(crate) routing_key: String,
}

impl QueueBinding {
    /// Creates a new queue binding for the given queue.
    ///
    /// The exchange and routing key start empty and are set with
    /// [`QueueBinding::exchange`] and [`QueueBinding::routing_key`].
    pub fn new(queue: &str) -> QueueBinding {
        QueueBinding {
            queue_name: queue.to_owned(),
            exchange_name: String::new(),
            routing_key: String::new(),
        }
    }

    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange_name = exchange.to_owned();
        self
    }

    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }
}
