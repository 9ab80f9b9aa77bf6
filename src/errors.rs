// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the RabbitMQ Queue Driver
//!
//! This module provides the error taxonomy shared by every layer of the driver.
//! Broker errors coming from `lapin` are classified into connection-level
//! failures (recoverable through reconnect), channel-level refusals, and
//! "not found" replies that passive checks translate into plain booleans.

use lapin::protocol::{AMQPErrorKind, AMQPSoftError};
use thiserror::Error;

/// Represents errors that can occur while driving the job queue.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// The broker is unreachable or the transport was lost
    #[error("failure to connect: {0}")]
    Connection(String),

    /// The channel was closed, either by the broker or by the client
    #[error("channel closed: {0}")]
    ChannelClosed(String),

    /// The broker replied with NOT_FOUND (404) for a passive declare or a get
    #[error("resource not found: {0}")]
    NotFound(String),

    /// The broker refused the operation, e.g. PRECONDITION_FAILED on mismatched arguments
    #[error("broker refused the operation: {0}")]
    Protocol(String),

    /// A value given to the driver is not acceptable, e.g. an unknown exchange type
    #[error("validation failure: {0}")]
    Validation(String),

    /// The configuration bundle could not be resolved
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to bind queue `{1}` to exchange `{0}`")]
    BindingExchangeToQueueError(String, String),

    /// Error publishing a message
    #[error("failure to publish: {0}")]
    PublishingError(String),

    /// The broker negatively confirmed a published message
    #[error("publisher confirm nack for `{0}`")]
    PublishNack(String),

    /// Error serializing or parsing a job payload
    #[error("failure to (de)serialize payload: {0}")]
    Serialization(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error rejecting a message
    #[error("failure to reject message")]
    RejectMessageError,
}

impl QueueError {
    /// Whether the error means the connection or channel is gone, which is
    /// the only class of failure a reconnect can fix.
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, QueueError::Connection(_) | QueueError::ChannelClosed(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, QueueError::NotFound(_))
    }
}

impl From<lapin::Error> for QueueError {
    fn from(err: lapin::Error) -> Self {
        match &err {
            lapin::Error::ProtocolError(amqp) => match amqp.kind() {
                AMQPErrorKind::Soft(AMQPSoftError::NOTFOUND) => {
                    QueueError::NotFound(amqp.get_message().as_str().to_owned())
                }
                AMQPErrorKind::Hard(_) => QueueError::Connection(err.to_string()),
                _ => QueueError::Protocol(err.to_string()),
            },
            lapin::Error::InvalidChannelState(_) => QueueError::ChannelClosed(err.to_string()),
            lapin::Error::InvalidConnectionState(_)
            | lapin::Error::IOError(_)
            | lapin::Error::MissingHeartbeatError => {
                QueueError::Connection(err.to_string())
            }
            _ => QueueError::InternalError,
        }
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        QueueError::Serialization(err.to_string())
    }
}
