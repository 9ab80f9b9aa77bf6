// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection Management
//!
//! This module owns the single connection/channel pair a driver works with.
//! The connection is established lazily by the first operation that needs
//! it and moves through an explicit state machine:
//!
//! ```text
//! Disconnected --connect--> Connected --close / transport lost--> Closed
//!                               ^                                   |
//!                               +------------reconnect--------------+
//! ```
//!
//! A closed connection is never reopened implicitly. Reconnecting is an
//! explicit decision taken by the reconnect policy in [`crate::reconnect`].

use crate::{config::ConnectionConfig, errors::QueueError};
use lapin::{
    options::ConfirmSelectOptions, types::LongString, Channel, Connection, ConnectionProperties,
};
use tracing::{debug, error, warn};

const REPLY_SUCCESS: u16 = 200;

/// Lifecycle of the driver connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Never connected; the next operation connects.
    Disconnected,
    Connected,
    /// Closed by the client or found dead; only a reconnect leaves this state.
    Closed,
}

/// A lazily established broker connection with exactly one open channel.
pub struct AmqpConnection {
    config: ConnectionConfig,
    state: ConnectionState,
    connection: Option<Connection>,
    channel: Option<Channel>,
}

impl AmqpConnection {
    pub fn new(config: ConnectionConfig) -> AmqpConnection {
        AmqpConnection {
            config,
            state: ConnectionState::Disconnected,
            connection: None,
            channel: None,
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Whether operations that lost the connection are retried once after
    /// reconnecting.
    pub fn reconnect_on_failure(&self) -> bool {
        self.config.reconnect
    }

    /// The state of the connection, downgraded to `Closed` when the
    /// transport died since the last operation.
    pub fn state(&self) -> ConnectionState {
        match self.state {
            ConnectionState::Connected if !self.is_connected() => ConnectionState::Closed,
            state => state,
        }
    }

    /// Whether the transport and its channel are open right now.
    ///
    /// This reads the live status kept by the client library, so a
    /// connection closed by the broker is reported as such.
    pub fn is_connected(&self) -> bool {
        self.connection
            .as_ref()
            .is_some_and(|conn| conn.status().connected())
            && self
                .channel
                .as_ref()
                .is_some_and(|ch| ch.status().connected())
    }

    /// Establishes the connection and opens its channel.
    ///
    /// Calling it while connected is a no-op. Configured hosts are tried in
    /// order and the first one that accepts the connection is kept.
    pub async fn connect(&mut self) -> Result<(), QueueError> {
        if self.is_connected() {
            return Ok(());
        }

        let mut last_error = QueueError::Connection("no host configured".to_owned());

        for host in &self.config.hosts {
            debug!(host = host.host.as_str(), port = host.port, "creating amqp connection...");

            let options = ConnectionProperties::default()
                .with_connection_name(LongString::from(self.config.connection_name.as_str()));

            let conn = match Connection::connect(&self.config.uri(host), options).await {
                Ok(conn) => conn,
                Err(err) => {
                    warn!(
                        error = err.to_string(),
                        host = host.host.as_str(),
                        "failure to connect"
                    );
                    last_error = QueueError::Connection(err.to_string());
                    continue;
                }
            };
            debug!("amqp connected");

            let channel = open_channel(&conn).await?;
            debug!(channel = channel.id(), "channel created");

            self.connection = Some(conn);
            self.channel = Some(channel);
            self.state = ConnectionState::Connected;
            return Ok(());
        }

        error!(error = last_error.to_string(), "no amqp host accepted the connection");
        Err(last_error)
    }

    /// Returns the open channel, connecting first if this is the first use.
    ///
    /// A channel closed by the broker on a still-open connection is replaced.
    /// A closed connection is reported as [`QueueError::ChannelClosed`].
    pub async fn ensure_connected(&mut self) -> Result<Channel, QueueError> {
        match self.state {
            ConnectionState::Disconnected => self.connect().await?,
            ConnectionState::Closed => {
                return Err(QueueError::ChannelClosed(
                    "the connection has been closed".to_owned(),
                ))
            }
            ConnectionState::Connected => {
                let conn_open = self
                    .connection
                    .as_ref()
                    .is_some_and(|conn| conn.status().connected());

                if !conn_open {
                    warn!("amqp connection was lost");
                    self.state = ConnectionState::Closed;
                    return Err(QueueError::ChannelClosed(
                        "the connection is no longer open".to_owned(),
                    ));
                }

                if !self.is_connected() {
                    self.reopen_channel().await?;
                }
            }
        }

        self.channel
            .clone()
            .ok_or_else(|| QueueError::ChannelClosed("no channel available".to_owned()))
    }

    /// Replaces the channel after the broker closed it, e.g. following a
    /// NOT_FOUND reply to a passive declare. Falls back to a full reconnect
    /// when the connection itself is gone.
    pub async fn reopen_channel(&mut self) -> Result<(), QueueError> {
        let conn_open = self
            .connection
            .as_ref()
            .is_some_and(|conn| conn.status().connected());
        if !conn_open {
            return self.reconnect().await;
        }

        let Some(conn) = self.connection.as_ref() else {
            return self.reconnect().await;
        };

        debug!("reopening amqp channel...");
        let channel = open_channel(conn).await?;
        debug!(channel = channel.id(), "channel reopened");

        self.channel = Some(channel);
        self.state = ConnectionState::Connected;
        Ok(())
    }

    /// Drops the current connection, whatever its state, and connects again.
    pub async fn reconnect(&mut self) -> Result<(), QueueError> {
        warn!("reconnecting to the broker");
        self.shutdown().await;
        self.connect().await
    }

    /// Closes the channel and the connection. Idempotent.
    pub async fn close(&mut self) -> Result<(), QueueError> {
        if self.state == ConnectionState::Disconnected {
            return Ok(());
        }

        self.shutdown().await;
        self.state = ConnectionState::Closed;
        debug!("amqp connection closed");
        Ok(())
    }

    async fn shutdown(&mut self) {
        if let Some(channel) = self.channel.take() {
            if channel.status().connected() {
                if let Err(err) = channel.close(REPLY_SUCCESS, "closing channel").await {
                    warn!(error = err.to_string(), "failure to close the channel");
                }
            }
        }

        if let Some(conn) = self.connection.take() {
            if conn.status().connected() {
                if let Err(err) = conn.close(REPLY_SUCCESS, "closing connection").await {
                    warn!(error = err.to_string(), "failure to close the connection");
                }
            }
        }
    }
}

/// Opens a channel in publisher-confirm mode.
async fn open_channel(conn: &Connection) -> Result<Channel, QueueError> {
    let channel = conn.create_channel().await.map_err(|err| {
        error!(error = err.to_string(), "error to create the channel");
        QueueError::from(err)
    })?;

    channel
        .confirm_select(ConfirmSelectOptions { nowait: false })
        .await
        .map_err(|err| {
            error!(error = err.to_string(), "error to enable publisher confirms");
            QueueError::from(err)
        })?;

    Ok(channel)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HostConfig;

    fn unreachable_config() -> ConnectionConfig {
        ConnectionConfig {
            hosts: vec![HostConfig {
                host: "127.0.0.1".to_owned(),
                port: 1,
                ..HostConfig::default()
            }],
            connection_timeout: Some(200),
            ..ConnectionConfig::default()
        }
    }

    #[test]
    fn starts_disconnected() {
        let conn = AmqpConnection::new(ConnectionConfig::default());

        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(!conn.is_connected());
        assert!(!conn.reconnect_on_failure());
    }

    #[tokio::test]
    async fn close_before_connect_is_a_noop() {
        let mut conn = AmqpConnection::new(ConnectionConfig::default());

        conn.close().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn unreachable_broker_is_a_connection_error() {
        let mut conn = AmqpConnection::new(unreachable_config());

        let err = conn.ensure_connected().await.unwrap_err();
        assert!(matches!(err, QueueError::Connection(_)));
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn no_hosts_is_a_connection_error() {
        let mut conn = AmqpConnection::new(ConnectionConfig {
            hosts: vec![],
            ..ConnectionConfig::default()
        });

        assert!(matches!(
            conn.connect().await,
            Err(QueueError::Connection(_))
        ));
    }
}
