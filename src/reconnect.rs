// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Reconnect-on-Failure Policy
//!
//! Long-lived workers can lose their broker connection to idle timeouts or
//! broker restarts. When reconnect-on-failure is enabled, an operation that
//! fails because the connection or channel is gone is retried exactly once
//! on a fresh connection. Any other failure, and any failure of the retry,
//! reaches the caller unchanged.

use crate::{channel::AmqpConnection, errors::QueueError};
use async_trait::async_trait;
use lapin::Channel;
use std::future::Future;
use tracing::{error, warn};

/// Something that hands out channel handles and can rebuild its connection.
#[cfg_attr(test, mockall::automock(type Handle = u32;))]
#[async_trait]
pub trait Reconnect: Send {
    type Handle: Clone + Send;

    fn reconnect_on_failure(&self) -> bool;

    /// A handle to run the next operation on, connecting lazily if needed.
    async fn handle(&mut self) -> Result<Self::Handle, QueueError>;

    async fn reconnect(&mut self) -> Result<(), QueueError>;
}

#[async_trait]
impl Reconnect for AmqpConnection {
    type Handle = Channel;

    fn reconnect_on_failure(&self) -> bool {
        AmqpConnection::reconnect_on_failure(self)
    }

    async fn handle(&mut self) -> Result<Channel, QueueError> {
        self.ensure_connected().await
    }

    async fn reconnect(&mut self) -> Result<(), QueueError> {
        AmqpConnection::reconnect(self).await
    }
}

/// Runs `op` on a handle from `target`, reconnecting and retrying once if
/// the connection was lost and the target allows it.
pub async fn retry_once<R, T, F, Fut>(target: &mut R, op: F) -> Result<T, QueueError>
where
    R: Reconnect + ?Sized,
    F: Fn(R::Handle) -> Fut,
    Fut: Future<Output = Result<T, QueueError>>,
{
    let first = match target.handle().await {
        Ok(handle) => op(handle).await,
        Err(err) => Err(err),
    };

    match first {
        Err(err) if err.is_connection_lost() && target.reconnect_on_failure() => {
            warn!(error = err.to_string(), "connection lost, reconnecting once");

            if let Err(reconnect_err) = target.reconnect().await {
                error!(error = reconnect_err.to_string(), "failure to reconnect");
                return Err(reconnect_err);
            }

            let handle = target.handle().await?;
            op(handle).await
        }
        result => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    fn closed() -> QueueError {
        QueueError::ChannelClosed("channel closed by test".to_owned())
    }

    #[tokio::test]
    async fn success_does_not_reconnect() {
        let mut target = MockReconnect::new();
        target.expect_handle().times(1).returning(|| Ok(1));
        target.expect_reconnect().never();

        let result = retry_once(&mut target, |handle| async move { Ok(handle * 10) }).await;

        assert_eq!(result, Ok(10));
    }

    #[tokio::test]
    async fn lost_connection_surfaces_when_reconnect_is_disabled() {
        let mut target = MockReconnect::new();
        target.expect_handle().times(1).returning(|| Ok(1));
        target.expect_reconnect_on_failure().return_const(false);
        target.expect_reconnect().never();

        let result: Result<(), _> = retry_once(&mut target, |_| async { Err(closed()) }).await;

        assert_eq!(result, Err(closed()));
    }

    #[tokio::test]
    async fn lost_connection_is_retried_exactly_once() {
        let mut target = MockReconnect::new();
        let mut handles = vec![Ok(2), Ok(1)];
        target
            .expect_handle()
            .times(2)
            .returning(move || handles.pop().unwrap());
        target.expect_reconnect_on_failure().return_const(true);
        target.expect_reconnect().times(1).returning(|| Ok(()));

        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let result = retry_once(&mut target, move |handle| {
            let seen = seen.clone();
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                if handle == 1 {
                    Err(closed())
                } else {
                    Ok(handle)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn second_failure_is_not_retried() {
        let mut target = MockReconnect::new();
        target.expect_handle().times(2).returning(|| Ok(1));
        target.expect_reconnect_on_failure().return_const(true);
        target.expect_reconnect().times(1).returning(|| Ok(()));

        let result: Result<(), _> = retry_once(&mut target, |_| async { Err(closed()) }).await;

        assert_eq!(result, Err(closed()));
    }

    #[tokio::test]
    async fn closed_connection_on_handle_triggers_reconnect() {
        let mut target = MockReconnect::new();
        let mut handles = vec![Ok(7), Err(closed())];
        target
            .expect_handle()
            .times(2)
            .returning(move || handles.pop().unwrap());
        target.expect_reconnect_on_failure().return_const(true);
        target.expect_reconnect().times(1).returning(|| Ok(()));

        let result = retry_once(&mut target, |handle| async move { Ok(handle) }).await;

        assert_eq!(result, Ok(7));
    }

    #[tokio::test]
    async fn other_errors_are_never_retried() {
        let mut target = MockReconnect::new();
        target.expect_handle().times(1).returning(|| Ok(1));
        target.expect_reconnect_on_failure().return_const(true);
        target.expect_reconnect().never();

        let result: Result<(), _> = retry_once(&mut target, |_| async {
            Err(QueueError::Protocol("PRECONDITION_FAILED".to_owned()))
        })
        .await;

        assert!(matches!(result, Err(QueueError::Protocol(_))));
    }

    #[tokio::test]
    async fn failed_reconnect_is_surfaced() {
        let mut target = MockReconnect::new();
        target.expect_handle().times(1).returning(|| Ok(1));
        target.expect_reconnect_on_failure().return_const(true);
        target
            .expect_reconnect()
            .times(1)
            .returning(|| Err(QueueError::Connection("refused".to_owned())));

        let result: Result<(), _> = retry_once(&mut target, |_| async { Err(closed()) }).await;

        assert_eq!(result, Err(QueueError::Connection("refused".to_owned())));
    }
}
