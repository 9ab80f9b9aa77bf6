// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Broker round trips. Skipped unless `RABBITMQ_HOST` points at a broker.

use rabbitmq_queue::{
    channel::ConnectionState, exchange::ExchangeKind, publisher::JobPayload, queue::QueueBinding,
    Config, PushOptions, QueueError, RabbitMQQueue,
};
use serde_json::{json, Value};
use std::time::Duration;
use uuid::Uuid;

fn broker_config() -> Option<Config> {
    std::env::var("RABBITMQ_HOST").ok()?;
    Some(Config::from_env().expect("valid RABBITMQ_* configuration"))
}

fn random_name() -> String {
    format!("it-{}", Uuid::new_v4().simple())
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(500)).await;
}

#[tokio::test]
async fn declare_delete_exchange() -> Result<(), QueueError> {
    let Some(config) = broker_config() else {
        return Ok(());
    };
    let mut queue = RabbitMQQueue::new(config);
    let name = random_name();

    assert!(!queue.is_exchange_exists(&name).await?);

    queue.declare_exchange(&name, None).await?;
    assert!(queue.is_exchange_exists(&name).await?);

    queue.delete_exchange(&name, false).await?;
    assert!(!queue.is_exchange_exists(&name).await?);

    queue.close().await
}

#[tokio::test]
async fn declare_delete_queue() -> Result<(), QueueError> {
    let Some(config) = broker_config() else {
        return Ok(());
    };
    let mut queue = RabbitMQQueue::new(config);
    let name = random_name();

    assert!(!queue.is_queue_exists(&name).await?);
    assert_eq!(queue.size(Some(&name)).await?, 0);
    assert!(queue.pop(Some(&name)).await?.is_none());

    queue.declare_queue(&name, true, false, None).await?;
    assert!(queue.is_queue_exists(&name).await?);

    queue.delete_queue(&name, false, false).await?;
    assert!(!queue.is_queue_exists(&name).await?);

    queue.close().await
}

#[tokio::test]
async fn closed_connection_is_not_reopened_without_reconnect() -> Result<(), QueueError> {
    let Some(mut config) = broker_config() else {
        return Ok(());
    };
    config.connection.reconnect = false;
    let mut queue = RabbitMQQueue::new(config);
    let name = random_name();

    queue.purge(Some(&name)).await?;
    queue.push(json!({"n": 1}), Some(&name)).await?;
    settle().await;
    assert_eq!(queue.size(Some(&name)).await?, 1);

    queue.connection_mut().close().await?;
    assert!(!queue.connection().is_connected());
    assert_eq!(queue.connection().state(), ConnectionState::Closed);

    let err = queue.push(json!({"n": 2}), Some(&name)).await.unwrap_err();
    assert!(matches!(err, QueueError::ChannelClosed(_)));

    queue.connection_mut().reconnect().await?;
    queue.delete_queue(&name, false, false).await?;
    queue.close().await
}

#[tokio::test]
async fn closed_connection_is_reopened_with_reconnect() -> Result<(), QueueError> {
    let Some(mut config) = broker_config() else {
        return Ok(());
    };
    config.connection.reconnect = true;
    let mut queue = RabbitMQQueue::new(config);
    let name = random_name();

    queue.purge(Some(&name)).await?;
    queue.push(json!({"n": 1}), Some(&name)).await?;
    settle().await;
    assert_eq!(queue.size(Some(&name)).await?, 1);

    queue.connection_mut().close().await?;
    assert!(!queue.connection().is_connected());

    queue.push(json!({"n": 2}), Some(&name)).await?;
    settle().await;
    assert!(queue.connection().is_connected());
    assert_eq!(queue.size(Some(&name)).await?, 2);

    queue.delete_queue(&name, false, false).await?;
    queue.close().await
}

#[tokio::test]
async fn pop_ack_and_release() -> Result<(), QueueError> {
    let Some(config) = broker_config() else {
        return Ok(());
    };
    let mut queue = RabbitMQQueue::new(config);
    let name = random_name();

    let id = queue.push(json!({"mail": "a@example.com"}), Some(&name)).await?;
    settle().await;

    let job = queue.pop(Some(&name)).await?.expect("a job");
    assert_eq!(job.job_id().as_deref(), Some(id.as_str()));
    assert_eq!(job.attempts(), 1);
    let payload: JobPayload<Value> = job.decode()?;
    assert_eq!(payload.data, json!({"mail": "a@example.com"}));

    queue.release(&job, Duration::ZERO).await?;
    settle().await;

    let job = queue.pop(Some(&name)).await?.expect("the released job");
    assert_eq!(job.job_id().as_deref(), Some(id.as_str()));
    assert_eq!(job.attempts(), 2);

    queue.ack(&job).await?;
    settle().await;
    assert_eq!(queue.size(Some(&name)).await?, 0);

    queue.delete_queue(&name, false, false).await?;
    queue.close().await
}

#[tokio::test]
async fn delayed_job_lands_after_ttl() -> Result<(), QueueError> {
    let Some(config) = broker_config() else {
        return Ok(());
    };
    let mut queue = RabbitMQQueue::new(config);
    let name = random_name();

    queue.later(Duration::from_secs(1), json!(1), Some(&name)).await?;
    assert_eq!(queue.size(Some(&name)).await?, 0);
    assert!(queue.is_queue_declared(&queue.namer().delay_queue_name(&name, 1000)));

    tokio::time::sleep(Duration::from_millis(2000)).await;
    assert_eq!(queue.size(Some(&name)).await?, 1);

    queue.delete_queue(&name, false, false).await?;
    queue.close().await
}

#[tokio::test]
async fn failed_job_is_rerouted() -> Result<(), QueueError> {
    let Some(mut config) = broker_config() else {
        return Ok(());
    };
    let name = random_name();
    let failed_exchange = format!("{name}-failed");
    config.queue.exchange = None;
    config.queue.reroute_failed = true;
    config.queue.failed_exchange = Some(failed_exchange.clone());
    let mut queue = RabbitMQQueue::new(config);
    let failed_queue = queue.namer().failed_routing_key(&name);

    queue.bulk([json!(1), json!(2)], Some(&name)).await?;
    settle().await;
    assert_eq!(queue.size(Some(&name)).await?, 2);

    let job = queue.pop(Some(&name)).await?.expect("a job");
    queue.fail(&job).await?;
    settle().await;

    assert_eq!(queue.size(Some(&name)).await?, 1);
    assert_eq!(queue.size(Some(&failed_queue)).await?, 1);
    assert_eq!(queue.purge(Some(&name)).await?, 1);

    queue.delete_queue(&name, false, false).await?;
    queue.delete_queue(&failed_queue, false, false).await?;
    queue.delete_exchange(&failed_exchange, false).await?;
    queue.close().await
}

#[tokio::test]
async fn redeclare_is_idempotent() -> Result<(), QueueError> {
    let Some(config) = broker_config() else {
        return Ok(());
    };
    let mut queue = RabbitMQQueue::new(config);
    let name = random_name();
    let exchange = format!("{name}-x");
    let binding = QueueBinding::new(&name).exchange(&exchange).routing_key(&name);

    for _ in 0..2 {
        queue.declare_exchange(&exchange, Some(ExchangeKind::Topic)).await?;
        queue.declare_queue(&name, true, false, None).await?;
        queue.bind_queue(&binding).await?;
    }
    assert!(queue.is_exchange_exists(&exchange).await?);
    assert!(queue.is_queue_exists(&name).await?);
    assert!(queue.is_queue_bound(&binding));

    queue.delete_queue(&name, false, false).await?;
    assert!(!queue.is_queue_bound(&binding));
    queue.delete_exchange(&exchange, false).await?;
    queue.close().await
}

#[tokio::test]
async fn exchange_push_and_delay_route_to_bound_queue() -> Result<(), QueueError> {
    let Some(mut config) = broker_config() else {
        return Ok(());
    };
    let name = random_name();
    let exchange = format!("{name}-x");
    config.queue.exchange = Some(exchange.clone());
    config.queue.exchange_type = ExchangeKind::Topic;
    config.queue.exchange_routing_key = "process.%s".to_owned();
    config.queue.reroute_failed = false;
    let mut queue = RabbitMQQueue::new(config);

    queue.push(json!(1), Some(&name)).await?;
    settle().await;
    assert_eq!(queue.size(Some(&name)).await?, 1);
    assert!(queue.is_queue_bound(
        &QueueBinding::new(&name)
            .exchange(&exchange)
            .routing_key(&format!("process.{name}"))
    ));

    queue.later(Duration::from_secs(1), json!(2), Some(&name)).await?;
    assert_eq!(queue.size(Some(&name)).await?, 1);

    tokio::time::sleep(Duration::from_millis(2000)).await;
    assert_eq!(queue.size(Some(&name)).await?, 2);

    queue.delete_queue(&name, false, false).await?;
    queue.delete_exchange(&exchange, false).await?;
    queue.close().await
}

#[tokio::test]
async fn one_queue_fed_through_two_exchanges() -> Result<(), QueueError> {
    let Some(mut config) = broker_config() else {
        return Ok(());
    };
    let name = random_name();
    let primary = format!("{name}-x");
    let audit = format!("{name}-audit");
    config.queue.exchange = Some(primary.clone());
    config.queue.exchange_type = ExchangeKind::Direct;
    config.queue.exchange_routing_key = "%s".to_owned();
    config.queue.reroute_failed = false;
    let mut queue = RabbitMQQueue::new(config);

    queue.push(json!(1), Some(&name)).await?;

    let options = PushOptions {
        exchange: Some(audit.clone()),
        ..PushOptions::default()
    };
    queue
        .push_raw(JobPayload::new(json!(2)).to_vec()?, Some(&name), options)
        .await?;
    settle().await;

    assert_eq!(queue.size(Some(&name)).await?, 2);
    assert!(queue.is_queue_bound(&QueueBinding::new(&name).exchange(&audit).routing_key(&name)));

    queue.delete_queue(&name, false, false).await?;
    queue.delete_exchange(&primary, false).await?;
    queue.delete_exchange(&audit, false).await?;
    queue.close().await
}
