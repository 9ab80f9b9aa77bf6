// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Queue Driver
//!
//! [`RabbitMQQueue`] is the façade producers and workers use. It resolves
//! names through the [`TopologyNamer`], makes sure the topology a message
//! needs exists, and runs every broker operation on the single channel of
//! its [`AmqpConnection`] through the retry-once reconnect policy.
//!
//! Publishing topology:
//! - with an exchange: the exchange is declared, and the job queue is
//!   declared and bound to it with the routing key;
//! - without an exchange: messages go through the default exchange to the
//!   queue named by the routing key;
//! - with failed-job rerouting: the failed exchange and a failed queue
//!   bound with the failed routing key are declared as well;
//! - delayed jobs go to a per-delay TTL queue that dead-letters into the
//!   job queue once the delay elapsed.

use crate::{
    channel::AmqpConnection,
    contracts::Queue,
    config::{Config, QueueConfig},
    errors::QueueError,
    exchange::{ExchangeDefinition, ExchangeKind},
    job::RabbitMQJob,
    publisher::{self, JobPayload, OutgoingMessage},
    queue::{QueueArguments, QueueBinding, QueueDefinition},
    reconnect::retry_once,
    topology::{TopologyNamer, AMQP_HEADERS_QUEUE_TYPE, DEFAULT_EXCHANGE, QUORUM_QUEUE_TYPE},
};
use async_trait::async_trait;
use futures_util::future::try_join_all;
use lapin::{
    options::{
        BasicAckOptions, BasicGetOptions, BasicRejectOptions, ExchangeDeleteOptions,
        QueueBindOptions, QueueDeleteOptions, QueuePurgeOptions,
    },
    types::FieldTable,
    Channel,
};
use opentelemetry::Context;
use serde::Serialize;
use std::{collections::HashSet, time::Duration};
use tracing::{debug, error, info, warn};

/// Per-push overrides of the configured topology.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushOptions {
    /// Exchange to publish to; `Some("")` forces the default exchange.
    pub exchange: Option<String>,
    pub exchange_type: Option<String>,
    /// Attempts already made, carried in the message headers.
    pub attempts: u32,
    pub priority: Option<u8>,
}

/// Job queue driver over a single AMQP connection and channel.
///
/// Not meant to be shared: every operation takes `&mut self`, so one driver
/// runs one broker operation at a time. Use one driver per worker.
pub struct RabbitMQQueue {
    connection: AmqpConnection,
    namer: TopologyNamer,
    exchanges: HashSet<String>,
    queues: HashSet<String>,
    bindings: HashSet<QueueBinding>,
}

impl RabbitMQQueue {
    /// Creates a driver. Nothing is connected until the first operation.
    pub fn new(config: Config) -> RabbitMQQueue {
        RabbitMQQueue {
            connection: AmqpConnection::new(config.connection),
            namer: TopologyNamer::new(config.queue),
            exchanges: HashSet::default(),
            queues: HashSet::default(),
            bindings: HashSet::default(),
        }
    }

    /// Creates a driver and, unless the configuration asks for a lazy
    /// connection, connects right away.
    pub async fn connect(config: Config) -> Result<RabbitMQQueue, QueueError> {
        let mut queue = RabbitMQQueue::new(config);
        if !queue.connection.config().lazy {
            queue.connection.connect().await?;
        }
        Ok(queue)
    }

    pub fn config(&self) -> &QueueConfig {
        self.namer.config()
    }

    pub fn namer(&self) -> &TopologyNamer {
        &self.namer
    }

    pub fn connection(&self) -> &AmqpConnection {
        &self.connection
    }

    pub fn connection_mut(&mut self) -> &mut AmqpConnection {
        &mut self.connection
    }

    pub async fn close(&mut self) -> Result<(), QueueError> {
        self.connection.close().await
    }

    pub fn is_exchange_declared(&self, name: &str) -> bool {
        self.exchanges.contains(name)
    }

    pub fn is_queue_declared(&self, name: &str) -> bool {
        self.queues.contains(name)
    }

    pub fn is_queue_bound(&self, binding: &QueueBinding) -> bool {
        self.bindings.contains(binding)
    }

    /// Checks whether an exchange exists without creating it.
    pub async fn is_exchange_exists(&mut self, name: &str) -> Result<bool, QueueError> {
        let def = ExchangeDefinition::new(name).passive();

        let result = retry_once(&mut self.connection, |channel| {
            let def = &def;
            async move { declare_exchange_on(&channel, def).await }
        })
        .await;

        match result {
            Ok(()) => Ok(true),
            Err(err) if err.is_not_found() => {
                debug!(exchange = name, "exchange does not exist");
                self.exchanges.remove(name);
                self.connection.reopen_channel().await?;
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    /// Declares a durable exchange. Declaring it again with the same type is
    /// a no-op on the broker.
    pub async fn declare_exchange(
        &mut self,
        name: &str,
        kind: Option<ExchangeKind>,
    ) -> Result<(), QueueError> {
        let def = ExchangeDefinition::new(name).kind(kind.unwrap_or_default());
        self.declare_exchange_definition(&def).await
    }

    pub async fn declare_exchange_definition(
        &mut self,
        def: &ExchangeDefinition,
    ) -> Result<(), QueueError> {
        retry_once(&mut self.connection, |channel| async move {
            declare_exchange_on(&channel, def).await
        })
        .await?;

        if !def.passive {
            self.exchanges.insert(def.name.clone());
        }
        Ok(())
    }

    pub async fn delete_exchange(&mut self, name: &str, if_unused: bool) -> Result<(), QueueError> {
        debug!(exchange = name, "deleting exchange");

        retry_once(&mut self.connection, |channel| async move {
            channel
                .exchange_delete(
                    name,
                    ExchangeDeleteOptions {
                        if_unused,
                        nowait: false,
                    },
                )
                .await
                .map_err(QueueError::from)
        })
        .await?;

        self.exchanges.remove(name);
        self.bindings.retain(|binding| binding.exchange_name != name);
        Ok(())
    }

    /// Checks whether a queue exists without creating it.
    pub async fn is_queue_exists(&mut self, name: &str) -> Result<bool, QueueError> {
        match self.queue_message_count(name).await? {
            Some(_) => Ok(true),
            None => {
                self.queues.remove(name);
                self.bindings.retain(|binding| binding.queue_name != name);
                Ok(false)
            }
        }
    }

    /// Declares a queue. Without explicit arguments, the configured job
    /// queue arguments are used.
    pub async fn declare_queue(
        &mut self,
        name: &str,
        durable: bool,
        auto_delete: bool,
        arguments: Option<QueueArguments>,
    ) -> Result<(), QueueError> {
        let arguments = arguments.unwrap_or_else(|| self.namer.queue_arguments(name));
        let def = QueueDefinition::new(name)
            .durable(durable)
            .auto_delete(auto_delete)
            .arguments(arguments);

        self.declare_queue_definition(&def).await
    }

    pub async fn declare_queue_definition(
        &mut self,
        def: &QueueDefinition,
    ) -> Result<(), QueueError> {
        retry_once(&mut self.connection, |channel| async move {
            declare_queue_on(&channel, def).await.map(|_| ())
        })
        .await?;

        if !def.passive {
            self.queues.insert(def.name.clone());
        }
        Ok(())
    }

    pub async fn delete_queue(
        &mut self,
        name: &str,
        if_unused: bool,
        if_empty: bool,
    ) -> Result<u32, QueueError> {
        debug!(queue = name, "deleting queue");

        let deleted = retry_once(&mut self.connection, |channel| async move {
            channel
                .queue_delete(
                    name,
                    QueueDeleteOptions {
                        if_unused,
                        if_empty,
                        nowait: false,
                    },
                )
                .await
                .map_err(QueueError::from)
        })
        .await?;

        self.queues.remove(name);
        self.bindings.retain(|binding| binding.queue_name != name);
        Ok(deleted)
    }

    pub async fn bind_queue(&mut self, binding: &QueueBinding) -> Result<(), QueueError> {
        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            binding.queue_name, binding.exchange_name, binding.routing_key
        );

        retry_once(&mut self.connection, |channel| async move {
            channel
                .queue_bind(
                    &binding.queue_name,
                    &binding.exchange_name,
                    &binding.routing_key,
                    QueueBindOptions { nowait: false },
                    FieldTable::default(),
                )
                .await
                .map_err(|err| {
                    error!(error = err.to_string(), "error to bind queue to exchange");
                    match QueueError::from(err) {
                        QueueError::Protocol(_) => QueueError::BindingExchangeToQueueError(
                            binding.exchange_name.clone(),
                            binding.queue_name.clone(),
                        ),
                        other => other,
                    }
                })
        })
        .await?;

        self.bindings.insert(binding.clone());
        Ok(())
    }

    /// Number of ready messages in the queue; a missing queue holds none.
    pub async fn size(&mut self, queue: Option<&str>) -> Result<u32, QueueError> {
        let queue = self.namer.queue(queue).to_owned();
        Ok(self.queue_message_count(&queue).await?.unwrap_or_default())
    }

    /// Removes every ready message from the queue and keeps the queue.
    pub async fn purge(&mut self, queue: Option<&str>) -> Result<u32, QueueError> {
        let queue = self.namer.queue(queue).to_owned();

        let result = retry_once(&mut self.connection, |channel| {
            let queue = queue.as_str();
            async move {
                channel
                    .queue_purge(queue, QueuePurgeOptions { nowait: false })
                    .await
                    .map_err(QueueError::from)
            }
        })
        .await;

        match result {
            Ok(purged) => {
                debug!(queue = queue.as_str(), purged, "queue purged");
                Ok(purged)
            }
            Err(err) if err.is_not_found() => {
                self.connection.reopen_channel().await?;
                Ok(0)
            }
            Err(err) => Err(err),
        }
    }

    /// Wraps `data` in a job envelope and publishes it. Returns the job id.
    pub async fn push<T: Serialize>(
        &mut self,
        data: T,
        queue: Option<&str>,
    ) -> Result<String, QueueError> {
        let job = JobPayload::new(data);
        self.push_raw(job.to_vec()?, queue, PushOptions::default())
            .await?;
        Ok(job.id)
    }

    /// Publishes an already serialized payload, declaring whatever topology
    /// it needs first. Returns the correlation id found in the payload.
    pub async fn push_raw(
        &mut self,
        payload: Vec<u8>,
        queue: Option<&str>,
        options: PushOptions,
    ) -> Result<Option<String>, QueueError> {
        let queue = self.namer.queue(queue).to_owned();
        let routing_key = self.namer.routing_key(&queue);
        let exchange = self.namer.exchange(options.exchange.as_deref());
        let kind = self.namer.exchange_type(options.exchange_type.as_deref())?;

        self.declare_destination(&queue, &routing_key, exchange.as_deref(), kind)
            .await?;

        let message = OutgoingMessage::new(
            payload,
            options.attempts,
            options.priority,
            self.namer.config(),
            &Context::current(),
        );

        self.publish_confirmed(
            exchange.as_deref().unwrap_or(DEFAULT_EXCHANGE),
            &routing_key,
            &message,
        )
        .await?;

        Ok(message.correlation_id)
    }

    /// Publishes a job that becomes available after `delay`.
    pub async fn later<T: Serialize>(
        &mut self,
        delay: Duration,
        data: T,
        queue: Option<&str>,
    ) -> Result<String, QueueError> {
        let job = JobPayload::new(data);
        self.later_raw(delay, job.to_vec()?, queue, 0).await?;
        Ok(job.id)
    }

    /// Publishes a payload to the delay queue of `queue` for `delay`.
    ///
    /// The delay queue has no consumer: the broker expires the message after
    /// the TTL and dead-letters it into the job queue. A zero delay is a
    /// plain push.
    pub async fn later_raw(
        &mut self,
        delay: Duration,
        payload: Vec<u8>,
        queue: Option<&str>,
        attempts: u32,
    ) -> Result<Option<String>, QueueError> {
        let ttl = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
        if ttl <= 0 {
            let options = PushOptions {
                attempts,
                ..PushOptions::default()
            };
            return self.push_raw(payload, queue, options).await;
        }

        let queue = self.namer.queue(queue).to_owned();
        let routing_key = self.namer.routing_key(&queue);
        let exchange = self.namer.exchange(None);
        let kind = self.namer.exchange_type(None)?;

        // Expired messages need their target to exist.
        self.declare_destination(&queue, &routing_key, exchange.as_deref(), kind)
            .await?;

        let destination = self.namer.delay_queue_name(&queue, ttl);
        if !self.queues.contains(&destination) {
            let arguments = self.namer.delay_queue_arguments(&queue, ttl);
            self.declare_queue(&destination, true, false, Some(arguments))
                .await?;
        }

        let message = OutgoingMessage::new(
            payload,
            attempts,
            None,
            self.namer.config(),
            &Context::current(),
        );

        self.publish_confirmed(DEFAULT_EXCHANGE, &destination, &message)
            .await?;

        debug!(
            queue = queue.as_str(),
            delay_queue = destination.as_str(),
            ttl,
            "delayed job published"
        );
        Ok(message.correlation_id)
    }

    /// Wraps and publishes many jobs, then waits for all the confirms.
    pub async fn bulk<T, I>(&mut self, jobs: I, queue: Option<&str>) -> Result<Vec<String>, QueueError>
    where
        T: Serialize,
        I: IntoIterator<Item = T>,
    {
        let jobs = jobs.into_iter().map(JobPayload::new).collect::<Vec<_>>();
        let payloads = jobs
            .iter()
            .map(JobPayload::to_vec)
            .collect::<Result<Vec<_>, _>>()?;

        self.bulk_raw(payloads, queue, PushOptions::default())
            .await?;

        Ok(jobs.into_iter().map(|job| job.id).collect())
    }

    /// Publishes many payloads to one queue, then waits for all the
    /// confirms. A reconnect retry republishes the whole batch.
    pub async fn bulk_raw(
        &mut self,
        payloads: Vec<Vec<u8>>,
        queue: Option<&str>,
        options: PushOptions,
    ) -> Result<Vec<Option<String>>, QueueError> {
        let queue = self.namer.queue(queue).to_owned();
        let routing_key = self.namer.routing_key(&queue);
        let exchange = self.namer.exchange(options.exchange.as_deref());
        let kind = self.namer.exchange_type(options.exchange_type.as_deref())?;

        self.declare_destination(&queue, &routing_key, exchange.as_deref(), kind)
            .await?;

        let ctx = Context::current();
        let messages = payloads
            .into_iter()
            .map(|payload| {
                OutgoingMessage::new(
                    payload,
                    options.attempts,
                    options.priority,
                    self.namer.config(),
                    &ctx,
                )
            })
            .collect::<Vec<_>>();

        let exchange = exchange.as_deref().unwrap_or(DEFAULT_EXCHANGE);
        let pending = retry_once(&mut self.connection, |channel| {
            let (messages, routing_key) = (&messages, routing_key.as_str());
            async move {
                let mut pending = Vec::with_capacity(messages.len());
                for message in messages {
                    pending.push(
                        publisher::publish(&channel, exchange, routing_key, message, true).await?,
                    );
                }
                Ok(pending)
            }
        })
        .await?;

        try_join_all(
            pending
                .into_iter()
                .map(|confirm| publisher::confirm(confirm, routing_key.clone())),
        )
        .await?;

        info!(queue = queue.as_str(), published = messages.len(), "bulk published");
        Ok(messages
            .into_iter()
            .map(|message| message.correlation_id)
            .collect())
    }

    /// Fetches one job without waiting. Returns `None` when the queue is
    /// empty or does not exist.
    pub async fn pop(&mut self, queue: Option<&str>) -> Result<Option<RabbitMQJob>, QueueError> {
        let queue = self.namer.queue(queue).to_owned();

        let result = retry_once(&mut self.connection, |channel| {
            let queue = queue.as_str();
            async move {
                channel
                    .basic_get(queue, BasicGetOptions { no_ack: false })
                    .await
                    .map_err(QueueError::from)
            }
        })
        .await;

        match result {
            Ok(Some(message)) => Ok(Some(RabbitMQJob::new(&queue, message))),
            Ok(None) => Ok(None),
            Err(err) if err.is_not_found() => {
                // The broker closed the channel along with the 404.
                warn!(queue = queue.as_str(), "popping from a queue that does not exist");
                self.connection.reopen_channel().await?;
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Acknowledges a job, removing it from its queue.
    pub async fn ack(&mut self, job: &RabbitMQJob) -> Result<(), QueueError> {
        let channel = self.connection.ensure_connected().await?;

        channel
            .basic_ack(job.delivery_tag(), BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                QueueError::AckMessageError
            })
    }

    /// Rejects a job. Without requeue, the broker dead-letters it when the
    /// queue has dead-letter arguments and drops it otherwise.
    pub async fn reject(&mut self, job: &RabbitMQJob, requeue: bool) -> Result<(), QueueError> {
        let channel = self.connection.ensure_connected().await?;

        channel
            .basic_reject(job.delivery_tag(), BasicRejectOptions { requeue })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling reject msg");
                QueueError::RejectMessageError
            })
    }

    /// Puts a job back on its queue after `delay`, counting one more
    /// attempt, and acknowledges the current delivery.
    pub async fn release(&mut self, job: &RabbitMQJob, delay: Duration) -> Result<(), QueueError> {
        warn!(queue = job.queue(), attempts = job.attempts(), "releasing job");

        self.later_raw(delay, job.payload().to_vec(), Some(job.queue()), job.attempts())
            .await?;
        self.ack(job).await
    }

    /// Marks a job as failed: it is rejected without requeue, so a queue
    /// with failed-job rerouting dead-letters it to the failed exchange.
    pub async fn fail(&mut self, job: &RabbitMQJob) -> Result<(), QueueError> {
        if self.namer.config().is_reroute_failed() {
            let failed_routing_key = self.namer.failed_routing_key(job.queue());
            error!(
                queue = job.queue(),
                failed_routing_key = failed_routing_key.as_str(),
                "job failed, rerouting"
            );
        } else {
            error!(queue = job.queue(), "job failed, dropping");
        }

        self.reject(job, false).await
    }

    /// Passive declare returning the message count, `None` when the queue
    /// does not exist.
    async fn queue_message_count(&mut self, name: &str) -> Result<Option<u32>, QueueError> {
        let def = QueueDefinition::new(name).passive();

        let result = retry_once(&mut self.connection, |channel| {
            let def = &def;
            async move { declare_queue_on(&channel, def).await }
        })
        .await;

        match result {
            Ok(queue) => Ok(Some(queue.message_count())),
            Err(err) if err.is_not_found() => {
                debug!(queue = name, "queue does not exist");
                self.connection.reopen_channel().await?;
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    async fn declare_destination(
        &mut self,
        queue: &str,
        routing_key: &str,
        exchange: Option<&str>,
        kind: ExchangeKind,
    ) -> Result<(), QueueError> {
        self.declare_failed_destination(queue).await?;

        let Some(exchange) = exchange else {
            return self.ensure_queue(routing_key, queue).await;
        };

        if !self.exchanges.contains(exchange) {
            self.declare_exchange(exchange, Some(kind)).await?;
        }

        self.ensure_queue(queue, queue).await?;

        let binding = QueueBinding::new(queue)
            .exchange(exchange)
            .routing_key(routing_key);
        if !self.bindings.contains(&binding) {
            self.bind_queue(&binding).await?;
        }

        Ok(())
    }

    /// Declares `name` with the job queue arguments of `queue` unless it
    /// already exists.
    async fn ensure_queue(&mut self, name: &str, queue: &str) -> Result<(), QueueError> {
        if self.queues.contains(name) {
            return Ok(());
        }

        if self.is_queue_exists(name).await? {
            self.queues.insert(name.to_owned());
            return Ok(());
        }

        let arguments = self.namer.queue_arguments(queue);
        self.declare_queue(name, true, false, Some(arguments)).await
    }

    async fn declare_failed_destination(&mut self, queue: &str) -> Result<(), QueueError> {
        if !self.namer.config().is_reroute_failed() {
            return Ok(());
        }
        let Some(failed_exchange) = self.namer.failed_exchange(None) else {
            return Ok(());
        };

        let failed_queue = self.namer.failed_routing_key(queue);
        let binding = QueueBinding::new(&failed_queue)
            .exchange(&failed_exchange)
            .routing_key(&failed_queue);
        if self.bindings.contains(&binding) {
            return Ok(());
        }

        if !self.exchanges.contains(&failed_exchange) {
            let kind = self.namer.config().exchange_type;
            self.declare_exchange(&failed_exchange, Some(kind)).await?;
        }

        if !self.queues.contains(&failed_queue) {
            let mut arguments = QueueArguments::new();
            if self.namer.config().is_quorum() {
                arguments = arguments.with_str(AMQP_HEADERS_QUEUE_TYPE, QUORUM_QUEUE_TYPE);
            }
            self.declare_queue(&failed_queue, true, false, Some(arguments))
                .await?;
        }

        self.bind_queue(&binding).await
    }

    async fn publish_confirmed(
        &mut self,
        exchange: &str,
        routing_key: &str,
        message: &OutgoingMessage,
    ) -> Result<(), QueueError> {
        let pending = retry_once(&mut self.connection, |channel| async move {
            publisher::publish(&channel, exchange, routing_key, message, true).await
        })
        .await?;

        publisher::confirm(pending, routing_key.to_owned()).await
    }
}

#[async_trait]
impl Queue for RabbitMQQueue {
    async fn size(&mut self, queue: Option<&str>) -> Result<u32, QueueError> {
        RabbitMQQueue::size(self, queue).await
    }

    async fn push_raw(
        &mut self,
        payload: Vec<u8>,
        queue: Option<&str>,
        options: PushOptions,
    ) -> Result<Option<String>, QueueError> {
        RabbitMQQueue::push_raw(self, payload, queue, options).await
    }

    async fn later_raw(
        &mut self,
        delay: Duration,
        payload: Vec<u8>,
        queue: Option<&str>,
        attempts: u32,
    ) -> Result<Option<String>, QueueError> {
        RabbitMQQueue::later_raw(self, delay, payload, queue, attempts).await
    }

    async fn pop(&mut self, queue: Option<&str>) -> Result<Option<RabbitMQJob>, QueueError> {
        RabbitMQQueue::pop(self, queue).await
    }

    async fn purge(&mut self, queue: Option<&str>) -> Result<u32, QueueError> {
        RabbitMQQueue::purge(self, queue).await
    }

    async fn ack(&mut self, job: &RabbitMQJob) -> Result<(), QueueError> {
        RabbitMQQueue::ack(self, job).await
    }

    async fn release(&mut self, job: &RabbitMQJob, delay: Duration) -> Result<(), QueueError> {
        RabbitMQQueue::release(self, job, delay).await
    }

    async fn fail(&mut self, job: &RabbitMQJob) -> Result<(), QueueError> {
        RabbitMQQueue::fail(self, job).await
    }
}

async fn declare_exchange_on(channel: &Channel, def: &ExchangeDefinition) -> Result<(), QueueError> {
    debug!("creating exchange: {}", def.name);

    channel
        .exchange_declare(
            &def.name,
            def.kind.into(),
            def.options(),
            FieldTable::default(),
        )
        .await
        .map_err(|err| match QueueError::from(err) {
            QueueError::Protocol(msg) => {
                error!(error = msg.as_str(), name = def.name.as_str(), "error to declare the exchange");
                QueueError::DeclareExchangeError(def.name.clone())
            }
            other => other,
        })
}

async fn declare_queue_on(
    channel: &Channel,
    def: &QueueDefinition,
) -> Result<lapin::Queue, QueueError> {
    debug!("creating queue: {}", def.name);

    channel
        .queue_declare(&def.name, def.options(), FieldTable::from(&def.arguments))
        .await
        .map_err(|err| match QueueError::from(err) {
            QueueError::Protocol(msg) => {
                error!(error = msg.as_str(), name = def.name.as_str(), "error to declare the queue");
                QueueError::DeclareQueueError(def.name.clone())
            }
            other => other,
        })
}
