// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Job Message Publishing
//!
//! This module builds the AMQP message for a job payload and publishes it.
//! Every message is persistent JSON, carries the job id as correlation id,
//! a fresh message id, the number of attempts already made, the caller's
//! trace context and, when priorities apply, a priority capped to the
//! queue's maximum.

use crate::{config::QueueConfig, errors::QueueError, otel::RabbitMQTracePropagator};
use lapin::{
    options::BasicPublishOptions,
    publisher_confirm::{Confirmation, PublisherConfirm},
    types::{AMQPValue, FieldTable, LongLongInt, ShortString},
    BasicProperties, Channel,
};
use opentelemetry::{global, Context};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";
/// AMQP delivery mode of messages written to disk by the broker
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;
/// Header carrying how many times the job was already attempted
pub const AMQP_HEADERS_ATTEMPTS: &str = "attempts";

/// The JSON envelope a job travels in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPayload<T> {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub data: T,
}

impl<T: Serialize> JobPayload<T> {
    pub fn new(data: T) -> JobPayload<T> {
        JobPayload {
            id: Uuid::new_v4().to_string(),
            display_name: None,
            data,
        }
    }

    pub fn display_name(mut self, name: &str) -> Self {
        self.display_name = Some(name.to_owned());
        self
    }

    pub fn to_vec(&self) -> Result<Vec<u8>, QueueError> {
        Ok(serde_json::to_vec(self)?)
    }
}

impl<T: DeserializeOwned> JobPayload<T> {
    pub fn from_slice(raw: &[u8]) -> Result<JobPayload<T>, QueueError> {
        Ok(serde_json::from_slice(raw)?)
    }
}

#[derive(Deserialize)]
struct PayloadId {
    id: Option<String>,
}

/// Extracts the job id from a raw payload, when it is a JSON envelope.
pub fn payload_id(payload: &[u8]) -> Option<String> {
    serde_json::from_slice::<PayloadId>(payload)
        .ok()
        .and_then(|p| p.id)
        .filter(|id| !id.is_empty())
}

/// A message ready to be published.
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub(crate) payload: Vec<u8>,
    pub(crate) properties: BasicProperties,
    pub(crate) correlation_id: Option<String>,
}

impl OutgoingMessage {
    /// Builds the message for `payload`.
    ///
    /// The priority is the explicit one if given, otherwise the attempt count
    /// when delayed jobs are prioritized. It never exceeds the queue maximum.
    pub fn new(
        payload: Vec<u8>,
        attempts: u32,
        priority: Option<u8>,
        config: &QueueConfig,
        ctx: &Context,
    ) -> OutgoingMessage {
        let mut headers = BTreeMap::<ShortString, AMQPValue>::default();

        global::get_text_map_propagator(|propagator| {
            propagator.inject_context(ctx, &mut RabbitMQTracePropagator::new(&mut headers))
        });

        headers.insert(
            ShortString::from(AMQP_HEADERS_ATTEMPTS),
            AMQPValue::LongLongInt(LongLongInt::from(attempts)),
        );

        let correlation_id = payload_id(&payload);

        let mut properties = BasicProperties::default()
            .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
            .with_delivery_mode(PERSISTENT_DELIVERY_MODE)
            .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
            .with_headers(FieldTable::from(headers));

        if let Some(id) = &correlation_id {
            properties = properties.with_correlation_id(ShortString::from(id.as_str()));
        }

        let priority = priority.or_else(|| {
            config
                .is_prioritize_delayed()
                .then(|| u8::try_from(attempts).unwrap_or(u8::MAX))
        });
        if let Some(priority) = priority {
            properties = properties.with_priority(priority.min(config.queue_max_priority()));
        }

        OutgoingMessage {
            payload,
            properties,
            correlation_id,
        }
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn properties(&self) -> &BasicProperties {
        &self.properties
    }
}

/// Publishes a message and returns the pending publisher confirm.
pub(crate) async fn publish(
    channel: &Channel,
    exchange: &str,
    routing_key: &str,
    message: &OutgoingMessage,
    mandatory: bool,
) -> Result<PublisherConfirm, QueueError> {
    debug!(exchange, routing_key, "publishing message");

    channel
        .basic_publish(
            exchange,
            routing_key,
            BasicPublishOptions {
                mandatory,
                immediate: false,
            },
            &message.payload,
            message.properties.clone(),
        )
        .await
        .map_err(|err| {
            error!(error = err.to_string(), exchange, routing_key, "error publishing message");
            QueueError::from(err)
        })
}

/// Waits for the broker to confirm a published message.
pub(crate) async fn confirm(
    pending: PublisherConfirm,
    routing_key: String,
) -> Result<(), QueueError> {
    match pending.await.map_err(QueueError::from)? {
        Confirmation::Ack(Some(returned)) => {
            warn!(
                routing_key,
                reply = returned.reply_text.as_str(),
                "message returned as unroutable"
            );
            Err(QueueError::PublishingError(format!(
                "message to `{routing_key}` was returned: {}",
                returned.reply_text.as_str()
            )))
        }
        Confirmation::Nack(_) => {
            error!(routing_key, "publisher confirm nack");
            Err(QueueError::PublishNack(routing_key))
        }
        Confirmation::Ack(None) | Confirmation::NotRequested => Ok(()),
    }
}
