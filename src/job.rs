// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Fetched Jobs
//!
//! A [`RabbitMQJob`] is one message taken from a queue with `basic.get`. It
//! stays unacknowledged until the driver acks, rejects, releases or fails
//! it; its delivery tag is only valid on the channel it was fetched from.

use crate::{
    errors::QueueError,
    otel,
    publisher::{payload_id, JobPayload, AMQP_HEADERS_ATTEMPTS},
};
use lapin::{
    message::BasicGetMessage,
    protocol::basic::AMQPProperties,
    types::AMQPValue,
};
use opentelemetry::{
    global::{BoxedSpan, BoxedTracer},
    Context,
};
use serde::de::DeserializeOwned;

/// A job fetched from the broker and awaiting acknowledgement.
#[derive(Debug)]
pub struct RabbitMQJob {
    queue: String,
    delivery_tag: u64,
    redelivered: bool,
    data: Vec<u8>,
    properties: AMQPProperties,
    message_count: u32,
    context: Context,
}

impl RabbitMQJob {
    pub(crate) fn new(queue: &str, message: BasicGetMessage) -> RabbitMQJob {
        let delivery = &message.delivery;

        RabbitMQJob::from_parts(
            queue,
            delivery.delivery_tag,
            delivery.redelivered,
            delivery.data.clone(),
            delivery.properties.clone(),
            message.message_count,
        )
    }

    pub(crate) fn from_parts(
        queue: &str,
        delivery_tag: u64,
        redelivered: bool,
        data: Vec<u8>,
        properties: AMQPProperties,
        message_count: u32,
    ) -> RabbitMQJob {
        let context = otel::extract_context(&properties);

        RabbitMQJob {
            queue: queue.to_owned(),
            delivery_tag,
            redelivered,
            data,
            properties,
            message_count,
            context,
        }
    }

    /// The queue the job was fetched from.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn payload(&self) -> &[u8] {
        &self.data
    }

    /// Decodes the JSON envelope of the job.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<JobPayload<T>, QueueError> {
        JobPayload::from_slice(&self.data)
    }

    /// The job id: the message correlation id, or the id in the payload.
    pub fn job_id(&self) -> Option<String> {
        self.properties
            .correlation_id()
            .as_ref()
            .map(|id| id.as_str().to_owned())
            .or_else(|| payload_id(&self.data))
    }

    /// Attempts made so far, this delivery included.
    pub fn attempts(&self) -> u32 {
        previous_attempts(&self.properties).saturating_add(1)
    }

    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    pub fn is_redelivered(&self) -> bool {
        self.redelivered
    }

    pub fn priority(&self) -> Option<u8> {
        *self.properties.priority()
    }

    pub fn properties(&self) -> &AMQPProperties {
        &self.properties
    }

    /// Messages left in the queue when this one was fetched.
    pub fn message_count(&self) -> u32 {
        self.message_count
    }

    /// The trace context of the producer that enqueued the job.
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Starts a consumer span for processing the job, child of the
    /// producer's trace.
    pub fn span(&self, tracer: &BoxedTracer) -> BoxedSpan {
        otel::new_span(&self.context, tracer, &self.queue)
    }
}

/// Reads the attempts header written when the job was published.
fn previous_attempts(props: &AMQPProperties) -> u32 {
    let Some(value) = props
        .headers()
        .as_ref()
        .and_then(|headers| headers.inner().get(AMQP_HEADERS_ATTEMPTS))
    else {
        return 0;
    };

    let attempts = match value {
        AMQPValue::ShortShortUInt(v) => i64::from(*v),
        AMQPValue::ShortUInt(v) => i64::from(*v),
        AMQPValue::LongUInt(v) => i64::from(*v),
        AMQPValue::ShortShortInt(v) => i64::from(*v),
        AMQPValue::ShortInt(v) => i64::from(*v),
        AMQPValue::LongInt(v) => i64::from(*v),
        AMQPValue::LongLongInt(v) => *v,
        _ => 0,
    };

    u32::try_from(attempts).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use lapin::types::{FieldTable, LongString, ShortString};
    use serde_json::{json, Value};

    fn job_with(headers: FieldTable, data: Vec<u8>) -> RabbitMQJob {
        let props = AMQPProperties::default().with_headers(headers);
        RabbitMQJob::from_parts("mail", 7, false, data, props, 3)
    }

    fn attempts_header(value: AMQPValue) -> FieldTable {
        let mut table = FieldTable::default();
        table.insert(ShortString::from(AMQP_HEADERS_ATTEMPTS), value);
        table
    }

    #[test]
    fn first_delivery_is_attempt_one() {
        let job = job_with(FieldTable::default(), vec![]);

        assert_eq!(job.attempts(), 1);
        assert_eq!(job.delivery_tag(), 7);
        assert_eq!(job.message_count(), 3);
        assert_eq!(job.queue(), "mail");
    }

    #[test]
    fn attempts_header_is_read_from_any_integer_type() {
        assert_eq!(
            job_with(attempts_header(AMQPValue::LongLongInt(2)), vec![]).attempts(),
            3
        );
        assert_eq!(
            job_with(attempts_header(AMQPValue::ShortShortUInt(4)), vec![]).attempts(),
            5
        );
        assert_eq!(
            job_with(attempts_header(AMQPValue::LongInt(-1)), vec![]).attempts(),
            1
        );
        assert_eq!(
            job_with(
                attempts_header(AMQPValue::LongString(LongString::from("2"))),
                vec![]
            )
            .attempts(),
            1
        );
    }

    #[test]
    fn job_id_falls_back_to_payload() {
        let payload = JobPayload::new(json!({"user": 1})).to_vec().unwrap();
        let job = job_with(FieldTable::default(), payload);

        let decoded: JobPayload<Value> = job.decode().unwrap();
        assert_eq!(job.job_id(), Some(decoded.id));
        assert_eq!(decoded.data, json!({"user": 1}));

        let props = AMQPProperties::default().with_correlation_id(ShortString::from("abc"));
        let job = RabbitMQJob::from_parts("mail", 1, true, b"{}".to_vec(), props, 0);
        assert_eq!(job.job_id().as_deref(), Some("abc"));
        assert!(job.is_redelivered());
    }

    #[test]
    fn undecodable_payload_is_a_serialization_error() {
        let job = job_with(FieldTable::default(), b"not json".to_vec());

        assert!(matches!(
            job.decode::<Value>(),
            Err(QueueError::Serialization(_))
        ));
    }
}
