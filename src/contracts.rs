// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Contracts
//!
//! The object-safe surface a host job framework programs against. It lets
//! workers hold a `Box<dyn Queue>` and swap the broker driver in tests.

use crate::{driver::PushOptions, errors::QueueError, job::RabbitMQJob};
use async_trait::async_trait;
use std::time::Duration;

/// Generic job queue operations.
#[async_trait]
pub trait Queue: Send {
    async fn size(&mut self, queue: Option<&str>) -> Result<u32, QueueError>;

    async fn push_raw(
        &mut self,
        payload: Vec<u8>,
        queue: Option<&str>,
        options: PushOptions,
    ) -> Result<Option<String>, QueueError>;

    async fn later_raw(
        &mut self,
        delay: Duration,
        payload: Vec<u8>,
        queue: Option<&str>,
        attempts: u32,
    ) -> Result<Option<String>, QueueError>;

    async fn pop(&mut self, queue: Option<&str>) -> Result<Option<RabbitMQJob>, QueueError>;

    async fn purge(&mut self, queue: Option<&str>) -> Result<u32, QueueError>;

    async fn ack(&mut self, job: &RabbitMQJob) -> Result<(), QueueError>;

    async fn release(&mut self, job: &RabbitMQJob, delay: Duration) -> Result<(), QueueError>;

    async fn fail(&mut self, job: &RabbitMQJob) -> Result<(), QueueError>;
}
