// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

pub mod channel;
pub mod config;
pub mod contracts;
pub mod driver;
pub mod errors;
pub mod exchange;
pub mod job;
pub mod otel;
pub mod publisher;
pub mod queue;
pub mod reconnect;
pub mod topology;

pub use config::Config;
pub use contracts::Queue;
pub use driver::{PushOptions, RabbitMQQueue};
pub use errors::QueueError;
pub use job::RabbitMQJob;
