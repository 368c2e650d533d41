//! Broker adapter: named consumer bindings and fire-and-forget publishing
//! against a message-queue broker organized into virtual hosts.
//!
//! The observer owns one consumer per backend capability (AI response, STT,
//! TTS, bot shouts, prompt queues, translation, persona config, subminds
//! state) and a uniform publish operation with optional per-message
//! expiration.

mod amqp;
mod memory;

pub use amqp::AmqpBroker;
pub use memory::{MemoryBroker, PublishedMessage};

use crate::errors::ObserverError;
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde_json::Value;
use std::sync::Arc;

/// Async callback invoked with each decoded JSON delivery.
pub type ConsumerCallback = Arc<dyn Fn(Value) -> BoxFuture<'static, ()> + Send + Sync>;

/// One named consumer binding: a queue (or fanout exchange) in a vhost.
#[derive(Debug, Clone)]
pub struct ConsumerBinding {
    /// Logical name, used in logs and consumer tags.
    pub name: String,
    pub vhost: String,
    /// Queue name, or exchange name when `fanout` is set.
    pub target: String,
    /// Broadcast exchange: declares a per-process queue bound to a fanout
    /// exchange instead of consuming a shared queue.
    pub fanout: bool,
}

impl ConsumerBinding {
    pub fn queue(name: &str, vhost: &str, target: &str) -> Self {
        Self {
            name: name.to_string(),
            vhost: vhost.to_string(),
            target: target.to_string(),
            fanout: false,
        }
    }

    pub fn fanout(name: &str, vhost: &str, target: &str) -> Self {
        Self {
            name: name.to_string(),
            vhost: vhost.to_string(),
            target: target.to_string(),
            fanout: true,
        }
    }
}

/// Broker seam: publish and consume.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Fire-and-forget publish. `expiration_ms` lets the broker drop the
    /// message if undelivered past the deadline.
    async fn publish(
        &self,
        vhost: &str,
        target: &str,
        payload: &Value,
        expiration_ms: Option<u64>,
    ) -> Result<(), ObserverError>;

    /// Register a consumer. Each binding runs as its own worker; callback
    /// errors are logged, never fatal.
    async fn bind_consumer(
        &self,
        binding: ConsumerBinding,
        callback: ConsumerCallback,
    ) -> Result<(), ObserverError>;
}
