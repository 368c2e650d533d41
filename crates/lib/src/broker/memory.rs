//! In-process broker: publishes land in a buffer, deliveries are injected by
//! hand. Backs tests and standalone runs without a broker.

use crate::broker::{Broker, ConsumerBinding, ConsumerCallback};
use crate::errors::ObserverError;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// A recorded publish.
#[derive(Debug, Clone)]
pub struct PublishedMessage {
    pub vhost: String,
    pub target: String,
    pub payload: Value,
    pub expiration_ms: Option<u64>,
}

/// Broker double: records publishes and routes injected deliveries to bound
/// consumers.
#[derive(Default)]
pub struct MemoryBroker {
    published: Mutex<Vec<PublishedMessage>>,
    consumers: Mutex<HashMap<(String, String), ConsumerCallback>>,
}

impl MemoryBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Publishes recorded so far, in order.
    pub async fn published(&self) -> Vec<PublishedMessage> {
        self.published.lock().await.clone()
    }

    /// Publishes to one target, in order.
    pub async fn published_to(&self, target: &str) -> Vec<PublishedMessage> {
        self.published
            .lock()
            .await
            .iter()
            .filter(|p| p.target == target)
            .cloned()
            .collect()
    }

    /// Deliver a payload to the consumer bound on (vhost, target), as the
    /// broker would. No-op with a log when nothing is bound.
    pub async fn deliver(&self, vhost: &str, target: &str, payload: Value) {
        let callback = {
            let g = self.consumers.lock().await;
            g.get(&(vhost.to_string(), target.to_string())).cloned()
        };
        match callback {
            Some(cb) => cb(payload).await,
            None => log::debug!("memory broker: no consumer on {}{}", vhost, target),
        }
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(
        &self,
        vhost: &str,
        target: &str,
        payload: &Value,
        expiration_ms: Option<u64>,
    ) -> Result<(), ObserverError> {
        self.published.lock().await.push(PublishedMessage {
            vhost: vhost.to_string(),
            target: target.to_string(),
            payload: payload.clone(),
            expiration_ms,
        });
        Ok(())
    }

    async fn bind_consumer(
        &self,
        binding: ConsumerBinding,
        callback: ConsumerCallback,
    ) -> Result<(), ObserverError> {
        self.consumers
            .lock()
            .await
            .insert((binding.vhost.clone(), binding.target.clone()), callback);
        Ok(())
    }
}
