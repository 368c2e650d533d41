//! AMQP broker adapter (lapin).
//!
//! One lazily-opened connection+channel per virtual host, cached. Consumers
//! each run in their own task, acking and decoding JSON before invoking the
//! binding's callback.

use crate::broker::{Broker, ConsumerBinding, ConsumerCallback};
use crate::config::BrokerConfig;
use crate::errors::ObserverError;
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions,
    QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Connection, ConnectionProperties, ExchangeKind};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::Mutex;

/// Broker adapter over lapin.
pub struct AmqpBroker {
    host: String,
    port: u16,
    user: String,
    password: String,
    /// vhost -> open channel.
    channels: Mutex<HashMap<String, lapin::Channel>>,
}

impl AmqpBroker {
    pub fn new(config: &BrokerConfig, password: Option<String>) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            user: config.user.clone(),
            password: password.unwrap_or_default(),
            channels: Mutex::new(HashMap::new()),
        }
    }

    fn uri(&self, vhost: &str) -> String {
        // Vhost names carry a leading slash; percent-encode for the URI path.
        let encoded = vhost.replace('/', "%2f");
        format!(
            "amqp://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, encoded
        )
    }

    /// Cached channel for a vhost, (re)opening the connection when needed.
    async fn channel(&self, vhost: &str) -> Result<lapin::Channel, ObserverError> {
        let mut g = self.channels.lock().await;
        if let Some(ch) = g.get(vhost) {
            if ch.status().connected() {
                return Ok(ch.clone());
            }
            g.remove(vhost);
        }
        let conn = Connection::connect(&self.uri(vhost), ConnectionProperties::default()).await?;
        let ch = conn.create_channel().await?;
        g.insert(vhost.to_string(), ch.clone());
        log::info!("broker: opened channel on vhost {}", vhost);
        Ok(ch)
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn publish(
        &self,
        vhost: &str,
        target: &str,
        payload: &Value,
        expiration_ms: Option<u64>,
    ) -> Result<(), ObserverError> {
        let ch = self.channel(vhost).await?;
        let body = serde_json::to_vec(payload)
            .map_err(|e| ObserverError::Broker(format!("encoding payload: {}", e)))?;
        let mut props = BasicProperties::default().with_content_type("application/json".into());
        if let Some(ms) = expiration_ms {
            props = props.with_expiration(ms.to_string().into());
        }
        ch.basic_publish("", target, BasicPublishOptions::default(), &body, props)
            .await?;
        log::debug!("broker: published to {}{}", vhost, target);
        Ok(())
    }

    async fn bind_consumer(
        &self,
        binding: ConsumerBinding,
        callback: ConsumerCallback,
    ) -> Result<(), ObserverError> {
        let ch = self.channel(&binding.vhost).await?;

        let queue_name = if binding.fanout {
            ch.exchange_declare(
                &binding.target,
                ExchangeKind::Fanout,
                ExchangeDeclareOptions::default(),
                FieldTable::default(),
            )
            .await?;
            let queue = ch
                .queue_declare(
                    "",
                    QueueDeclareOptions {
                        exclusive: true,
                        ..QueueDeclareOptions::default()
                    },
                    FieldTable::default(),
                )
                .await?;
            ch.queue_bind(
                queue.name().as_str(),
                &binding.target,
                "",
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
            queue.name().as_str().to_string()
        } else {
            ch.queue_declare(
                &binding.target,
                QueueDeclareOptions::default(),
                FieldTable::default(),
            )
            .await?;
            binding.target.clone()
        };

        let tag = format!("{}-{}", binding.name, uuid::Uuid::new_v4().simple());
        let mut consumer = ch
            .basic_consume(
                &queue_name,
                &tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        let name = binding.name.clone();
        tokio::spawn(async move {
            log::info!("broker: consumer {} bound to {}", name, queue_name);
            while let Some(delivery) = consumer.next().await {
                let delivery = match delivery {
                    Ok(d) => d,
                    Err(e) => {
                        log::warn!("broker: consumer {} delivery error: {}", name, e);
                        continue;
                    }
                };
                if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                    log::warn!("broker: consumer {} ack failed: {}", name, e);
                }
                match serde_json::from_slice::<Value>(&delivery.data) {
                    Ok(payload) => callback(payload).await,
                    Err(e) => {
                        log::warn!("broker: consumer {} undecodable payload: {}", name, e);
                    }
                }
            }
            log::warn!("broker: consumer {} stream ended", name);
        });
        Ok(())
    }
}
