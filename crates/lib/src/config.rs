//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.observer/config.json`) and environment.
//! Covers the event channel, the broker (vhosts, queues, testing prefix), the
//! chat server API, and translation tunables.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Event-channel (chat server socket) settings.
    #[serde(default)]
    pub channel: ChannelConfig,

    /// Broker connection, vhosts, and queue names.
    #[serde(default)]
    pub broker: BrokerConfig,

    /// Chat server REST API (auth + lookups).
    #[serde(default)]
    pub server: ServerConfig,

    /// Translation correlation settings.
    #[serde(default)]
    pub translation: TranslationConfig,
}

/// Event-channel client settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelConfig {
    /// WebSocket URL of the chat server's event channel (default ws://127.0.0.1:8888/ws).
    #[serde(default = "default_channel_url")]
    pub url: String,

    /// Fixed reconnect delay in seconds (default 5).
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,

    /// Outbound queue capacity while disconnected (default 256). Enqueue
    /// backpressures when full.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Delay between re-emitted messages when draining the queue, in
    /// milliseconds (default 50).
    #[serde(default = "default_drain_pacing_ms")]
    pub drain_pacing_ms: u64,
}

fn default_channel_url() -> String {
    "ws://127.0.0.1:8888/ws".to_string()
}

fn default_reconnect_delay_secs() -> u64 {
    5
}

fn default_queue_capacity() -> usize {
    256
}

fn default_drain_pacing_ms() -> u64 {
    50
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            url: default_channel_url(),
            reconnect_delay_secs: default_reconnect_delay_secs(),
            queue_capacity: default_queue_capacity(),
            drain_pacing_ms: default_drain_pacing_ms(),
        }
    }
}

/// Broker connection and naming.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerConfig {
    #[serde(default = "default_broker_host")]
    pub host: String,

    #[serde(default = "default_broker_port")]
    pub port: u16,

    #[serde(default = "default_broker_user")]
    pub user: String,

    /// Overridden by OBSERVER_BROKER_PASSWORD env when set.
    #[serde(default)]
    pub password: Option<String>,

    /// When true, vhost names are rewritten `/x` -> `/<prefix>_x` for test isolation.
    #[serde(default)]
    pub testing: bool,

    /// Prefix used in testing mode (default "test").
    #[serde(default = "default_testing_prefix")]
    pub testing_prefix: String,

    /// Named virtual hosts. Keys are logical names ("neon", "chatbots",
    /// "translation"); values carry a leading slash.
    #[serde(default = "default_vhosts")]
    pub vhosts: HashMap<String, String>,

    /// Queue/exchange names keyed by purpose. Defaults cover every binding
    /// the observer registers.
    #[serde(default = "default_queues")]
    pub queues: HashMap<String, String>,

    /// Expiration for controller-bound publishes, in milliseconds (default 3000).
    #[serde(default = "default_controller_expiration_ms")]
    pub controller_expiration_ms: u64,
}

fn default_broker_host() -> String {
    "127.0.0.1".to_string()
}

fn default_broker_port() -> u16 {
    5672
}

fn default_broker_user() -> String {
    "guest".to_string()
}

fn default_testing_prefix() -> String {
    "test".to_string()
}

fn default_vhosts() -> HashMap<String, String> {
    [
        ("neon", "/neon_chat_api"),
        ("chatbots", "/chatbots"),
        ("translation", "/translation"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

fn default_queues() -> HashMap<String, String> {
    [
        ("neon_input", "neon_chat_api_request"),
        ("ai_response", "neon_chat_api_response"),
        ("ai_response_error", "neon_chat_api_error"),
        ("stt_response", "neon_stt_response"),
        ("tts_response", "neon_tts_response"),
        ("bot_shout", "chatbot_response"),
        ("controller_input", "external_shout"),
        ("prompt_save", "save_prompt"),
        ("prompt_new", "new_prompt"),
        ("prompt_get", "get_prompt"),
        ("prompt_complete", "set_prompt_completed"),
        ("prompt_data_request", "request_prompt_data"),
        ("translation_request", "request_translations"),
        ("translation_response", "get_translations"),
        ("persona_config", "get_configured_personas"),
        ("subminds_state", "subminds_state"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

fn default_controller_expiration_ms() -> u64 {
    3000
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: default_broker_host(),
            port: default_broker_port(),
            user: default_broker_user(),
            password: None,
            testing: false,
            testing_prefix: default_testing_prefix(),
            vhosts: default_vhosts(),
            queues: default_queues(),
            controller_expiration_ms: default_controller_expiration_ms(),
        }
    }
}

impl BrokerConfig {
    /// Resolve a logical vhost name, applying the testing-mode prefix:
    /// `/x` -> `/<prefix>_x`.
    pub fn vhost(&self, name: &str) -> String {
        let raw = self
            .vhosts
            .get(name)
            .cloned()
            .unwrap_or_else(|| format!("/{}", name));
        if self.testing {
            let trimmed = raw.trim_start_matches('/');
            format!("/{}_{}", self.testing_prefix, trimmed)
        } else {
            raw
        }
    }

    /// Resolve a queue/exchange name by purpose; falls back to the key itself.
    pub fn queue(&self, name: &str) -> String {
        self.queues
            .get(name)
            .cloned()
            .unwrap_or_else(|| name.to_string())
    }
}

/// Chat server REST API settings (auth + user/prompt lookups).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    #[serde(default = "default_server_url")]
    pub url: String,

    /// Service name sent on login.
    #[serde(default = "default_service_name")]
    pub service: String,

    /// Shared secret for login. Overridden by OBSERVER_SERVER_TOKEN env.
    #[serde(default)]
    pub token: Option<String>,
}

fn default_server_url() -> String {
    "http://127.0.0.1:8000".to_string()
}

fn default_service_name() -> String {
    "observer".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            url: default_server_url(),
            service: default_service_name(),
            token: None,
        }
    }
}

/// Translation correlation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranslationConfig {
    /// Deadline for a broker round-trip before the empty fallback fires, in
    /// seconds (default 120).
    #[serde(default = "default_translation_deadline_secs")]
    pub deadline_secs: u64,

    /// Canonical language; shouts updated to it trigger the updated_shouts
    /// broadcast (default "en").
    #[serde(default = "default_canonical_lang")]
    pub canonical_lang: String,
}

fn default_translation_deadline_secs() -> u64 {
    120
}

fn default_canonical_lang() -> String {
    "en".to_string()
}

impl Default for TranslationConfig {
    fn default() -> Self {
        Self {
            deadline_secs: default_translation_deadline_secs(),
            canonical_lang: default_canonical_lang(),
        }
    }
}

/// Resolve the broker password: env OBSERVER_BROKER_PASSWORD overrides config.
pub fn resolve_broker_password(config: &Config) -> Option<String> {
    std::env::var("OBSERVER_BROKER_PASSWORD")
        .ok()
        .and_then(|s| {
            let t = s.trim();
            if t.is_empty() {
                None
            } else {
                Some(t.to_string())
            }
        })
        .or_else(|| {
            config
                .broker
                .password
                .as_ref()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        })
}

/// Resolve the server API token: env OBSERVER_SERVER_TOKEN overrides config.
pub fn resolve_server_token(config: &Config) -> Option<String> {
    std::env::var("OBSERVER_SERVER_TOKEN")
        .ok()
        .and_then(|s| {
            let t = s.trim();
            if t.is_empty() {
                None
            } else {
                Some(t.to_string())
            }
        })
        .or_else(|| {
            config
                .server
                .token
                .as_ref()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        })
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("OBSERVER_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .map(|h| h.join(".observer").join("config.json"))
                .unwrap_or_else(|| PathBuf::from("config.json"))
        })
}

/// Load config from the default path (or OBSERVER_CONFIG_PATH). Missing file => default config.
/// Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_channel_settings() {
        let c = ChannelConfig::default();
        assert_eq!(c.reconnect_delay_secs, 5);
        assert_eq!(c.queue_capacity, 256);
    }

    #[test]
    fn vhost_lookup_plain() {
        let b = BrokerConfig::default();
        assert_eq!(b.vhost("neon"), "/neon_chat_api");
        assert_eq!(b.vhost("unknown"), "/unknown");
    }

    #[test]
    fn vhost_lookup_testing_prefix() {
        let mut b = BrokerConfig::default();
        b.testing = true;
        assert_eq!(b.vhost("neon"), "/test_neon_chat_api");
        assert_eq!(b.vhost("chatbots"), "/test_chatbots");
    }

    #[test]
    fn queue_lookup_falls_back_to_key() {
        let b = BrokerConfig::default();
        assert_eq!(b.queue("controller_input"), "external_shout");
        assert_eq!(b.queue("custom_queue"), "custom_queue");
    }
}
