//! Translation request/response correlation.
//!
//! Outbound requests are answered from the storage cache when possible;
//! otherwise the unmet portion goes to the broker under a fresh request id
//! with a deadline timer. Exactly one response (merged result or empty
//! timeout fallback) is ever emitted per request id; late or duplicate broker
//! responses are logged no-ops.

use crate::broker::Broker;
use crate::channel::EventChannelClient;
use crate::config::Config;
use crate::errors::ObserverError;
use crate::storage::Storage;
use crate::timers::TaskTimers;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Requested portion for one conversation: target language + shout ids.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TranslationRequestUnit {
    #[serde(default)]
    pub lang: Option<String>,
    #[serde(default)]
    pub shouts: Vec<String>,
}

/// Translated portion for one conversation: language + message_id -> text.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TranslatedUnit {
    pub lang: String,
    #[serde(default)]
    pub shouts: HashMap<String, String>,
}

/// One in-flight request. Removed on first matching response or deadline
/// expiry, whichever comes first.
struct PendingTranslation {
    sid: String,
    input_type: String,
    /// Already-known (cached) portion, preserved verbatim in the merge.
    populated: HashMap<String, TranslatedUnit>,
    created_at: chrono::DateTime<chrono::Utc>,
}

fn timer_key(request_id: &str) -> String {
    format!("translate:{}", request_id)
}

/// Correlates translation requests with asynchronous broker responses.
pub struct TranslationCorrelator {
    storage: Arc<dyn Storage>,
    broker: Arc<dyn Broker>,
    client: Arc<EventChannelClient>,
    timers: Arc<TaskTimers>,
    pending: Mutex<HashMap<String, PendingTranslation>>,
    vhost: String,
    request_queue: String,
    deadline: Duration,
    canonical_lang: String,
}

impl TranslationCorrelator {
    pub fn new(
        storage: Arc<dyn Storage>,
        broker: Arc<dyn Broker>,
        client: Arc<EventChannelClient>,
        timers: Arc<TaskTimers>,
        config: &Config,
    ) -> Arc<Self> {
        Arc::new(Self {
            storage,
            broker,
            client,
            timers,
            pending: Mutex::new(HashMap::new()),
            vhost: config.broker.vhost("translation"),
            request_queue: config.broker.queue("translation_request"),
            deadline: Duration::from_secs(config.translation.deadline_secs),
            canonical_lang: config.translation.canonical_lang.clone(),
        })
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Handle a request_translate from connection `sid`. Fully-cached
    /// mappings respond synchronously without a broker round-trip.
    pub async fn request(
        self: &Arc<Self>,
        sid: &str,
        input_type: &str,
        chat_mapping: HashMap<String, TranslationRequestUnit>,
    ) -> Result<(), ObserverError> {
        let mut populated: HashMap<String, TranslatedUnit> = HashMap::new();
        let mut unmet: HashMap<String, TranslationRequestUnit> = HashMap::new();

        for (cid, unit) in chat_mapping {
            let lang = unit
                .lang
                .clone()
                .unwrap_or_else(|| self.canonical_lang.clone());
            let cached = self.storage.get_shout_translations(&cid, &lang).await?;
            let mut known = TranslatedUnit {
                lang: lang.clone(),
                shouts: HashMap::new(),
            };
            let mut missing = Vec::new();
            for shout_id in unit.shouts {
                match cached.get(&shout_id) {
                    Some(text) => {
                        known.shouts.insert(shout_id, text.clone());
                    }
                    None => missing.push(shout_id),
                }
            }
            if !known.shouts.is_empty() {
                populated.insert(cid.clone(), known);
            }
            if !missing.is_empty() {
                unmet.insert(
                    cid,
                    TranslationRequestUnit {
                        lang: Some(lang),
                        shouts: missing,
                    },
                );
            }
        }

        let request_id = uuid::Uuid::new_v4().to_string();
        if unmet.is_empty() {
            log::debug!("translation: request {} fully cached", request_id);
            self.emit_response(sid, &request_id, input_type, &populated)
                .await;
            return Ok(());
        }

        {
            let mut g = self.pending.lock().await;
            g.insert(
                request_id.clone(),
                PendingTranslation {
                    sid: sid.to_string(),
                    input_type: input_type.to_string(),
                    populated,
                    created_at: chrono::Utc::now(),
                },
            );
        }

        let correlator = Arc::clone(self);
        let deadline_id = request_id.clone();
        self.timers
            .schedule(&timer_key(&request_id), self.deadline, async move {
                correlator.on_deadline(&deadline_id).await;
            })
            .await;

        self.broker
            .publish(
                &self.vhost,
                &self.request_queue,
                &json!({ "request_id": request_id, "data": unmet }),
                None,
            )
            .await?;
        Ok(())
    }

    /// Deadline fallback: resolve the request with empty translations.
    async fn on_deadline(&self, request_id: &str) {
        let entry = { self.pending.lock().await.remove(request_id) };
        let Some(entry) = entry else {
            return;
        };
        log::warn!(
            "translation: request {} unanswered since {}, responding empty",
            request_id,
            entry.created_at
        );
        self.emit_response(&entry.sid, request_id, &entry.input_type, &HashMap::new())
            .await;
    }

    /// Handle a broker translation response. Unknown request ids (already
    /// resolved or expired) are logged and ignored.
    pub async fn on_response(
        &self,
        request_id: &str,
        translations: HashMap<String, TranslatedUnit>,
    ) -> Result<(), ObserverError> {
        let entry = { self.pending.lock().await.remove(request_id) };
        let Some(entry) = entry else {
            log::info!(
                "translation: late or duplicate response for {}, ignoring",
                request_id
            );
            return Ok(());
        };
        self.timers.cancel(&timer_key(request_id)).await;

        let mut updated_canonical: HashMap<String, Vec<String>> = HashMap::new();
        for (cid, unit) in &translations {
            if unit.shouts.is_empty() {
                continue;
            }
            self.storage
                .save_translations(cid, &unit.lang, &unit.shouts)
                .await?;
            if unit.lang == self.canonical_lang {
                updated_canonical.insert(cid.clone(), unit.shouts.keys().cloned().collect());
            }
        }

        // Merge into the cached partial; known shout-level entries win.
        let mut merged = entry.populated;
        for (cid, unit) in translations {
            let slot = merged.entry(cid).or_insert_with(|| TranslatedUnit {
                lang: unit.lang.clone(),
                shouts: HashMap::new(),
            });
            for (shout_id, text) in unit.shouts {
                slot.shouts.entry(shout_id).or_insert(text);
            }
        }

        self.emit_response(&entry.sid, request_id, &entry.input_type, &merged)
            .await;

        if !updated_canonical.is_empty() {
            self.client
                .emit(
                    "updated_shouts",
                    json!({
                        "updated_shouts": updated_canonical,
                        "exclude": entry.sid,
                    }),
                )
                .await;
        }
        Ok(())
    }

    async fn emit_response(
        &self,
        sid: &str,
        request_id: &str,
        input_type: &str,
        translations: &HashMap<String, TranslatedUnit>,
    ) {
        self.client
            .emit(
                "translation_response",
                json!({
                    "sid": sid,
                    "request_id": request_id,
                    "input_type": input_type,
                    "translations": translations,
                }),
            )
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::channel::{EventTransport, MemoryTransport};
    use crate::config::ChannelConfig;
    use crate::storage::MemoryStorage;
    use tokio::sync::mpsc;

    struct Fixture {
        correlator: Arc<TranslationCorrelator>,
        transport: Arc<MemoryTransport>,
        broker: Arc<MemoryBroker>,
        storage: Arc<MemoryStorage>,
    }

    async fn fixture(deadline_secs: u64) -> Fixture {
        let (tx, _rx) = mpsc::channel(16);
        let transport = Arc::new(MemoryTransport::new(tx));
        let timers = TaskTimers::new();
        let client = EventChannelClient::new(
            transport.clone() as Arc<dyn EventTransport>,
            timers.clone(),
            &ChannelConfig {
                drain_pacing_ms: 1,
                ..ChannelConfig::default()
            },
        );
        client.connect().await;
        let storage = MemoryStorage::new();
        let broker = MemoryBroker::new();
        let mut config = Config::default();
        config.translation.deadline_secs = deadline_secs;
        let correlator = TranslationCorrelator::new(
            storage.clone() as Arc<dyn Storage>,
            broker.clone() as Arc<dyn Broker>,
            client,
            timers,
            &config,
        );
        Fixture {
            correlator,
            transport,
            broker,
            storage,
        }
    }

    fn mapping(cid: &str, lang: &str, shouts: &[&str]) -> HashMap<String, TranslationRequestUnit> {
        let mut m = HashMap::new();
        m.insert(
            cid.to_string(),
            TranslationRequestUnit {
                lang: Some(lang.to_string()),
                shouts: shouts.iter().map(|s| s.to_string()).collect(),
            },
        );
        m
    }

    fn response(cid: &str, lang: &str, shouts: &[(&str, &str)]) -> HashMap<String, TranslatedUnit> {
        let mut m = HashMap::new();
        m.insert(
            cid.to_string(),
            TranslatedUnit {
                lang: lang.to_string(),
                shouts: shouts
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            },
        );
        m
    }

    #[tokio::test]
    async fn fully_cached_responds_without_publish() {
        let f = fixture(120).await;
        f.storage.add_translation("c1", "uk", "m1", "привіт").await;
        f.correlator
            .request("sid-1", "incoming", mapping("c1", "uk", &["m1"]))
            .await
            .unwrap();

        assert!(f.broker.published().await.is_empty());
        assert_eq!(f.correlator.pending_count().await, 0);
        let sent = f.transport.sent().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].event, "translation_response");
        assert_eq!(sent[0].payload["translations"]["c1"]["shouts"]["m1"], "привіт");
    }

    #[tokio::test]
    async fn unmet_portion_publishes_once_and_resolves_on_response() {
        let f = fixture(120).await;
        f.correlator
            .request("sid-1", "incoming", mapping("c1", "uk", &["m1", "m2"]))
            .await
            .unwrap();

        let published = f.broker.published().await;
        assert_eq!(published.len(), 1);
        let request_id = published[0].payload["request_id"].as_str().unwrap().to_string();
        assert_eq!(f.correlator.pending_count().await, 1);

        f.correlator
            .on_response(&request_id, response("c1", "uk", &[("m1", "a"), ("m2", "b")]))
            .await
            .unwrap();
        assert_eq!(f.correlator.pending_count().await, 0);

        let sent = f.transport.sent().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].payload["request_id"], request_id.as_str());
        assert_eq!(sent[0].payload["translations"]["c1"]["shouts"]["m2"], "b");

        // Duplicate response is a no-op: no second emit.
        f.correlator
            .on_response(&request_id, response("c1", "uk", &[("m1", "zzz")]))
            .await
            .unwrap();
        assert_eq!(f.transport.sent().await.len(), 1);
    }

    #[tokio::test]
    async fn merge_preserves_cached_entries() {
        let f = fixture(120).await;
        f.storage.add_translation("c1", "uk", "m1", "cached").await;
        f.correlator
            .request("sid-1", "incoming", mapping("c1", "uk", &["m1", "m2"]))
            .await
            .unwrap();

        let published = f.broker.published().await;
        // Only the unmet shout goes to the broker.
        let data = &published[0].payload["data"]["c1"]["shouts"];
        assert_eq!(data.as_array().unwrap().len(), 1);
        assert_eq!(data[0], "m2");

        let request_id = published[0].payload["request_id"].as_str().unwrap().to_string();
        f.correlator
            .on_response(&request_id, response("c1", "uk", &[("m1", "clobber"), ("m2", "new")]))
            .await
            .unwrap();

        let sent = f.transport.sent().await;
        let shouts = &sent[0].payload["translations"]["c1"]["shouts"];
        assert_eq!(shouts["m1"], "cached");
        assert_eq!(shouts["m2"], "new");
    }

    #[tokio::test]
    async fn deadline_emits_empty_fallback_exactly_once() {
        let f = fixture(0).await;
        f.correlator
            .request("sid-1", "incoming", mapping("c1", "uk", &["m1"]))
            .await
            .unwrap();
        let request_id = f.broker.published().await[0].payload["request_id"]
            .as_str()
            .unwrap()
            .to_string();

        tokio::time::sleep(Duration::from_millis(60)).await;
        let sent = f.transport.sent().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].event, "translation_response");
        assert!(sent[0].payload["translations"].as_object().unwrap().is_empty());

        // Response after expiry is a logged no-op.
        f.correlator
            .on_response(&request_id, response("c1", "uk", &[("m1", "late")]))
            .await
            .unwrap();
        assert_eq!(f.transport.sent().await.len(), 1);
    }

    #[tokio::test]
    async fn canonical_language_update_broadcasts_updated_shouts() {
        let f = fixture(120).await;
        f.correlator
            .request("sid-1", "incoming", mapping("c1", "en", &["m1"]))
            .await
            .unwrap();
        let request_id = f.broker.published().await[0].payload["request_id"]
            .as_str()
            .unwrap()
            .to_string();
        f.correlator
            .on_response(&request_id, response("c1", "en", &[("m1", "hello")]))
            .await
            .unwrap();

        let events = f.transport.sent_events().await;
        assert_eq!(events, vec!["translation_response", "updated_shouts"]);
        let sent = f.transport.sent().await;
        assert_eq!(sent[1].payload["exclude"], "sid-1");
        assert_eq!(sent[1].payload["updated_shouts"]["c1"][0], "m1");
    }
}
