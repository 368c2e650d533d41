//! Observer service: wires the recipient resolver, prompt state machine, and
//! translation correlator to the event channel and the broker.
//!
//! Inbound event-channel frames are dispatched through an explicit
//! event-name -> handler map built once at construction. Broker deliveries
//! arrive through per-binding consumer callbacks. Nothing in here terminates
//! the process; failures degrade to logs, error events, and retry paths.

use crate::auth::ServerApiClient;
use crate::broker::{Broker, ConsumerBinding, ConsumerCallback};
use crate::channel::{ChannelSignal, EventChannelClient, EventTransport};
use crate::config::Config;
use crate::errors::ObserverError;
use crate::events::{require_str, UserMessage};
use crate::prompt::{PromptState, PromptStateMachine};
use crate::routing::{Recipient, RecipientResolver, RouteContext};
use crate::storage::{ShoutRecord, Storage};
use crate::timers::TaskTimers;
use crate::translation::{TranslationCorrelator, TranslationRequestUnit};
use futures_util::future::BoxFuture;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Delay between broker binding retries at startup.
const BIND_RETRY_DELAY: Duration = Duration::from_secs(5);

type EventHandler = fn(Arc<ObserverService>, Value) -> BoxFuture<'static, ()>;

/// Composition root for the observer. Construct once, then `run`.
pub struct ObserverService {
    config: Config,
    storage: Arc<dyn Storage>,
    broker: Arc<dyn Broker>,
    client: Arc<EventChannelClient>,
    resolver: RecipientResolver,
    prompts: PromptStateMachine,
    translator: Arc<TranslationCorrelator>,
    api: Arc<ServerApiClient>,
    handlers: HashMap<&'static str, EventHandler>,
}

impl ObserverService {
    pub fn new(
        config: Config,
        storage: Arc<dyn Storage>,
        broker: Arc<dyn Broker>,
        transport: Arc<dyn EventTransport>,
        api: Arc<ServerApiClient>,
    ) -> Arc<Self> {
        let timers = TaskTimers::new();
        let client = EventChannelClient::new(transport, Arc::clone(&timers), &config.channel);
        let translator = TranslationCorrelator::new(
            Arc::clone(&storage),
            Arc::clone(&broker),
            Arc::clone(&client),
            timers,
            &config,
        );
        Arc::new(Self {
            prompts: PromptStateMachine::new(Arc::clone(&storage)),
            resolver: RecipientResolver::new(),
            handlers: event_handlers(),
            config,
            storage,
            broker,
            client,
            translator,
            api,
        })
    }

    pub fn client(&self) -> &Arc<EventChannelClient> {
        &self.client
    }

    /// Main loop: connect the channel, then dispatch inbound frames and
    /// disconnect signals until the receiver closes or ctrl-c.
    pub async fn run(self: Arc<Self>, mut signals: mpsc::Receiver<ChannelSignal>) {
        self.client.connect().await;
        loop {
            tokio::select! {
                maybe = signals.recv() => match maybe {
                    Some(ChannelSignal::Frame(frame)) => {
                        let svc = Arc::clone(&self);
                        tokio::spawn(async move {
                            svc.dispatch(&frame.event, frame.payload).await;
                        });
                    }
                    Some(ChannelSignal::Closed) => {
                        self.client.on_connection_lost().await;
                    }
                    None => break,
                },
                _ = tokio::signal::ctrl_c() => {
                    log::info!("observer: shutting down");
                    break;
                }
            }
        }
        self.client.disconnect().await;
    }

    /// Dispatch one inbound event-channel frame through the handler map.
    pub async fn dispatch(self: &Arc<Self>, event: &str, payload: Value) {
        match self.handlers.get(event) {
            Some(handler) => handler(Arc::clone(self), payload).await,
            None => log::debug!("observer: no handler for event {}", event),
        }
    }

    /// Emit a typed error event back to the originating connection.
    async fn emit_error(&self, sid: &str, handler: &str, detail: &str) {
        self.client
            .emit(
                "error",
                json!({
                    "handler": handler,
                    "status": "malformed",
                    "body": detail,
                    "sid": sid,
                }),
            )
            .await;
    }

    // ----- event-channel handlers -----

    async fn handle_user_message(self: Arc<Self>, payload: Value) {
        let sid = payload
            .get("sid")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let msg = match UserMessage::parse(&payload) {
            Ok(m) => m,
            Err(e) => {
                log::warn!("observer: dropping user_message: {}", e);
                self.emit_error(&sid, "user_message", &e.to_string()).await;
                return;
            }
        };

        // Prompt-flow traffic drives the state machine instead of routing.
        if let (Some(prompt_id), Some(state)) = (&msg.prompt_id, &msg.prompt_state) {
            match PromptState::parse(state) {
                Some(state) => {
                    if let Err(e) = self
                        .prompts
                        .apply(&msg.cid, prompt_id, state, &msg.user_id, &msg.message_id)
                        .await
                    {
                        log::warn!("observer: prompt apply failed for {}: {}", prompt_id, e);
                    }
                }
                None => log::warn!("observer: unknown prompt state {:?}", state),
            }
            return;
        }

        // Explicitly-tagged or bot-originated messages are already routed;
        // re-resolving them would loop bot output back into the bots.
        if msg.recipient.is_some() || msg.is_bot {
            log::debug!("observer: skipping resolution for {}", msg.message_id);
            return;
        }

        let resolution = self
            .resolver
            .resolve(&msg.message_text, msg.bound_service.as_deref())
            .await;
        match resolution.recipient {
            Recipient::Neon => self.forward_to_neon(&msg, &resolution.context).await,
            Recipient::ChatbotController => {
                self.forward_to_controller(&msg, &resolution.context).await
            }
            Recipient::Unresolved => {
                log::warn!(
                    "observer: no recipient for message {} in cid {}, dropping",
                    msg.message_id,
                    msg.cid
                );
            }
        }
    }

    async fn handle_request_translate(self: Arc<Self>, payload: Value) {
        let sid = payload
            .get("sid")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let input_type = payload
            .get("input_type")
            .and_then(Value::as_str)
            .unwrap_or("incoming")
            .to_string();
        let chat_mapping: HashMap<String, TranslationRequestUnit> = match payload
            .get("chat_mapping")
            .cloned()
            .map(serde_json::from_value)
        {
            Some(Ok(m)) => m,
            _ => {
                let e = ObserverError::missing("request_translate", "chat_mapping");
                log::warn!("observer: {}", e);
                self.emit_error(&sid, "request_translate", &e.to_string())
                    .await;
                return;
            }
        };
        if let Err(e) = self.translator.request(&sid, &input_type, chat_mapping).await {
            log::error!("observer: translation request failed: {}", e);
        }
    }

    async fn handle_get_prompt_data(self: Arc<Self>, payload: Value) {
        let sid = payload
            .get("sid")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let prompt_id = match require_str(&payload, "get_prompt_data", "prompt_id") {
            Ok(p) => p.to_string(),
            Err(e) => {
                log::warn!("observer: {}", e);
                self.emit_error(&sid, "get_prompt_data", &e.to_string()).await;
                return;
            }
        };
        match self.prompts.fetch_prompt_data(&prompt_id).await {
            Ok(data) => {
                if data.is_none() {
                    log::debug!("observer: no data for prompt {}", prompt_id);
                }
                self.client
                    .emit(
                        "prompt_data",
                        json!({
                            "sid": sid,
                            "prompt_id": prompt_id,
                            "data": data.unwrap_or(Value::Null),
                        }),
                    )
                    .await;
            }
            Err(e) => log::error!("observer: prompt data fetch failed: {}", e),
        }
    }

    async fn handle_request_tts(self: Arc<Self>, payload: Value) {
        let sid = payload
            .get("sid")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let (message_id, cid) = match (
            require_str(&payload, "request_tts", "message_id"),
            require_str(&payload, "request_tts", "cid"),
        ) {
            (Ok(m), Ok(c)) => (m.to_string(), c.to_string()),
            (Err(e), _) | (_, Err(e)) => {
                log::warn!("observer: {}", e);
                self.emit_error(&sid, "request_tts", &e.to_string()).await;
                return;
            }
        };
        let (utterance, username) = match self.storage.get_shout(&message_id).await {
            Ok(Some(shout)) => (shout.message_text, shout.user_id),
            Ok(None) => {
                log::warn!("observer: tts for unknown shout {}", message_id);
                self.emit_error(&sid, "request_tts", "unknown message_id").await;
                return;
            }
            Err(e) => {
                log::error!("observer: shout lookup failed: {}", e);
                return;
            }
        };
        let lang = payload.get("lang").and_then(Value::as_str).unwrap_or("en");
        let gender = payload
            .get("gender")
            .and_then(Value::as_str)
            .unwrap_or("female");
        let body = json!({
            "utterance": utterance,
            "lang": lang,
            "gender": gender,
        });
        self.publish_neon("tts", &message_id, &sid, &cid, &username, body)
            .await;
    }

    async fn handle_request_stt(self: Arc<Self>, payload: Value) {
        let sid = payload
            .get("sid")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let (message_id, cid, audio) = match (
            require_str(&payload, "request_stt", "message_id"),
            require_str(&payload, "request_stt", "cid"),
            require_str(&payload, "request_stt", "audio_data"),
        ) {
            (Ok(m), Ok(c), Ok(a)) => (m.to_string(), c.to_string(), a.to_string()),
            (Err(e), _, _) | (_, Err(e), _) | (_, _, Err(e)) => {
                log::warn!("observer: {}", e);
                self.emit_error(&sid, "request_stt", &e.to_string()).await;
                return;
            }
        };
        {
            use base64::Engine as _;
            if base64::engine::general_purpose::STANDARD.decode(&audio).is_err() {
                log::warn!("observer: undecodable audio for message {}", message_id);
                self.emit_error(&sid, "request_stt", "audio_data is not valid base64")
                    .await;
                return;
            }
        }
        let lang = payload.get("lang").and_then(Value::as_str).unwrap_or("en");
        let username = payload
            .get("userID")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let body = json!({
            "audio_data": audio,
            "lang": lang,
        });
        self.publish_neon("stt", &message_id, &sid, &cid, username, body)
            .await;
    }

    /// Forward a broadcast instruction to the named recipients only.
    async fn handle_broadcast(self: Arc<Self>, payload: Value) {
        let to: Vec<String> = payload
            .get("to")
            .and_then(Value::as_array)
            .map(|a| {
                a.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        if to.is_empty() {
            log::warn!("observer: broadcast without recipients, dropping");
            return;
        }
        let mut forwarded = payload;
        if let Some(obj) = forwarded.as_object_mut() {
            obj.insert("requested_participants".to_string(), json!(to));
        }
        if let Err(e) = self
            .broker
            .publish(
                &self.config.broker.vhost("chatbots"),
                &self.config.broker.queue("controller_input"),
                &forwarded,
                Some(self.config.broker.controller_expiration_ms),
            )
            .await
        {
            log::error!("observer: broadcast publish failed: {}", e);
        }
    }

    // ----- recipient formatters -----

    /// NEON: pick a skill, build the skill-specific body, attach the routing
    /// context, publish to the (optionally instance-suffixed) input queue.
    async fn forward_to_neon(&self, msg: &UserMessage, ctx: &RouteContext) {
        let skill = match ctx.requested_service_name.as_deref() {
            Some(s) => s.to_string(),
            None if msg.is_audio => "stt".to_string(),
            None => "recognizer".to_string(),
        };
        let body = match skill.as_str() {
            "tts" => json!({
                "utterance": msg.message_text,
                "lang": msg.lang,
            }),
            "stt" => json!({
                "audio_data": msg
                    .attachments
                    .first()
                    .cloned()
                    .unwrap_or_else(|| msg.message_text.clone()),
                "lang": msg.lang,
            }),
            _ => json!({
                "utterances": [msg.message_text],
                "lang": msg.lang,
            }),
        };
        let suffix = ctx
            .requested_service_name
            .as_deref()
            .map(|s| format!("_{}", s))
            .unwrap_or_default();
        let payload = json!({
            "data": body,
            "context": neon_context(&skill, &msg.message_id, &msg.sid, &msg.cid, &msg.user_id),
        });
        let queue = format!("{}{}", self.config.broker.queue("neon_input"), suffix);
        if let Err(e) = self
            .broker
            .publish(&self.config.broker.vhost("neon"), &queue, &payload, None)
            .await
        {
            log::error!("observer: neon publish failed: {}", e);
        }
    }

    async fn publish_neon(
        &self,
        skill: &str,
        message_id: &str,
        sid: &str,
        cid: &str,
        username: &str,
        body: Value,
    ) {
        let payload = json!({
            "data": body,
            "context": neon_context(skill, message_id, sid, cid, username),
        });
        let queue = format!("{}_{}", self.config.broker.queue("neon_input"), skill);
        if let Err(e) = self
            .broker
            .publish(&self.config.broker.vhost("neon"), &queue, &payload, None)
            .await
        {
            log::error!("observer: neon {} publish failed: {}", skill, e);
        }
    }

    /// Chatbot controller: refuse to publish without explicit participants so
    /// an unrouted message cannot fan out to arbitrary bots.
    async fn forward_to_controller(&self, msg: &UserMessage, ctx: &RouteContext) {
        if ctx.requested_participants.is_empty() {
            log::warn!(
                "observer: controller message {} without participants, dropping",
                msg.message_id
            );
            return;
        }
        let mut payload = match serde_json::to_value(msg) {
            Ok(v) => v,
            Err(e) => {
                log::error!("observer: encoding message {}: {}", msg.message_id, e);
                return;
            }
        };
        if let Some(obj) = payload.as_object_mut() {
            obj.insert(
                "requested_participants".to_string(),
                json!(ctx.requested_participants),
            );
        }
        if let Err(e) = self
            .broker
            .publish(
                &self.config.broker.vhost("chatbots"),
                &self.config.broker.queue("controller_input"),
                &payload,
                Some(self.config.broker.controller_expiration_ms),
            )
            .await
        {
            log::error!("observer: controller publish failed: {}", e);
        }
    }

    // ----- broker consumer handlers -----

    /// Register every consumer binding, retrying until the broker accepts.
    pub async fn bind_broker_consumers(self: &Arc<Self>) {
        loop {
            match self.try_bind_broker_consumers().await {
                Ok(()) => return,
                Err(e) => {
                    log::warn!(
                        "observer: broker binding failed, retrying in {:?}: {}",
                        BIND_RETRY_DELAY,
                        e
                    );
                    tokio::time::sleep(BIND_RETRY_DELAY).await;
                }
            }
        }
    }

    fn consumer(
        self: &Arc<Self>,
        f: fn(Arc<ObserverService>, Value) -> BoxFuture<'static, ()>,
    ) -> ConsumerCallback {
        let svc = Arc::clone(self);
        Arc::new(move |payload| {
            let svc = Arc::clone(&svc);
            f(svc, payload)
        })
    }

    pub async fn try_bind_broker_consumers(self: &Arc<Self>) -> Result<(), ObserverError> {
        let b = &self.config.broker;
        let neon = b.vhost("neon");
        let chatbots = b.vhost("chatbots");
        let translation = b.vhost("translation");

        let bindings: Vec<(ConsumerBinding, EventHandler)> = vec![
            (
                ConsumerBinding::queue("ai-response", &neon, &b.queue("ai_response")),
                |svc, p| Box::pin(svc.on_ai_response(p)),
            ),
            (
                ConsumerBinding::queue("ai-response-error", &neon, &b.queue("ai_response_error")),
                |svc, p| Box::pin(svc.on_ai_response_error(p)),
            ),
            (
                ConsumerBinding::queue("stt-response", &neon, &b.queue("stt_response")),
                |svc, p| Box::pin(svc.on_stt_response(p)),
            ),
            (
                ConsumerBinding::queue("tts-response", &neon, &b.queue("tts_response")),
                |svc, p| Box::pin(svc.on_tts_response(p)),
            ),
            (
                ConsumerBinding::queue("bot-shout", &chatbots, &b.queue("bot_shout")),
                |svc, p| Box::pin(svc.on_bot_shout(p)),
            ),
            (
                ConsumerBinding::queue("prompt-save", &chatbots, &b.queue("prompt_save")),
                |svc, p| Box::pin(svc.on_prompt_save(p)),
            ),
            (
                ConsumerBinding::queue("prompt-new", &chatbots, &b.queue("prompt_new")),
                |svc, p| Box::pin(svc.on_prompt_new(p)),
            ),
            (
                ConsumerBinding::queue("prompt-complete", &chatbots, &b.queue("prompt_complete")),
                |svc, p| Box::pin(svc.on_prompt_complete(p)),
            ),
            (
                ConsumerBinding::queue("prompt-get", &chatbots, &b.queue("prompt_get")),
                |svc, p| Box::pin(svc.on_prompt_get(p)),
            ),
            (
                ConsumerBinding::queue(
                    "prompt-data-request",
                    &chatbots,
                    &b.queue("prompt_data_request"),
                ),
                |svc, p| Box::pin(svc.on_prompt_data_request(p)),
            ),
            (
                ConsumerBinding::queue(
                    "translation-response",
                    &translation,
                    &b.queue("translation_response"),
                ),
                |svc, p| Box::pin(svc.on_translation_response(p)),
            ),
            (
                ConsumerBinding::queue("persona-config", &chatbots, &b.queue("persona_config")),
                |svc, p| Box::pin(svc.on_persona_config(p)),
            ),
            (
                ConsumerBinding::fanout("subminds-state", &chatbots, &b.queue("subminds_state")),
                |svc, p| Box::pin(svc.on_subminds_state(p)),
            ),
        ];

        for (binding, handler) in bindings {
            let callback = self.consumer(handler);
            self.broker.bind_consumer(binding, callback).await?;
        }
        Ok(())
    }

    async fn on_ai_response(self: Arc<Self>, payload: Value) {
        let cid = match require_str(&payload, "ai_response", "cid") {
            Ok(c) => c.to_string(),
            Err(e) => {
                log::warn!("observer: {}", e);
                return;
            }
        };
        let text = match require_str(&payload, "ai_response", "messageText") {
            Ok(t) => t.to_string(),
            Err(e) => {
                log::warn!("observer: {}", e);
                return;
            }
        };
        let user_id = payload
            .get("userID")
            .and_then(Value::as_str)
            .unwrap_or("neon")
            .to_string();
        let message_id = uuid::Uuid::new_v4().to_string();
        let shout = ShoutRecord {
            message_id: message_id.clone(),
            cid: cid.clone(),
            user_id: user_id.clone(),
            message_text: text.clone(),
            lang: payload
                .get("lang")
                .and_then(Value::as_str)
                .unwrap_or("en")
                .to_string(),
        };
        if let Err(e) = self.storage.save_shout(&shout).await {
            log::error!("observer: saving ai response shout: {}", e);
        }
        self.client
            .emit(
                "new_message",
                json!({
                    "cid": cid,
                    "userID": user_id,
                    "messageID": message_id,
                    "messageText": text,
                    "isBot": true,
                    "timeCreated": chrono::Utc::now().timestamp(),
                }),
            )
            .await;
    }

    async fn on_ai_response_error(self: Arc<Self>, payload: Value) {
        log::error!(
            "observer: ai response error: {}",
            payload.get("error").and_then(Value::as_str).unwrap_or("?")
        );
    }

    async fn on_stt_response(self: Arc<Self>, payload: Value) {
        self.client.emit("stt_response", payload).await;
    }

    async fn on_tts_response(self: Arc<Self>, payload: Value) {
        self.client.emit("tts_response", payload).await;
    }

    /// Bot shout from the controller: prompt traffic drives the state
    /// machine; everything else is stored and rebroadcast as a new message.
    async fn on_bot_shout(self: Arc<Self>, payload: Value) {
        let msg = match UserMessage::parse(&payload) {
            Ok(m) => m,
            Err(e) => {
                log::warn!("observer: dropping bot shout: {}", e);
                return;
            }
        };
        if let (Some(prompt_id), Some(state)) = (&msg.prompt_id, &msg.prompt_state) {
            if let Some(state) = PromptState::parse(state) {
                if let Err(e) = self
                    .prompts
                    .apply(&msg.cid, prompt_id, state, &msg.user_id, &msg.message_id)
                    .await
                {
                    log::warn!("observer: prompt apply failed for {}: {}", prompt_id, e);
                }
            } else {
                log::warn!("observer: unknown prompt state {:?} in bot shout", state);
            }
            return;
        }
        let shout = ShoutRecord {
            message_id: msg.message_id.clone(),
            cid: msg.cid.clone(),
            user_id: msg.user_id.clone(),
            message_text: msg.message_text.clone(),
            lang: msg.lang.clone(),
        };
        if let Err(e) = self.storage.save_shout(&shout).await {
            log::error!("observer: saving bot shout: {}", e);
        }
        let mut out = payload;
        if let Some(obj) = out.as_object_mut() {
            obj.insert("isBot".to_string(), json!(true));
        }
        self.client.emit("new_message", out).await;
    }

    async fn on_prompt_save(self: Arc<Self>, payload: Value) {
        let (cid, prompt_id, user_id, message_id, state) = match (
            require_str(&payload, "prompt_save", "cid"),
            require_str(&payload, "prompt_save", "prompt_id"),
            require_str(&payload, "prompt_save", "user_id"),
            require_str(&payload, "prompt_save", "message_id"),
            require_str(&payload, "prompt_save", "prompt_state"),
        ) {
            (Ok(c), Ok(p), Ok(u), Ok(m), Ok(s)) => (c, p, u, m, s),
            _ => {
                log::warn!("observer: malformed prompt_save payload");
                return;
            }
        };
        let Some(state) = PromptState::parse(state) else {
            log::warn!("observer: unknown prompt state {:?}", state);
            return;
        };
        if let Err(e) = self
            .prompts
            .apply(cid, prompt_id, state, user_id, message_id)
            .await
        {
            log::warn!("observer: prompt apply failed for {}: {}", prompt_id, e);
        }
    }

    async fn on_prompt_new(self: Arc<Self>, payload: Value) {
        let (cid, prompt_id) = match (
            require_str(&payload, "prompt_new", "cid"),
            require_str(&payload, "prompt_new", "prompt_id"),
        ) {
            (Ok(c), Ok(p)) => (c.to_string(), p.to_string()),
            _ => {
                log::warn!("observer: malformed prompt_new payload");
                return;
            }
        };
        let creator = payload
            .get("user_id")
            .and_then(Value::as_str)
            .unwrap_or("proctor");
        if let Err(e) = self
            .prompts
            .apply(&cid, &prompt_id, PromptState::Wait, creator, &prompt_id)
            .await
        {
            log::warn!("observer: prompt create failed for {}: {}", prompt_id, e);
            return;
        }
        self.client.emit("new_prompt_created", payload).await;
    }

    async fn on_prompt_complete(self: Arc<Self>, payload: Value) {
        let prompt_id = payload
            .get("context")
            .and_then(|c| c.get("prompt"))
            .and_then(|p| p.get("prompt_id"))
            .and_then(Value::as_str)
            .map(str::to_string);
        let Some(prompt_id) = prompt_id else {
            log::warn!("observer: prompt completion without context.prompt.prompt_id");
            return;
        };
        let context = payload.get("context").cloned().unwrap_or(Value::Null);
        if let Err(e) = self.prompts.complete(&prompt_id, &context).await {
            log::error!("observer: prompt completion failed for {}: {}", prompt_id, e);
            return;
        }
        self.client
            .emit(
                "set_prompt_completed",
                json!({
                    "prompt_id": prompt_id,
                    "winner": context.get("winner").cloned().unwrap_or(Value::Null),
                }),
            )
            .await;
    }

    async fn on_prompt_get(self: Arc<Self>, payload: Value) {
        let Ok(prompt_id) = require_str(&payload, "prompt_get", "prompt_id") else {
            log::warn!("observer: malformed prompt_get payload");
            return;
        };
        match self.prompts.fetch_prompt_data(prompt_id).await {
            Ok(data) => {
                self.client
                    .emit(
                        "prompt_data",
                        json!({
                            "prompt_id": prompt_id,
                            "data": data.unwrap_or(Value::Null),
                        }),
                    )
                    .await;
            }
            Err(e) => log::error!("observer: prompt fetch failed: {}", e),
        }
    }

    /// Prompt data requested by another backend service: reply over the
    /// broker when a reply queue is named, otherwise over the channel.
    async fn on_prompt_data_request(self: Arc<Self>, payload: Value) {
        let Ok(prompt_id) = require_str(&payload, "prompt_data_request", "prompt_id") else {
            log::warn!("observer: malformed prompt_data_request payload");
            return;
        };
        let data = match self.prompts.fetch_prompt_data(prompt_id).await {
            Ok(d) => d.unwrap_or(Value::Null),
            Err(e) => {
                log::error!("observer: prompt fetch failed: {}", e);
                return;
            }
        };
        let body = json!({ "prompt_id": prompt_id, "data": data });
        match payload.get("reply_to").and_then(Value::as_str) {
            Some(reply_to) => {
                if let Err(e) = self
                    .broker
                    .publish(&self.config.broker.vhost("chatbots"), reply_to, &body, None)
                    .await
                {
                    log::error!("observer: prompt data reply failed: {}", e);
                }
            }
            None => self.client.emit("prompt_data", body).await,
        }
    }

    async fn on_translation_response(self: Arc<Self>, payload: Value) {
        let Ok(request_id) = require_str(&payload, "translation_response", "request_id") else {
            log::warn!("observer: translation response without request_id");
            return;
        };
        let translations = match payload
            .get("translations")
            .cloned()
            .map(serde_json::from_value)
        {
            Some(Ok(t)) => t,
            _ => {
                log::warn!("observer: undecodable translations for {}", request_id);
                return;
            }
        };
        if let Err(e) = self.translator.on_response(request_id, translations).await {
            log::error!("observer: translation response failed: {}", e);
        }
    }

    /// Persona config push: refresh the default-LLM mention table.
    async fn on_persona_config(self: Arc<Self>, payload: Value) {
        let table = payload
            .get("default_llms")
            .or(Some(&payload))
            .and_then(Value::as_object)
            .map(|obj| {
                obj.iter()
                    .filter_map(|(k, v)| {
                        v.as_str().map(|s| (k.to_lowercase(), s.to_string()))
                    })
                    .collect::<HashMap<_, _>>()
            })
            .unwrap_or_default();
        if table.is_empty() {
            log::debug!("observer: persona config without default_llms");
            return;
        }
        log::info!("observer: refreshed {} default llm entries", table.len());
        self.resolver.set_default_llms(table).await;
    }

    async fn on_subminds_state(self: Arc<Self>, payload: Value) {
        self.client.emit("subminds_state", payload).await;
    }

    /// Pull the default-LLM table from the server API. Auth failures emit an
    /// auth_expired event instead of escalating.
    pub async fn refresh_default_llms(&self) {
        match self.api.fetch_default_llms().await {
            Ok(table) => {
                log::info!("observer: loaded {} default llm entries", table.len());
                self.resolver.set_default_llms(table).await;
            }
            Err(e @ ObserverError::Auth(_)) => {
                log::error!("observer: default llm refresh unauthorized: {}", e);
                self.client
                    .emit(
                        "auth_expired",
                        json!({
                            "handler": "default_llms",
                            "status": 401,
                            "body": e.to_string(),
                        }),
                    )
                    .await;
            }
            Err(e) => log::warn!("observer: default llm refresh failed: {}", e),
        }
    }
}

/// Routing context block attached to every NEON request.
fn neon_context(skill: &str, message_id: &str, sid: &str, cid: &str, username: &str) -> Value {
    json!({
        "source": "observer",
        "message_id": message_id,
        "sid": sid,
        "cid": cid,
        "agent": format!("observer-{}", env!("CARGO_PKG_VERSION")),
        "requested_skills": [skill],
        "username": username,
    })
}

/// Event-name -> handler map, built once at construction.
fn event_handlers() -> HashMap<&'static str, EventHandler> {
    let mut m: HashMap<&'static str, EventHandler> = HashMap::new();
    m.insert("user_message", |svc, p| {
        Box::pin(svc.handle_user_message(p))
    });
    m.insert("request_translate", |svc, p| {
        Box::pin(svc.handle_request_translate(p))
    });
    m.insert("get_prompt_data", |svc, p| {
        Box::pin(svc.handle_get_prompt_data(p))
    });
    m.insert("request_tts", |svc, p| Box::pin(svc.handle_request_tts(p)));
    m.insert("request_stt", |svc, p| Box::pin(svc.handle_request_stt(p)));
    m.insert("broadcast", |svc, p| Box::pin(svc.handle_broadcast(p)));
    m
}

/// Build and run the observer against the real transports: WebSocket event
/// channel, AMQP broker, in-memory storage backing.
pub async fn run_observer(config: Config) -> anyhow::Result<()> {
    use crate::broker::AmqpBroker;
    use crate::channel::WsTransport;
    use crate::config::{resolve_broker_password, resolve_server_token};
    use crate::storage::MemoryStorage;

    let (signal_tx, signal_rx) = mpsc::channel(64);
    let transport = Arc::new(WsTransport::new(config.channel.url.clone(), signal_tx));
    let broker = Arc::new(AmqpBroker::new(
        &config.broker,
        resolve_broker_password(&config),
    ));
    let api = Arc::new(ServerApiClient::new(
        &config.server,
        resolve_server_token(&config),
    ));
    let storage = MemoryStorage::new();

    let svc = ObserverService::new(
        config,
        storage as Arc<dyn Storage>,
        broker as Arc<dyn Broker>,
        transport as Arc<dyn EventTransport>,
        api,
    );
    svc.bind_broker_consumers().await;
    svc.refresh_default_llms().await;
    svc.run(signal_rx).await;
    Ok(())
}
