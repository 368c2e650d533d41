//! End-to-end flows over in-process doubles: user messages in over the event
//! channel, publishes out over the broker, and broker deliveries back to the
//! channel.

use lib::auth::ServerApiClient;
use lib::broker::{Broker, MemoryBroker};
use lib::channel::{EventTransport, MemoryTransport};
use lib::config::Config;
use lib::observer::ObserverService;
use lib::storage::{MemoryStorage, ShoutRecord, Storage};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::mpsc;

struct Fixture {
    svc: Arc<ObserverService>,
    broker: Arc<MemoryBroker>,
    transport: Arc<MemoryTransport>,
    storage: Arc<MemoryStorage>,
    config: Config,
}

async fn fixture() -> Fixture {
    let config = Config::default();
    let (signal_tx, _signal_rx) = mpsc::channel(16);
    let transport = Arc::new(MemoryTransport::new(signal_tx));
    let broker = MemoryBroker::new();
    let storage = MemoryStorage::new();
    let api = Arc::new(ServerApiClient::new(&config.server, None));

    let svc = ObserverService::new(
        config.clone(),
        Arc::clone(&storage) as Arc<dyn Storage>,
        Arc::clone(&broker) as Arc<dyn Broker>,
        Arc::clone(&transport) as Arc<dyn EventTransport>,
        api,
    );
    svc.client().connect().await;
    svc.try_bind_broker_consumers()
        .await
        .expect("memory broker bindings");

    Fixture {
        svc,
        broker,
        transport,
        storage,
        config,
    }
}

fn user_message(text: &str) -> Value {
    json!({
        "cid": "c1",
        "userID": "alice",
        "messageID": "m1",
        "messageText": text,
        "sid": "s1",
    })
}

#[tokio::test]
async fn prompt_command_routes_to_controller_with_proctor() {
    let f = fixture().await;
    f.svc
        .dispatch("user_message", user_message("!PROMPT: what is love?"))
        .await;

    let queue = f.config.broker.queue("controller_input");
    let published = f.broker.published_to(&queue).await;
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].vhost, f.config.broker.vhost("chatbots"));
    assert_eq!(
        published[0].expiration_ms,
        Some(f.config.broker.controller_expiration_ms)
    );
    assert_eq!(
        published[0].payload["requested_participants"],
        json!(["proctor"])
    );
    assert_eq!(
        published[0].payload["messageText"],
        "!PROMPT: what is love?"
    );
}

#[tokio::test]
async fn mentions_route_to_controller_bots() {
    let f = fixture().await;
    f.svc
        .dispatch("user_message", user_message("@Wolfram @kbot settle this"))
        .await;

    let queue = f.config.broker.queue("controller_input");
    let published = f.broker.published_to(&queue).await;
    assert_eq!(published.len(), 1);
    assert_eq!(
        published[0].payload["requested_participants"],
        json!(["wolfram", "kbot"])
    );
}

#[tokio::test]
async fn neon_prefixed_message_goes_to_neon_input() {
    let f = fixture().await;
    f.svc
        .dispatch("user_message", user_message("Neon, what time is it?"))
        .await;

    let queue = f.config.broker.queue("neon_input");
    let published = f.broker.published_to(&queue).await;
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].vhost, f.config.broker.vhost("neon"));
    assert_eq!(
        published[0].payload["data"]["utterances"],
        json!(["Neon, what time is it?"])
    );
    assert_eq!(published[0].payload["context"]["cid"], "c1");
}

#[tokio::test]
async fn unresolved_message_publishes_nothing() {
    let f = fixture().await;
    f.svc
        .dispatch("user_message", user_message("just chatting with humans"))
        .await;
    assert!(f.broker.published().await.is_empty());
}

#[tokio::test]
async fn bot_messages_are_not_rerouted() {
    let f = fixture().await;
    let mut payload = user_message("@Wolfram ping");
    payload["isBot"] = json!(true);
    f.svc.dispatch("user_message", payload).await;
    assert!(f.broker.published().await.is_empty());
}

#[tokio::test]
async fn malformed_user_message_emits_error_event() {
    let f = fixture().await;
    f.svc
        .dispatch("user_message", json!({ "sid": "s1", "cid": "c1" }))
        .await;
    assert!(f.broker.published().await.is_empty());

    let sent = f.transport.sent().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].event, "error");
    assert_eq!(sent[0].payload["sid"], "s1");
}

#[tokio::test]
async fn ai_response_delivery_reaches_the_channel() {
    let f = fixture().await;
    f.broker
        .deliver(
            &f.config.broker.vhost("neon"),
            &f.config.broker.queue("ai_response"),
            json!({
                "cid": "c1",
                "messageText": "the answer is 42",
            }),
        )
        .await;

    let sent = f.transport.sent().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].event, "new_message");
    assert_eq!(sent[0].payload["messageText"], "the answer is 42");
    assert_eq!(sent[0].payload["isBot"], json!(true));
}

#[tokio::test]
async fn bot_shout_is_stored_and_rebroadcast() {
    let f = fixture().await;
    f.broker
        .deliver(
            &f.config.broker.vhost("chatbots"),
            &f.config.broker.queue("bot_shout"),
            json!({
                "cid": "c1",
                "userID": "wolfram",
                "messageID": "bm1",
                "messageText": "my proposal",
            }),
        )
        .await;

    let shout = f.storage.get_shout("bm1").await.unwrap().unwrap();
    assert_eq!(shout.message_text, "my proposal");

    let sent = f.transport.sent().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].event, "new_message");
}

#[tokio::test]
async fn prompt_lifecycle_over_the_broker() {
    let f = fixture().await;
    let chatbots = f.config.broker.vhost("chatbots");

    f.broker
        .deliver(
            &chatbots,
            &f.config.broker.queue("prompt_new"),
            json!({ "cid": "c1", "prompt_id": "p1", "user_id": "proctor" }),
        )
        .await;
    f.broker
        .deliver(
            &chatbots,
            &f.config.broker.queue("prompt_save"),
            json!({
                "cid": "c1",
                "prompt_id": "p1",
                "user_id": "wolfram",
                "message_id": "bm1",
                "prompt_state": "RESP",
            }),
        )
        .await;
    f.broker
        .deliver(
            &chatbots,
            &f.config.broker.queue("prompt_complete"),
            json!({
                "context": {
                    "prompt": { "prompt_id": "p1" },
                    "winner": "wolfram",
                }
            }),
        )
        .await;

    let record = f.storage.get_prompt("p1").await.unwrap().unwrap();
    assert!(record.is_completed);
    assert_eq!(record.proposed_responses.get("wolfram").unwrap(), "bm1");

    let events = f.transport.sent_events().await;
    assert!(events.contains(&"new_prompt_created".to_string()));
    assert!(events.contains(&"set_prompt_completed".to_string()));
}

#[tokio::test]
async fn subminds_state_fanout_is_forwarded() {
    let f = fixture().await;
    f.broker
        .deliver(
            &f.config.broker.vhost("chatbots"),
            &f.config.broker.queue("subminds_state"),
            json!({ "subminds": ["wolfram", "kbot"] }),
        )
        .await;

    let sent = f.transport.sent().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].event, "subminds_state");
    assert_eq!(sent[0].payload["subminds"], json!(["wolfram", "kbot"]));
}

#[tokio::test]
async fn tts_request_carries_shout_text_and_author() {
    let f = fixture().await;
    f.storage
        .save_shout(&ShoutRecord {
            message_id: "m1".to_string(),
            cid: "c1".to_string(),
            user_id: "alice".to_string(),
            message_text: "say this".to_string(),
            lang: "en".to_string(),
        })
        .await
        .unwrap();
    f.svc
        .dispatch(
            "request_tts",
            json!({ "sid": "s1", "message_id": "m1", "cid": "c1" }),
        )
        .await;

    let queue = format!("{}_tts", f.config.broker.queue("neon_input"));
    let published = f.broker.published_to(&queue).await;
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].payload["data"]["utterance"], "say this");
    assert_eq!(published[0].payload["context"]["username"], "alice");
}

#[tokio::test]
async fn stt_request_carries_requester_username() {
    let f = fixture().await;
    f.svc
        .dispatch(
            "request_stt",
            json!({
                "sid": "s1",
                "message_id": "m2",
                "cid": "c1",
                "userID": "bob",
                "audio_data": "aGVsbG8=",
            }),
        )
        .await;

    let queue = format!("{}_stt", f.config.broker.queue("neon_input"));
    let published = f.broker.published_to(&queue).await;
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].payload["data"]["audio_data"], "aGVsbG8=");
    assert_eq!(published[0].payload["context"]["username"], "bob");
}

#[tokio::test]
async fn broadcast_without_recipients_is_dropped() {
    let f = fixture().await;
    f.svc
        .dispatch("broadcast", json!({ "msg_type": "ping", "to": [] }))
        .await;
    assert!(f.broker.published().await.is_empty());

    f.svc
        .dispatch(
            "broadcast",
            json!({ "msg_type": "ping", "to": ["wolfram"] }),
        )
        .await;
    let queue = f.config.broker.queue("controller_input");
    assert_eq!(f.broker.published_to(&queue).await.len(), 1);
}
