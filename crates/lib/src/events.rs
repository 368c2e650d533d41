//! Event-channel wire types (frames and typed payloads).
//!
//! Frames are JSON text: `{ "event": "...", "payload": {...} }`. Inbound
//! payloads are validated at the boundary; a missing required field produces a
//! named malformed-input error instead of a raw decode failure.

use crate::errors::ObserverError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Wire frame on the event channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventFrame {
    pub event: String,
    #[serde(default)]
    pub payload: Value,
}

impl EventFrame {
    pub fn new(event: impl Into<String>, payload: Value) -> Self {
        Self {
            event: event.into(),
            payload,
        }
    }
}

/// Inbound chat message from a client connection.
///
/// Required on the wire: `cid`, `userID`, `messageText`. `messageID` is
/// generated when absent; `lang` defaults to "en".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserMessage {
    pub cid: String,
    #[serde(rename = "userID")]
    pub user_id: String,
    #[serde(rename = "messageID")]
    pub message_id: String,
    #[serde(rename = "messageText")]
    pub message_text: String,
    #[serde(default = "default_lang")]
    pub lang: String,
    /// Origin connection id, used to address responses.
    #[serde(default)]
    pub sid: String,
    #[serde(rename = "isAudio", default)]
    pub is_audio: bool,
    #[serde(rename = "isAnnouncement", default)]
    pub is_announcement: bool,
    /// Bot-originated messages skip recipient resolution to prevent loops.
    #[serde(rename = "isBot", default)]
    pub is_bot: bool,
    /// Explicit recipient tag; when present, resolution is skipped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<String>,
    #[serde(rename = "promptID", default, skip_serializing_if = "Option::is_none")]
    pub prompt_id: Option<String>,
    #[serde(
        rename = "promptState",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub prompt_state: Option<String>,
    /// Pre-bound service tag: "chatbots.<bot-list>" or "neon[.<service>]".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bound_service: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<String>,
    #[serde(rename = "timeCreated", default)]
    pub time_created: i64,
}

fn default_lang() -> String {
    "en".to_string()
}

impl UserMessage {
    /// Parse and validate a user_message payload. Missing required keys map
    /// to a named malformed-input error; messageID and timeCreated are filled
    /// when absent.
    pub fn parse(payload: &Value) -> Result<Self, ObserverError> {
        let obj = payload
            .as_object()
            .ok_or_else(|| ObserverError::missing("user_message", "payload"))?;
        for field in ["cid", "userID", "messageText"] {
            match obj.get(field) {
                Some(Value::String(s)) if !s.trim().is_empty() => {}
                _ => return Err(ObserverError::missing("user_message", field)),
            }
        }
        let mut filled = payload.clone();
        if let Some(map) = filled.as_object_mut() {
            if !map.get("messageID").map(has_text).unwrap_or(false) {
                map.insert(
                    "messageID".to_string(),
                    Value::String(uuid::Uuid::new_v4().to_string()),
                );
            }
            if map.get("timeCreated").and_then(Value::as_i64).is_none() {
                map.insert(
                    "timeCreated".to_string(),
                    Value::from(chrono::Utc::now().timestamp()),
                );
            }
        }
        serde_json::from_value(filled).map_err(|e| {
            log::debug!("user_message decode failed: {}", e);
            ObserverError::missing("user_message", "payload")
        })
    }
}

fn has_text(v: &Value) -> bool {
    v.as_str().map(|s| !s.trim().is_empty()).unwrap_or(false)
}

/// Require a non-empty string field from an inbound payload.
pub fn require_str<'a>(
    payload: &'a Value,
    event: &str,
    field: &str,
) -> Result<&'a str, ObserverError> {
    payload
        .get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| ObserverError::missing(event, field))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_fills_message_id_and_defaults() {
        let msg = UserMessage::parse(&json!({
            "cid": "c1",
            "userID": "u1",
            "messageText": "hello"
        }))
        .expect("valid message");
        assert!(!msg.message_id.is_empty());
        assert_eq!(msg.lang, "en");
        assert!(!msg.is_bot);
        assert!(msg.time_created > 0);
    }

    #[test]
    fn parse_rejects_missing_cid() {
        let err = UserMessage::parse(&json!({
            "userID": "u1",
            "messageText": "hello"
        }))
        .unwrap_err();
        assert!(err.to_string().contains("cid"));
    }

    #[test]
    fn parse_rejects_blank_text() {
        let err = UserMessage::parse(&json!({
            "cid": "c1",
            "userID": "u1",
            "messageText": "   "
        }))
        .unwrap_err();
        assert!(err.to_string().contains("messageText"));
    }

    #[test]
    fn require_str_names_the_field() {
        let err = require_str(&json!({}), "request_tts", "message_id").unwrap_err();
        assert_eq!(
            err.to_string(),
            "malformed request_tts payload: missing message_id"
        );
    }
}
