//! Multi-party prompt flow tracking.
//!
//! A prompt walks a fixed state sequence (RESP -> DISC -> VOTE -> PICK, with
//! WAIT for observing bots) within one conversation. Records are persisted
//! through the storage collaborator; a per-cid lock blocks processing after a
//! malformed prompt until a WAIT message for a fresh prompt id arrives.

use crate::errors::ObserverError;
use crate::storage::Storage;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Prompt flow states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PromptState {
    Idle,
    Resp,
    Disc,
    Vote,
    Pick,
    Wait,
}

impl PromptState {
    /// Parse a wire state string, case-insensitive.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "IDLE" => Some(Self::Idle),
            "RESP" => Some(Self::Resp),
            "DISC" => Some(Self::Disc),
            "VOTE" => Some(Self::Vote),
            "PICK" => Some(Self::Pick),
            "WAIT" => Some(Self::Wait),
            _ => None,
        }
    }
}

/// Persisted prompt record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptRecord {
    pub id: String,
    pub cid: String,
    pub state: PromptState,
    pub is_completed: bool,
    pub participating_subminds: Vec<String>,
    /// user_id -> message_id, per slot.
    pub proposed_responses: HashMap<String, String>,
    pub submind_opinions: HashMap<String, String>,
    pub votes: HashMap<String, String>,
    /// Restricted completion summary (recognized keys only).
    pub summary: HashMap<String, Value>,
    pub created_at: i64,
}

impl PromptRecord {
    fn new(id: &str, cid: &str) -> Self {
        Self {
            id: id.to_string(),
            cid: cid.to_string(),
            state: PromptState::Wait,
            is_completed: false,
            participating_subminds: Vec::new(),
            proposed_responses: HashMap::new(),
            submind_opinions: HashMap::new(),
            votes: HashMap::new(),
            summary: HashMap::new(),
            created_at: chrono::Utc::now().timestamp(),
        }
    }
}

/// Context keys kept by `complete`; everything else in the supplied context
/// is discarded so untrusted payloads cannot grow storage unboundedly.
const SUMMARY_KEYS: &[&str] = &["winner", "votes_per_submind", "participating_subminds"];

/// Outcome of one `apply` call, mostly for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Slot written (or WAIT registered) on an existing prompt.
    Applied,
    /// Fresh prompt created from a WAIT message; any cid lock cleared.
    Created,
    /// Conversation is locked against a different prompt id.
    DroppedLocked,
    /// Prompt already completed.
    DroppedCompleted,
    /// Unknown prompt id in a non-WAIT state; cid lock set.
    MalformedLocked,
    /// User already submitted to this slot.
    DuplicateRejected,
}

/// State machine over prompt records, with the per-cid malformed-prompt lock.
pub struct PromptStateMachine {
    storage: Arc<dyn Storage>,
    /// cid -> prompt_id currently blocking the conversation.
    locks: Mutex<HashMap<String, String>>,
}

impl PromptStateMachine {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Current lock for a conversation, if any.
    pub async fn locked(&self, cid: &str) -> Option<String> {
        self.locks.lock().await.get(cid).cloned()
    }

    /// Apply one prompt message. See module docs for the lock/create rules.
    pub async fn apply(
        &self,
        cid: &str,
        prompt_id: &str,
        state: PromptState,
        user_id: &str,
        message_id: &str,
    ) -> Result<ApplyOutcome, ObserverError> {
        {
            let locks = self.locks.lock().await;
            if let Some(blocking) = locks.get(cid) {
                // WAIT messages pass through: a fresh prompt's WAIT is the
                // only way a locked conversation recovers.
                if blocking != prompt_id && state != PromptState::Wait {
                    log::debug!(
                        "prompt: cid {} locked against {}, dropping message for {}",
                        cid,
                        blocking,
                        prompt_id
                    );
                    return Ok(ApplyOutcome::DroppedLocked);
                }
            }
        }

        let record = self.storage.get_prompt(prompt_id).await?;
        let Some(mut record) = record else {
            if state == PromptState::Wait {
                let mut record = PromptRecord::new(prompt_id, cid);
                record.participating_subminds.push(user_id.to_string());
                self.storage.save_prompt(&record).await?;
                self.locks.lock().await.remove(cid);
                log::info!("prompt: created {} for cid {}", prompt_id, cid);
                return Ok(ApplyOutcome::Created);
            }
            log::warn!(
                "prompt: malformed message for unknown prompt {} (state {:?}) in cid {}, locking",
                prompt_id,
                state,
                cid
            );
            self.locks
                .lock()
                .await
                .insert(cid.to_string(), prompt_id.to_string());
            return Ok(ApplyOutcome::MalformedLocked);
        };

        if record.is_completed {
            log::debug!("prompt: {} already completed, dropping", prompt_id);
            return Ok(ApplyOutcome::DroppedCompleted);
        }

        let slot = match state {
            PromptState::Resp => Some(&mut record.proposed_responses),
            PromptState::Disc => Some(&mut record.submind_opinions),
            PromptState::Vote => Some(&mut record.votes),
            _ => None,
        };
        if let Some(slot) = slot {
            if slot.contains_key(user_id) {
                log::warn!(
                    "prompt: duplicate {:?} submission from {} for {}",
                    state,
                    user_id,
                    prompt_id
                );
                return Ok(ApplyOutcome::DuplicateRejected);
            }
            slot.insert(user_id.to_string(), message_id.to_string());
        }
        if state == PromptState::Resp || state == PromptState::Wait {
            if !record.participating_subminds.iter().any(|u| u == user_id) {
                record.participating_subminds.push(user_id.to_string());
            }
        }
        record.state = state;
        self.storage.save_prompt(&record).await?;
        Ok(ApplyOutcome::Applied)
    }

    /// Mark a prompt completed, keeping only the recognized summary keys from
    /// the supplied context.
    pub async fn complete(&self, prompt_id: &str, context: &Value) -> Result<(), ObserverError> {
        let Some(mut record) = self.storage.get_prompt(prompt_id).await? else {
            log::warn!("prompt: completion for unknown prompt {}", prompt_id);
            return Ok(());
        };
        record.is_completed = true;
        record.state = PromptState::Pick;
        if let Some(obj) = context.as_object() {
            for key in SUMMARY_KEYS {
                if let Some(v) = obj.get(*key) {
                    record.summary.insert(key.to_string(), v.clone());
                }
            }
        }
        self.storage.save_prompt(&record).await
    }

    /// Prompt data for display: participant ids become nicknames, referenced
    /// message ids become shout text; raw ids remain when lookups fail.
    pub async fn fetch_prompt_data(
        &self,
        prompt_id: &str,
    ) -> Result<Option<Value>, ObserverError> {
        let Some(record) = self.storage.get_prompt(prompt_id).await? else {
            return Ok(None);
        };

        let mut participants = Vec::with_capacity(record.participating_subminds.len());
        for user_id in &record.participating_subminds {
            participants.push(self.nickname(user_id).await);
        }

        let proposed = self.join_slot(&record.proposed_responses).await;
        let opinions = self.join_slot(&record.submind_opinions).await;
        let votes = self.join_slot(&record.votes).await;

        Ok(Some(serde_json::json!({
            "prompt_id": record.id,
            "cid": record.cid,
            "state": record.state,
            "is_completed": record.is_completed,
            "participating_subminds": participants,
            "proposed_responses": proposed,
            "submind_opinions": opinions,
            "votes": votes,
            "summary": record.summary,
        })))
    }

    async fn nickname(&self, user_id: &str) -> String {
        match self.storage.get_user(user_id).await {
            Ok(Some(user)) => user.nickname,
            Ok(None) => user_id.to_string(),
            Err(e) => {
                log::warn!("prompt: user lookup failed for {}: {}", user_id, e);
                user_id.to_string()
            }
        }
    }

    async fn join_slot(&self, slot: &HashMap<String, String>) -> HashMap<String, String> {
        let mut joined = HashMap::with_capacity(slot.len());
        for (user_id, message_id) in slot {
            let text = match self.storage.get_shout(message_id).await {
                Ok(Some(shout)) => shout.message_text,
                _ => message_id.clone(),
            };
            joined.insert(self.nickname(user_id).await, text);
        }
        joined
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn machine() -> (PromptStateMachine, Arc<MemoryStorage>) {
        let storage = MemoryStorage::new();
        (
            PromptStateMachine::new(storage.clone() as Arc<dyn Storage>),
            storage,
        )
    }

    #[tokio::test]
    async fn wait_creates_prompt_and_clears_lock() {
        let (m, _s) = machine();
        // Malformed first: unknown prompt, non-WAIT state.
        let out = m
            .apply("c1", "p-bad", PromptState::Resp, "bot1", "m1")
            .await
            .unwrap();
        assert_eq!(out, ApplyOutcome::MalformedLocked);
        assert_eq!(m.locked("c1").await.as_deref(), Some("p-bad"));

        // Messages for other prompts are dropped while locked.
        let out = m
            .apply("c1", "p-other", PromptState::Resp, "bot1", "m2")
            .await
            .unwrap();
        assert_eq!(out, ApplyOutcome::DroppedLocked);

        // WAIT for a new prompt creates it and unlocks the cid.
        let out = m
            .apply("c1", "p-new", PromptState::Wait, "bot1", "m3")
            .await
            .unwrap();
        assert_eq!(out, ApplyOutcome::Created);
        assert_eq!(m.locked("c1").await, None);

        // The recovered conversation accepts the new prompt's flow.
        let out = m
            .apply("c1", "p-new", PromptState::Resp, "bot2", "m4")
            .await
            .unwrap();
        assert_eq!(out, ApplyOutcome::Applied);
    }

    #[tokio::test]
    async fn duplicate_resp_is_rejected() {
        let (m, s) = machine();
        m.apply("c1", "p1", PromptState::Wait, "bot1", "m0")
            .await
            .unwrap();
        let out = m
            .apply("c1", "p1", PromptState::Resp, "bot1", "m1")
            .await
            .unwrap();
        assert_eq!(out, ApplyOutcome::Applied);
        let out = m
            .apply("c1", "p1", PromptState::Resp, "bot1", "m2")
            .await
            .unwrap();
        assert_eq!(out, ApplyOutcome::DuplicateRejected);

        let record = s.get_prompt("p1").await.unwrap().unwrap();
        assert_eq!(record.proposed_responses.len(), 1);
        assert_eq!(record.proposed_responses.get("bot1").unwrap(), "m1");
    }

    #[tokio::test]
    async fn first_resp_registers_participant() {
        let (m, s) = machine();
        m.apply("c1", "p1", PromptState::Wait, "bot1", "m0")
            .await
            .unwrap();
        m.apply("c1", "p1", PromptState::Resp, "bot2", "m1")
            .await
            .unwrap();
        let record = s.get_prompt("p1").await.unwrap().unwrap();
        assert_eq!(record.participating_subminds, vec!["bot1", "bot2"]);
    }

    #[tokio::test]
    async fn slots_map_to_states() {
        let (m, s) = machine();
        m.apply("c1", "p1", PromptState::Wait, "bot1", "m0")
            .await
            .unwrap();
        m.apply("c1", "p1", PromptState::Resp, "bot1", "m1")
            .await
            .unwrap();
        m.apply("c1", "p1", PromptState::Disc, "bot1", "m2")
            .await
            .unwrap();
        m.apply("c1", "p1", PromptState::Vote, "bot1", "m3")
            .await
            .unwrap();
        let record = s.get_prompt("p1").await.unwrap().unwrap();
        assert_eq!(record.proposed_responses.get("bot1").unwrap(), "m1");
        assert_eq!(record.submind_opinions.get("bot1").unwrap(), "m2");
        assert_eq!(record.votes.get("bot1").unwrap(), "m3");
        assert_eq!(record.state, PromptState::Vote);
    }

    #[tokio::test]
    async fn completed_prompt_drops_further_messages() {
        let (m, _s) = machine();
        m.apply("c1", "p1", PromptState::Wait, "bot1", "m0")
            .await
            .unwrap();
        m.complete("p1", &serde_json::json!({ "winner": "bot1" }))
            .await
            .unwrap();
        let out = m
            .apply("c1", "p1", PromptState::Resp, "bot2", "m1")
            .await
            .unwrap();
        assert_eq!(out, ApplyOutcome::DroppedCompleted);
    }

    #[tokio::test]
    async fn complete_keeps_only_recognized_keys() {
        let (m, s) = machine();
        m.apply("c1", "p1", PromptState::Wait, "bot1", "m0")
            .await
            .unwrap();
        m.complete(
            "p1",
            &serde_json::json!({
                "winner": "bot1",
                "votes_per_submind": { "bot1": 2 },
                "raw_blob": "x".repeat(4096),
            }),
        )
        .await
        .unwrap();
        let record = s.get_prompt("p1").await.unwrap().unwrap();
        assert!(record.is_completed);
        assert_eq!(record.summary.get("winner").unwrap(), "bot1");
        assert!(record.summary.contains_key("votes_per_submind"));
        assert!(!record.summary.contains_key("raw_blob"));
    }

    #[tokio::test]
    async fn prompt_data_substitutes_nicknames_with_fallback() {
        let (m, s) = machine();
        s.add_user("bot1", "Wolfram").await;
        m.apply("c1", "p1", PromptState::Wait, "bot1", "m0")
            .await
            .unwrap();
        m.apply("c1", "p1", PromptState::Resp, "bot1", "m1")
            .await
            .unwrap();
        m.apply("c1", "p1", PromptState::Resp, "ghost", "m2")
            .await
            .unwrap();

        let data = m.fetch_prompt_data("p1").await.unwrap().unwrap();
        let participants: Vec<String> = data["participating_subminds"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap().to_string())
            .collect();
        assert!(participants.contains(&"Wolfram".to_string()));
        assert!(participants.contains(&"ghost".to_string()));
        // Unknown message ids fall back to the raw id.
        assert_eq!(data["proposed_responses"]["Wolfram"], "m1");
    }

    #[tokio::test]
    async fn unknown_prompt_data_is_none() {
        let (m, _s) = machine();
        assert!(m.fetch_prompt_data("nope").await.unwrap().is_none());
    }
}
