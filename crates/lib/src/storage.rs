//! Storage collaborator seam (users, shouts, prompts, translations).
//!
//! The persistent store lives elsewhere; the observer only consumes this
//! trait. `MemoryStorage` backs tests and standalone runs.

use crate::errors::ObserverError;
use crate::prompt::PromptRecord;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// A chat participant as the server knows them.
#[derive(Debug, Clone)]
pub struct UserRecord {
    pub user_id: String,
    pub nickname: String,
}

/// A stored chat message (shout).
#[derive(Debug, Clone)]
pub struct ShoutRecord {
    pub message_id: String,
    pub cid: String,
    pub user_id: String,
    pub message_text: String,
    pub lang: String,
}

/// Async storage collaborator.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn get_prompt(&self, prompt_id: &str) -> Result<Option<PromptRecord>, ObserverError>;
    async fn save_prompt(&self, record: &PromptRecord) -> Result<(), ObserverError>;
    async fn save_shout(&self, shout: &ShoutRecord) -> Result<(), ObserverError>;
    async fn get_shout(&self, message_id: &str) -> Result<Option<ShoutRecord>, ObserverError>;
    async fn get_user(&self, user_id: &str) -> Result<Option<UserRecord>, ObserverError>;
    /// Known translations for a conversation in a target language:
    /// message_id -> translated text.
    async fn get_shout_translations(
        &self,
        cid: &str,
        lang: &str,
    ) -> Result<HashMap<String, String>, ObserverError>;
    async fn save_translations(
        &self,
        cid: &str,
        lang: &str,
        shouts: &HashMap<String, String>,
    ) -> Result<(), ObserverError>;
}

/// In-memory storage: RwLock-guarded maps. Used by tests and as the default
/// backing when no external store is configured.
#[derive(Default)]
pub struct MemoryStorage {
    prompts: RwLock<HashMap<String, PromptRecord>>,
    shouts: RwLock<HashMap<String, ShoutRecord>>,
    users: RwLock<HashMap<String, UserRecord>>,
    /// (cid, lang) -> message_id -> text
    translations: RwLock<HashMap<(String, String), HashMap<String, String>>>,
}

impl MemoryStorage {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn add_user(&self, user_id: &str, nickname: &str) {
        self.users.write().await.insert(
            user_id.to_string(),
            UserRecord {
                user_id: user_id.to_string(),
                nickname: nickname.to_string(),
            },
        );
    }

    pub async fn add_translation(&self, cid: &str, lang: &str, message_id: &str, text: &str) {
        self.translations
            .write()
            .await
            .entry((cid.to_string(), lang.to_string()))
            .or_default()
            .insert(message_id.to_string(), text.to_string());
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get_prompt(&self, prompt_id: &str) -> Result<Option<PromptRecord>, ObserverError> {
        Ok(self.prompts.read().await.get(prompt_id).cloned())
    }

    async fn save_prompt(&self, record: &PromptRecord) -> Result<(), ObserverError> {
        self.prompts
            .write()
            .await
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn save_shout(&self, shout: &ShoutRecord) -> Result<(), ObserverError> {
        self.shouts
            .write()
            .await
            .insert(shout.message_id.clone(), shout.clone());
        Ok(())
    }

    async fn get_shout(&self, message_id: &str) -> Result<Option<ShoutRecord>, ObserverError> {
        Ok(self.shouts.read().await.get(message_id).cloned())
    }

    async fn get_user(&self, user_id: &str) -> Result<Option<UserRecord>, ObserverError> {
        Ok(self.users.read().await.get(user_id).cloned())
    }

    async fn get_shout_translations(
        &self,
        cid: &str,
        lang: &str,
    ) -> Result<HashMap<String, String>, ObserverError> {
        Ok(self
            .translations
            .read()
            .await
            .get(&(cid.to_string(), lang.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn save_translations(
        &self,
        cid: &str,
        lang: &str,
        shouts: &HashMap<String, String>,
    ) -> Result<(), ObserverError> {
        let mut g = self.translations.write().await;
        let entry = g
            .entry((cid.to_string(), lang.to_string()))
            .or_default();
        for (k, v) in shouts {
            entry.insert(k.clone(), v.clone());
        }
        Ok(())
    }
}
