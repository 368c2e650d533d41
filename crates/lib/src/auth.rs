//! Chat server REST API client (login + authorized lookups).
//!
//! A 401 triggers exactly one re-login and retry; a second failure surfaces a
//! typed auth error to the caller instead of retrying indefinitely.

use crate::config::ServerConfig;
use crate::errors::ObserverError;
use serde_json::{json, Value};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Authenticated client for the chat server API.
pub struct ServerApiClient {
    base_url: String,
    service: String,
    secret: Option<String>,
    /// Token issued on login.
    session: RwLock<Option<String>>,
    client: reqwest::Client,
}

impl ServerApiClient {
    pub fn new(config: &ServerConfig, secret: Option<String>) -> Self {
        Self {
            base_url: config.url.trim_end_matches('/').to_string(),
            service: config.service.clone(),
            secret,
            session: RwLock::new(None),
            client: reqwest::Client::new(),
        }
    }

    /// POST /auth/login to obtain a session token.
    pub async fn login(&self) -> Result<String, ObserverError> {
        let url = format!("{}/auth/login", self.base_url);
        let body = json!({
            "service": self.service,
            "token": self.secret.as_deref().unwrap_or(""),
        });
        let res = self.client.post(&url).json(&body).send().await?;
        if !res.status().is_success() {
            let status = res.status();
            return Err(ObserverError::Auth(format!("login failed: {}", status)));
        }
        let data: Value = res.json().await?;
        let token = data
            .get("token")
            .and_then(Value::as_str)
            .ok_or_else(|| ObserverError::Auth("login response missing token".to_string()))?
            .to_string();
        *self.session.write().await = Some(token.clone());
        Ok(token)
    }

    async fn token(&self) -> Result<String, ObserverError> {
        if let Some(t) = self.session.read().await.clone() {
            return Ok(t);
        }
        self.login().await
    }

    async fn authorized_get(&self, url: &str, token: &str) -> Result<reqwest::Response, ObserverError> {
        Ok(self
            .client
            .get(url)
            .header("Authorization", format!("Bearer {}", token))
            .send()
            .await?)
    }

    /// Authorized GET returning JSON. On 401: one re-login and retry, then a
    /// typed auth error.
    pub async fn get_json(&self, path: &str) -> Result<Value, ObserverError> {
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        let token = self.token().await?;
        let mut res = self.authorized_get(&url, &token).await?;
        if res.status() == reqwest::StatusCode::UNAUTHORIZED {
            log::warn!("server api: token expired for {}, re-logging in", path);
            let token = self.login().await?;
            res = self.authorized_get(&url, &token).await?;
            if res.status() == reqwest::StatusCode::UNAUTHORIZED {
                return Err(ObserverError::Auth(format!(
                    "unauthorized for {} after re-login",
                    path
                )));
            }
        }
        if !res.status().is_success() {
            let status = res.status();
            return Err(ObserverError::Auth(format!(
                "request to {} failed: {}",
                path, status
            )));
        }
        Ok(res.json().await?)
    }

    /// Fetch the @mention name -> service mapping from the server's persona
    /// config.
    pub async fn fetch_default_llms(&self) -> Result<HashMap<String, String>, ObserverError> {
        let data = self.get_json("personas/default_llms").await?;
        let mut table = HashMap::new();
        if let Some(obj) = data.as_object() {
            for (name, v) in obj {
                if let Some(service) = v.as_str() {
                    table.insert(name.to_lowercase(), service.to_string());
                }
            }
        }
        Ok(table)
    }
}
