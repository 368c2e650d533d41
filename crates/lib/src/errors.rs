//! Error types shared across the observer.

use thiserror::Error;

/// Failures the observer surfaces. Malformed inbound payloads name the event
/// and the missing field so the error can be echoed back to the origin.
#[derive(Debug, Error)]
pub enum ObserverError {
    #[error("malformed {event} payload: missing {field}")]
    MalformedInput { event: String, field: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("broker error: {0}")]
    Broker(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("auth error: {0}")]
    Auth(String),

    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),
}

impl ObserverError {
    /// Malformed-input error for a missing or empty required field.
    pub fn missing(event: &str, field: &str) -> Self {
        Self::MalformedInput {
            event: event.to_string(),
            field: field.to_string(),
        }
    }
}

impl From<lapin::Error> for ObserverError {
    fn from(e: lapin::Error) -> Self {
        Self::Broker(e.to_string())
    }
}
