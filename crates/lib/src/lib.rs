//! Chat observer: bridges a chat server's WebSocket event channel to the
//! AMQP services behind it (NEON assistant, chatbot controller, translation).
//!
//! The [`observer::ObserverService`] composition root owns the moving parts:
//! recipient resolution, prompt flow tracking, translation correlation, the
//! reconnecting event-channel client, and the broker adapter.

pub mod auth;
pub mod broker;
pub mod channel;
pub mod config;
pub mod errors;
pub mod events;
pub mod init;
pub mod observer;
pub mod prompt;
pub mod routing;
pub mod storage;
pub mod timers;
pub mod translation;
