//! Recipient resolution: classify an inbound chat message into the backend
//! target (NEON assistant, chatbot controller, or unresolved) plus routing
//! context.
//!
//! Pure, precedence-ordered, and deterministic given a snapshot of the
//! default-LLM table. Callers skip resolution entirely for bot-originated or
//! explicitly-tagged messages to prevent feedback loops.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Resolved backend target for an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recipient {
    Neon,
    ChatbotController,
    Unresolved,
}

/// Routing context carried alongside the recipient.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteContext {
    /// Bot/agent identities that should receive the message.
    pub requested_participants: Vec<String>,
    /// Specific NEON service instance (e.g. "tts"), when bound.
    pub requested_service_name: Option<String>,
}

/// Recipient + context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub recipient: Recipient,
    pub context: RouteContext,
}

impl Resolution {
    fn controller(participants: Vec<String>) -> Self {
        Self {
            recipient: Recipient::ChatbotController,
            context: RouteContext {
                requested_participants: participants,
                requested_service_name: None,
            },
        }
    }

    fn neon(service: Option<String>) -> Self {
        Self {
            recipient: Recipient::Neon,
            context: RouteContext {
                requested_participants: Vec::new(),
                requested_service_name: service,
            },
        }
    }

    fn unresolved() -> Self {
        Self {
            recipient: Recipient::Unresolved,
            context: RouteContext::default(),
        }
    }
}

/// Command prefixes checked first, in order. Case-insensitive.
const COMMAND_PREFIXES: &[(&str, &str)] = &[
    ("!prompt:", "proctor"),
    ("show score:", "scorekeeper"),
    ("!start_auto_prompts", "automator"),
    ("!stop_auto_prompts", "automator"),
];

/// Body name prefixes routed straight to NEON.
const NEON_NAME_PREFIXES: &[&str] = &["neon"];

/// Shared name -> service mapping for @mentions, refreshed externally from
/// the server's persona config.
pub type DefaultLlmTable = Arc<RwLock<HashMap<String, String>>>;

/// Resolves message bodies to recipients over a shared default-LLM table.
pub struct RecipientResolver {
    default_llms: DefaultLlmTable,
}

impl Default for RecipientResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl RecipientResolver {
    pub fn new() -> Self {
        Self {
            default_llms: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Handle to the shared table (for the refresh task).
    pub fn table(&self) -> DefaultLlmTable {
        Arc::clone(&self.default_llms)
    }

    /// Replace the default-LLM table with a fresh snapshot.
    pub async fn set_default_llms(&self, table: HashMap<String, String>) {
        *self.default_llms.write().await = table;
    }

    /// Resolve a message body (and optional bound-service tag) to a recipient.
    /// First match wins: command prefixes, name prefixes, bound service,
    /// @mentions, unresolved.
    pub async fn resolve(&self, body: &str, bound_service: Option<&str>) -> Resolution {
        let folded = body.trim().to_lowercase();

        for (prefix, participant) in COMMAND_PREFIXES {
            if folded.starts_with(prefix) {
                return Resolution::controller(vec![participant.to_string()]);
            }
        }

        for prefix in NEON_NAME_PREFIXES {
            if folded.starts_with(prefix) {
                return Resolution::neon(None);
            }
        }

        if let Some(tag) = bound_service.map(str::trim).filter(|s| !s.is_empty()) {
            if let Some(bots) = tag.strip_prefix("chatbots.") {
                let participants: Vec<String> = bots
                    .split(',')
                    .map(|b| b.trim().to_lowercase())
                    .filter(|b| !b.is_empty())
                    .collect();
                if !participants.is_empty() {
                    return Resolution::controller(participants);
                }
            } else if let Some(rest) = tag.strip_prefix("neon") {
                let service = rest
                    .strip_prefix('.')
                    .map(str::trim)
                    .filter(|s| !s.is_empty() && *s != "assistant")
                    .map(str::to_string);
                return Resolution::neon(service);
            }
        }

        let mentions = extract_mentions(body);
        if !mentions.is_empty() {
            let table = self.default_llms.read().await;
            let participants = mentions
                .into_iter()
                .map(|m| table.get(&m).cloned().unwrap_or(m))
                .collect();
            return Resolution::controller(participants);
        }

        Resolution::unresolved()
    }
}

/// Scan a body for `@name` tokens. Lower-cased, de-duplicated, order
/// preserved.
fn extract_mentions(body: &str) -> Vec<String> {
    let mut seen = Vec::new();
    for token in body.split_whitespace() {
        let Some(rest) = token.strip_prefix('@') else {
            continue;
        };
        let name: String = rest
            .chars()
            .take_while(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
            .collect::<String>()
            .to_lowercase();
        if !name.is_empty() && !seen.contains(&name) {
            seen.push(name);
        }
    }
    seen
}
