//! Transports: provider-specific inbound parsing and outbound delivery.
//!
//! The router only talks to the `Transport` trait. Threading helpers that
//! every provider shares (reply headers, reply subject, conversation
//! correlation tokens) live here as free functions.

pub mod memory;
pub mod outbox;
pub mod smtp;
pub mod sparkpost;

use std::sync::LazyLock;

use async_trait::async_trait;
use axum::http::HeaderMap;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::{BotConfig, WEBHOOK_TOKEN_HEADER};
use crate::email::{InboundMessage, OutboundMessage};
use crate::error::TransportError;

pub use memory::MemoryTransport;
pub use outbox::{Delivery, Outbox};
pub use smtp::{SmtpConfig, SmtpTransport};
pub use sparkpost::{SparkPostConfig, SparkPostTransport};

/// Prefix of the correlation token embedded in a conversation's first message.
pub const CONVERSATION_TOKEN_PREFIX: &str = "conversation-id_";

static CONVERSATION_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!("<{}([^<>\\s]+)>", regex::escape(CONVERSATION_TOKEN_PREFIX)))
        .expect("conversation token pattern is valid")
});

/// What a provider reported for one accepted send.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendReceipt {
    pub transport: String,
    /// Provider-side id, when the provider returns one.
    pub id: Option<String>,
    pub accepted: usize,
    pub rejected: usize,
}

/// A mail provider.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Short name used in logs and errors.
    fn name(&self) -> &str;

    /// Provision whatever the provider needs before mail can flow.
    async fn setup(&self, _config: &BotConfig) -> Result<(), TransportError> {
        Ok(())
    }

    /// Check an inbound webhook call before its body is accepted.
    fn validate(&self, headers: &HeaderMap, config: &BotConfig) -> bool {
        let token = headers
            .get(WEBHOOK_TOKEN_HEADER)
            .and_then(|v| v.to_str().ok());
        config.token_matches(token)
    }

    /// Normalize one webhook body into zero or more messages.
    fn parse(&self, body: &[u8], config: &BotConfig)
    -> Result<Vec<InboundMessage>, TransportError>;

    /// Deliver a finalized message. Called once per send; never retried.
    async fn send(&self, message: &OutboundMessage) -> Result<SendReceipt, TransportError>;
}

/// Threading headers for a reply to `inbound`.
///
/// `References` carries the inbound chain plus its Message-ID, so a
/// conversation token anywhere in the chain survives every reply.
pub fn reply_headers(inbound: &InboundMessage) -> Vec<(String, String)> {
    let references = inbound
        .headers
        .get("references")
        .map(|v| v.joined())
        .unwrap_or_default();
    let message_id = inbound.message_id().unwrap_or("");

    let mut headers = Vec::new();
    let chain = format!("{references} {message_id}").trim().to_string();
    if !chain.is_empty() {
        headers.push(("References".to_string(), chain));
    }
    if !message_id.is_empty() {
        headers.push(("In-Reply-To".to_string(), message_id.to_string()));
    }
    headers
}

/// `"Re: "` + subject, unless it already is a reply.
pub fn reply_subject(inbound: &InboundMessage) -> String {
    let subject = inbound.subject.trim();
    if subject
        .get(..3)
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case("re:"))
    {
        subject.to_string()
    } else {
        format!("Re: {subject}")
    }
}

/// Header value that marks a message as the start of conversation `id`.
pub fn correlation_header(id: &str) -> String {
    format!("<{CONVERSATION_TOKEN_PREFIX}{id}>")
}

/// Conversation ids found in the `References` chain, in chain order.
///
/// Missing or malformed headers yield nothing.
pub fn conversation_ids(inbound: &InboundMessage) -> Vec<String> {
    let Some(references) = inbound.headers.get("references") else {
        return Vec::new();
    };
    let references = references.joined();
    CONVERSATION_TOKEN
        .captures_iter(&references)
        .map(|caps| caps[1].to_string())
        .collect()
}

/// Apply reply threading from `inbound` onto `message`.
pub(crate) fn apply_reply(message: &mut OutboundMessage, inbound: &InboundMessage) {
    for (name, value) in reply_headers(inbound) {
        message.headers.insert(name, value);
    }
    message.subject = Some(reply_subject(inbound));
}
