//! Normalized email types shared by transports, the router and conversations.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::BotConfig;
use crate::email::text;
use crate::error::OutboundError;

// ── Headers ─────────────────────────────────────────────────────────

/// A header value. Repeated headers collapse into `Multi` in arrival order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderValue {
    Single(String),
    Multi(Vec<String>),
}

impl HeaderValue {
    /// First value of the header.
    pub fn first(&self) -> &str {
        match self {
            Self::Single(v) => v,
            Self::Multi(vs) => vs.first().map(String::as_str).unwrap_or(""),
        }
    }

    /// All values joined by a single space.
    pub fn joined(&self) -> String {
        match self {
            Self::Single(v) => v.clone(),
            Self::Multi(vs) => vs.join(" "),
        }
    }
}

/// Inbound header map. Names are stored lowercased.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Headers(BTreeMap<String, HeaderValue>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a header, turning the entry into a list if the name repeats.
    pub fn append(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        let key = name.trim().to_lowercase();
        match self.0.remove(&key) {
            None => {
                self.0.insert(key, HeaderValue::Single(value));
            }
            Some(HeaderValue::Single(prev)) => {
                self.0.insert(key, HeaderValue::Multi(vec![prev, value]));
            }
            Some(HeaderValue::Multi(mut prev)) => {
                prev.push(value);
                self.0.insert(key, HeaderValue::Multi(prev));
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&HeaderValue> {
        self.0.get(&name.to_lowercase())
    }

    pub fn first(&self, name: &str) -> Option<&str> {
        self.get(name).map(HeaderValue::first)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(&name.to_lowercase())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &HeaderValue)> {
        self.0.iter()
    }
}

impl<K: AsRef<str>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Headers::new();
        for (k, v) in iter {
            headers.append(k.as_ref(), v);
        }
        headers
    }
}

// ── Inbound message ─────────────────────────────────────────────────

/// One received email, normalized by a transport.
///
/// Shared as `Arc<InboundMessage>` once it enters the router; nothing
/// mutates it after `with_defaults`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Message-ID header, or a synthesized `<uuid>@<sending-domain>`.
    #[serde(default)]
    pub id: String,
    /// Envelope recipient (the address the relay delivered to).
    #[serde(default)]
    pub to: String,
    /// Sender address.
    #[serde(default)]
    pub from: String,
    /// Direct addressees (To header), in order.
    #[serde(default)]
    pub recipients: Vec<String>,
    #[serde(default)]
    pub cc: Vec<String>,
    #[serde(default)]
    pub bcc: Vec<String>,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub html: String,
    #[serde(default)]
    pub headers: Headers,
    /// Provider payload this message was built from.
    #[serde(default)]
    pub raw: serde_json::Value,
    #[serde(default = "Utc::now")]
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    /// Fill fields a provider may have left blank.
    ///
    /// `to` falls back to the inbound address and `id` to the Message-ID
    /// header or a synthesized id.
    pub fn with_defaults(mut self, config: &BotConfig) -> Self {
        if self.to.trim().is_empty() {
            self.to = config.inbound_address.clone();
        }
        if self.id.is_empty() {
            self.id = default_message_id(&self.headers, config.sending_domain());
        }
        self
    }

    /// Quote-stripped, markup-free body used for pattern matching.
    pub fn latest_text(&self) -> String {
        let body = if self.text.trim().is_empty() {
            &self.html
        } else {
            &self.text
        };
        text::clean(&text::latest(body))
    }

    pub fn message_id(&self) -> Option<&str> {
        self.headers.first("message-id")
    }
}

/// Message-ID header value, or `<uuid>@<domain>` when absent.
pub fn default_message_id(headers: &Headers, domain: &str) -> String {
    headers
        .first("message-id")
        .filter(|id| !id.is_empty())
        .map(String::from)
        .unwrap_or_else(|| format!("{}@{}", uuid::Uuid::new_v4().simple(), domain))
}

// ── Outbound message ────────────────────────────────────────────────

/// A named mailbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub name: String,
    pub email: String,
}

impl Address {
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
        }
    }
}

/// A request to send an email. Not persisted.
///
/// Recipient lists are `Option` so a responder can tell "not set" (derive
/// from the inbound message) from "explicitly empty".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Provider-side stored template.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipients: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cc: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bcc: Option<Vec<String>>,
    #[serde(default)]
    pub substitution_data: serde_json::Map<String, serde_json::Value>,
    /// Derive threading headers and subject from the inbound message this answers.
    #[serde(default)]
    pub reply: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<Address>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<Address>,
}

impl OutboundMessage {
    /// HTML body. Plain text is derived from it at send time.
    pub fn html(body: impl Into<String>) -> Self {
        Self {
            html: Some(body.into()),
            ..Self::default()
        }
    }

    pub fn text(body: impl Into<String>) -> Self {
        Self {
            text: Some(body.into()),
            ..Self::default()
        }
    }

    pub fn template(template_id: impl Into<String>) -> Self {
        Self {
            template_id: Some(template_id.into()),
            ..Self::default()
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn with_recipients<I, S>(mut self, recipients: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.recipients = Some(recipients.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_cc<I, S>(mut self, cc: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cc = Some(cc.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_substitution(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.substitution_data.insert(key.into(), value);
        self
    }

    /// Whether any of recipients/cc/bcc was set explicitly.
    pub fn has_addressing(&self) -> bool {
        self.recipients.is_some() || self.cc.is_some() || self.bcc.is_some()
    }

    fn has_content(&self) -> bool {
        let filled = |s: &Option<String>| s.as_deref().is_some_and(|v| !v.is_empty());
        filled(&self.html) || filled(&self.text)
    }

    /// Reject requests with nothing to send or with conflicting content.
    pub fn validate(&self) -> Result<(), OutboundError> {
        if self.template_id.is_some() && self.has_content() {
            return Err(OutboundError::TemplateWithContent);
        }
        if self.template_id.is_none() && !self.has_content() && self.subject.is_none() {
            return Err(OutboundError::Empty);
        }
        Ok(())
    }

    /// Fill sender identity, derived text and empty lists before delivery.
    pub fn apply_defaults(&mut self, config: &BotConfig) {
        if self.text.is_none()
            && let Some(html) = &self.html
        {
            self.text = Some(text::html_to_text(html));
        }
        self.recipients.get_or_insert_with(Vec::new);
        self.cc.get_or_insert_with(Vec::new);
        self.bcc.get_or_insert_with(Vec::new);
        self.from
            .get_or_insert_with(|| Address::new(&config.bot_name, &config.sending_address));
        self.reply_to
            .get_or_insert_with(|| Address::new(&config.bot_name, &config.inbound_address));
    }

    /// Every address this message will go to.
    pub fn all_recipients(&self) -> impl Iterator<Item = &String> {
        [&self.recipients, &self.cc, &self.bcc]
            .into_iter()
            .flatten()
            .flatten()
    }
}
