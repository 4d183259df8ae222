//! Send/reply/start-conversation capabilities handed to event listeners.

use std::sync::Arc;

use tracing::debug;

use super::router::Bot;
use crate::config::{BotConfig, clean_address};
use crate::conversation::{Conversation, ConversationConfig, ConversationHandle};
use crate::email::{InboundMessage, OutboundMessage};
use crate::error::{ConfigError, OutboundError, Result};
use crate::transport::Delivery;

impl From<&str> for ConversationConfig {
    fn from(subject: &str) -> Self {
        ConversationConfig::new(subject)
    }
}

impl From<String> for ConversationConfig {
    fn from(subject: String) -> Self {
        ConversationConfig::new(subject)
    }
}

/// Bound to the inbound message that triggered an event, if any.
#[derive(Clone)]
pub struct Responder {
    bot: Bot,
    inbound: Option<Arc<InboundMessage>>,
}

impl std::fmt::Debug for Responder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Responder")
            .field("inbound", &self.inbound.as_ref().map(|m| &m.id))
            .finish()
    }
}

impl Responder {
    pub(crate) fn new(bot: Bot, inbound: Option<Arc<InboundMessage>>) -> Self {
        Self { bot, inbound }
    }

    pub fn inbound(&self) -> Option<&InboundMessage> {
        self.inbound.as_deref()
    }

    /// Send `message`.
    ///
    /// A reply, or a message with no addressing of its own, goes to everyone
    /// on the inbound message: its recipients plus the sender, and its cc.
    /// The bot's own addresses are left out.
    pub fn send(&self, mut message: OutboundMessage) -> std::result::Result<Delivery, OutboundError> {
        if let Some(inbound) = &self.inbound
            && (message.reply || !message.has_addressing())
        {
            let (recipients, cc) = audience(inbound, self.bot.config());
            message.recipients = Some(recipients);
            message.cc = Some(cc);
        }
        self.bot.outbox().send(self.inbound.as_deref(), message)
    }

    /// Send `message` as a reply to the inbound message.
    pub fn reply(&self, mut message: OutboundMessage) -> std::result::Result<Delivery, OutboundError> {
        message.reply = true;
        self.send(message)
    }

    /// Start a conversation and register it with the bot.
    ///
    /// `config` is a subject or a full `ConversationConfig`. When bound to an
    /// inbound message, a missing subject defaults to its subject, and when
    /// neither recipients nor cc are given the conversation includes everyone
    /// on the message.
    pub fn start_conversation<C, F>(&self, config: C, activate: F) -> Result<ConversationHandle>
    where
        C: Into<ConversationConfig>,
        F: FnOnce(&mut Conversation),
    {
        let mut config = config.into();
        if let Some(inbound) = &self.inbound {
            if config.subject.trim().is_empty() {
                config.subject = inbound.subject.clone();
            }
            if config.recipients.is_empty() && config.cc.is_empty() {
                let (recipients, cc) = audience(inbound, self.bot.config());
                config.recipients = recipients;
                config.cc = cc;
            }
        }
        self.begin(config, activate)
    }

    /// Start a conversation with only the sender of the inbound message.
    pub fn start_private_conversation<F>(
        &self,
        subject: impl Into<String>,
        activate: F,
    ) -> Result<ConversationHandle>
    where
        F: FnOnce(&mut Conversation),
    {
        let Some(inbound) = &self.inbound else {
            return Err(ConfigError::missing(
                "recipients",
                "A private conversation needs an inbound message to answer.",
            )
            .into());
        };
        let config = ConversationConfig::new(subject).with_recipients([inbound.from.clone()]);
        self.begin(config, activate)
    }

    fn begin<F>(&self, config: ConversationConfig, activate: F) -> Result<ConversationHandle>
    where
        F: FnOnce(&mut Conversation),
    {
        let handle = Conversation::create(config, self.bot.config(), self.bot.links())?;
        self.bot.register(handle.clone());
        handle.lock().start(activate)?;
        debug!(conversation_id = %handle.id(), status = %handle.status(), "Conversation begun");
        Ok(handle)
    }
}

/// Recipients and cc for answering `inbound`: everyone on it plus its sender,
/// without the bot itself and without duplicates.
fn audience(inbound: &InboundMessage, config: &BotConfig) -> (Vec<String>, Vec<String>) {
    let ours = [
        clean_address(&inbound.to),
        clean_address(&config.inbound_address),
        clean_address(&config.sending_address),
    ];
    let mut seen: Vec<String> = Vec::new();
    let mut keep = |address: &String| {
        let cleaned = clean_address(address);
        if cleaned.is_empty() || ours.contains(&cleaned) || seen.contains(&cleaned) {
            return false;
        }
        seen.push(cleaned);
        true
    };

    let recipients: Vec<String> = inbound
        .recipients
        .iter()
        .chain(std::iter::once(&inbound.from))
        .filter(|a| keep(a))
        .cloned()
        .collect();
    let cc: Vec<String> = inbound.cc.iter().filter(|a| keep(a)).cloned().collect();
    (recipients, cc)
}
