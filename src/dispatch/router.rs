//! The bot: owns the event and conversation registries and routes every
//! inbound message either to the conversation it answers or to listeners.
//!
//! Dispatch is synchronous. No registry lock is held while a listener or a
//! conversation handler runs, so both may register listeners, start
//! conversations and send mail. A conversation handler must not feed a
//! message back into its own conversation synchronously; `wait` re-delivers
//! from a spawned task for that reason.

use std::sync::{Arc, Weak};

use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use super::classify;
use super::responder::Responder;
use crate::config::BotConfig;
use crate::conversation::{
    Conversation, ConversationConfig, ConversationHandle, ConversationLinks, ConversationRegistry,
    Handled, Redeliver,
};
use crate::email::InboundMessage;
use crate::error::{ConfigError, PatternError, Result, TransportError};
use crate::events::{
    Event, EventRegistry, HearMatch, IntoEvents, IntoPatterns, ListenerId, Patterns,
    Propagation,
};
use crate::transport::{Outbox, Transport, conversation_ids};

/// Arguments every listener receives.
#[derive(Debug, Clone)]
pub struct EmailEvent {
    pub event: Event,
    /// Empty for `ready` and other events triggered without a message.
    pub message: Arc<InboundMessage>,
    pub responder: Responder,
}

impl EmailEvent {
    /// Quote-stripped plain body of the message.
    pub fn text(&self) -> String {
        self.message.latest_text()
    }
}

struct BotInner {
    config: Arc<BotConfig>,
    transport: Arc<dyn Transport>,
    events: EventRegistry<EmailEvent>,
    conversations: ConversationRegistry,
    outbox: Outbox,
    runtime: Handle,
}

/// Cheap to clone; all clones share one set of registries.
#[derive(Clone)]
pub struct Bot {
    inner: Arc<BotInner>,
}

impl std::fmt::Debug for Bot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bot")
            .field("bot_name", &self.inner.config.bot_name)
            .field("transport", &self.inner.transport.name())
            .field("conversations", &self.inner.conversations.len())
            .finish()
    }
}

impl Bot {
    /// Validate `config` and start the delivery worker.
    ///
    /// Must be called from inside a tokio runtime; conversation timers and
    /// deliveries run on it.
    pub fn new(config: BotConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|_| {
            ConfigError::invalid("runtime", "Bot::new must be called inside a tokio runtime")
        })?;

        let config = Arc::new(config);
        let outbox = Outbox::spawn(Arc::clone(&transport), Arc::clone(&config));
        let events = EventRegistry::with_hear_test(Arc::new(
            |patterns: &Patterns, args: &EmailEvent| {
                patterns.match_email(&args.message.latest_text(), &args.message.subject)
            },
        ));

        info!(
            bot_name = %config.bot_name,
            address = %config.sending_address,
            transport = transport.name(),
            "Bot created"
        );

        Ok(Self {
            inner: Arc::new(BotInner {
                config,
                transport,
                events,
                conversations: ConversationRegistry::new(),
                outbox,
                runtime,
            }),
        })
    }

    pub fn config(&self) -> &BotConfig {
        &self.inner.config
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }

    pub fn events(&self) -> &EventRegistry<EmailEvent> {
        &self.inner.events
    }

    // ── Setup ───────────────────────────────────────────────────────

    /// Provision the transport when `run_setup` is set, then fire `ready`.
    pub async fn setup(&self) -> Result<()> {
        if self.inner.config.run_setup {
            info!(transport = self.inner.transport.name(), "Running transport setup");
            self.inner.transport.setup(&self.inner.config).await?;
            info!("Transport setup complete");
        }
        let events = self.inner.events.events();
        let listeners: usize = events.iter().map(|e| self.inner.events.listener_count(e)).sum();
        info!(events = events.len(), listeners, "Listeners registered");
        self.trigger(Event::Ready, None);
        Ok(())
    }

    // ── Listeners ───────────────────────────────────────────────────

    pub fn on<F>(&self, events: impl IntoEvents, listener: F) -> ListenerId
    where
        F: Fn(&EmailEvent) + Send + Sync + 'static,
    {
        self.inner.events.on(events, listener)
    }

    pub fn listen<F>(&self, events: impl IntoEvents, listener: F) -> ListenerId
    where
        F: Fn(&EmailEvent) -> Propagation + Send + Sync + 'static,
    {
        self.inner.events.listen(events, listener)
    }

    pub fn once<F>(&self, events: impl IntoEvents, listener: F) -> ListenerId
    where
        F: Fn(&EmailEvent) + Send + Sync + 'static,
    {
        self.inner.events.once(events, listener)
    }

    /// Fire `handler` when the body or the subject matches any pattern.
    /// Later listeners on the same trigger are skipped on a match.
    pub fn hears<F>(
        &self,
        patterns: impl IntoPatterns,
        events: impl IntoEvents,
        handler: F,
    ) -> std::result::Result<ListenerId, PatternError>
    where
        F: Fn(&EmailEvent, &HearMatch) + Send + Sync + 'static,
    {
        let patterns = Patterns::any(patterns)?;
        Ok(self.hears_in(patterns, events, handler))
    }

    /// `hears` with separate body and subject patterns.
    pub fn hears_in<F>(&self, patterns: Patterns, events: impl IntoEvents, handler: F) -> ListenerId
    where
        F: Fn(&EmailEvent, &HearMatch) + Send + Sync + 'static,
    {
        self.inner.events.hears(patterns, events, handler)
    }

    pub fn unset(&self, event: &Event, id: Option<ListenerId>) -> bool {
        self.inner.events.unset(event, id)
    }

    /// Drop every listener. Conversations are untouched.
    pub fn reset_events(&self) {
        self.inner.events.reset();
    }

    /// Fire `event` by hand, optionally bound to a message.
    pub fn trigger(&self, event: Event, message: Option<InboundMessage>) -> bool {
        let bound = message.is_some();
        let message = Arc::new(message.unwrap_or_default());
        let responder = self.responder(bound.then(|| Arc::clone(&message)));
        self.fire(event, message, responder)
    }

    // ── Inbound ─────────────────────────────────────────────────────

    /// Parse one webhook body and dispatch every message in it.
    ///
    /// Returns how many messages the body held.
    pub fn receive(&self, body: &[u8]) -> std::result::Result<usize, TransportError> {
        let messages = self.inner.transport.parse(body, &self.inner.config)?;
        let count = messages.len();
        debug!(count, transport = self.inner.transport.name(), "Parsed webhook body");
        for message in messages {
            self.handle(message);
        }
        Ok(count)
    }

    /// Route one message. Unroutable mail is logged and dropped, never an error.
    pub fn handle(&self, message: InboundMessage) {
        let config = &self.inner.config;
        let message = Arc::new(message.with_defaults(config));

        if !classify::admits(&message, config) {
            debug!(
                message_id = %message.id,
                to = %message.to,
                inbound_address = %config.inbound_address,
                "Dropping message not sent to the inbound address"
            );
            return;
        }

        if self.route_to_conversation(&message) {
            return;
        }
        self.broadcast(message);
    }

    /// Hand `message` to the active conversation it answers, if any.
    fn route_to_conversation(&self, message: &InboundMessage) -> bool {
        let ids = conversation_ids(message);
        if ids.is_empty() {
            return false;
        }

        // Every failed attempt leaves that conversation inactive, so this ends
        while let Some(conversation) = self.inner.conversations.find_active(&ids) {
            let handled = conversation.lock().handle(message);
            match handled {
                Ok(Handled::Consumed) => return true,
                Ok(Handled::Reroute) => {
                    debug!(
                        conversation_id = %conversation.id(),
                        message_id = %message.id,
                        "Conversation had no pending handler, rerouting"
                    );
                }
                Err(e) => debug!(error = %e, "Conversation ended before the message arrived"),
            }
        }

        debug!(message_id = %message.id, ids = ?ids, "No active conversation for message");
        false
    }

    fn broadcast(&self, message: Arc<InboundMessage>) {
        let config = &self.inner.config;
        let mut events = vec![classify::classify(&message, config)];
        if config.detect_mentions {
            events.extend(classify::mentions(&message, config));
        }
        events.push(Event::EmailReceived);

        debug!(
            message_id = %message.id,
            from = %message.from,
            events = ?events.iter().map(Event::as_str).collect::<Vec<_>>(),
            "Dispatching message"
        );

        let responder = self.responder(Some(Arc::clone(&message)));
        for event in events {
            self.fire(event, Arc::clone(&message), responder.clone());
        }
    }

    fn fire(&self, event: Event, message: Arc<InboundMessage>, responder: Responder) -> bool {
        let args = EmailEvent {
            event: event.clone(),
            message,
            responder,
        };
        self.inner.events.trigger(&event, &args)
    }

    // ── Conversations ───────────────────────────────────────────────

    /// Responder bound to `inbound`, or standalone when `None`.
    pub fn responder(&self, inbound: Option<Arc<InboundMessage>>) -> Responder {
        Responder::new(self.clone(), inbound)
    }

    /// Start a conversation not tied to any inbound message.
    ///
    /// `config` must name a subject and at least one participant.
    pub fn start_conversation<C, F>(&self, config: C, activate: F) -> Result<ConversationHandle>
    where
        C: Into<ConversationConfig>,
        F: FnOnce(&mut Conversation),
    {
        self.responder(None).start_conversation(config, activate)
    }

    /// Snapshot of every registered conversation, ended ones included.
    pub fn conversations(&self) -> Vec<ConversationHandle> {
        self.inner.conversations.snapshot()
    }

    pub fn conversation(&self, id: &str) -> Option<ConversationHandle> {
        self.inner.conversations.get(id)
    }

    /// Forget conversations that have ended.
    pub fn prune_conversations(&self) -> usize {
        self.inner.conversations.prune_inactive()
    }

    pub(crate) fn register(&self, conversation: ConversationHandle) {
        self.inner.conversations.append(conversation);
    }

    pub(crate) fn outbox(&self) -> &Outbox {
        &self.inner.outbox
    }

    /// Services for a new conversation. Re-delivery holds the bot weakly so
    /// conversations never keep it alive.
    pub(crate) fn links(&self) -> ConversationLinks {
        let bot: Weak<BotInner> = Arc::downgrade(&self.inner);
        let redeliver: Redeliver = Arc::new(move |message| match bot.upgrade() {
            Some(inner) => Bot { inner }.handle(message),
            None => warn!("Bot dropped before re-delivery"),
        });
        ConversationLinks {
            outbox: self.inner.outbox.clone(),
            redeliver,
            runtime: self.inner.runtime.clone(),
        }
    }
}
