//! A single multi-turn exchange.
//!
//! A conversation owns its participant list, the one pending reply
//! handler, its inactivity timer and any scheduled wait re-deliveries.
//! It lives behind a mutex (`ConversationHandle`); every timer callback
//! takes that same lock, so a timeout can never interleave with `handle`.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tracing::{debug, info};
use uuid::Uuid;

use super::state::{ConversationStatus, StatusTransition};
use crate::config::{BotConfig, clean_address};
use crate::email::{InboundMessage, OutboundMessage};
use crate::error::{ConfigError, ConversationError, OutboundError};
use crate::transport::{Delivery, Outbox, correlation_header};

/// What a reply handler decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Turn done. The conversation finishes unless the handler asked again.
    Completed,
    /// Not ready yet: keep this handler armed, leave timer and wait count alone.
    Rearm,
    /// End the conversation now.
    Finished,
}

/// Processes the next reply in a conversation.
pub type Handler = Box<dyn FnMut(&mut Conversation, &InboundMessage) -> Outcome + Send>;

/// Sends a message back through the top-level dispatcher.
pub type Redeliver = Arc<dyn Fn(InboundMessage) + Send + Sync>;

/// Result of handing a reply to a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handled {
    /// A handler consumed the message.
    Consumed,
    /// Nothing was listening. The conversation ended and the message must be
    /// dispatched as ordinary mail.
    Reroute,
}

/// One entry of the sent/received log.
#[derive(Debug, Clone)]
pub enum TranscriptEntry {
    Sent(OutboundMessage),
    Received(InboundMessage),
}

/// How to start a conversation.
#[derive(Debug, Clone, Default)]
pub struct ConversationConfig {
    /// Topic; the subject of the first message.
    pub subject: String,
    pub recipients: Vec<String>,
    pub cc: Vec<String>,
    /// Overrides the bot's inactivity timeout.
    pub timeout_after: Option<Duration>,
}

impl ConversationConfig {
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            ..Self::default()
        }
    }

    pub fn with_recipients<I, S>(mut self, recipients: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.recipients = recipients.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_cc<I, S>(mut self, cc: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cc = cc.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout_after(mut self, timeout: Duration) -> Self {
        self.timeout_after = Some(timeout);
        self
    }

    /// A conversation needs a topic and someone to talk to.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.subject.trim().is_empty() {
            return Err(ConfigError::missing(
                "subject",
                "Give the conversation a subject.",
            ));
        }
        if self.recipients.is_empty() && self.cc.is_empty() {
            return Err(ConfigError::missing(
                "recipients",
                "A conversation needs at least one recipient.",
            ));
        }
        if self.timeout_after.is_some_and(|t| t.is_zero()) {
            return Err(ConfigError::invalid("timeout_after", "must be greater than zero"));
        }
        Ok(())
    }
}

/// Bot-owned services a conversation uses.
#[derive(Clone)]
pub(crate) struct ConversationLinks {
    pub outbox: Outbox,
    pub redeliver: Redeliver,
    pub runtime: Handle,
}

pub struct Conversation {
    id: String,
    topic: String,
    recipients: Vec<String>,
    cc: Vec<String>,
    status: ConversationStatus,
    transitions: Vec<StatusTransition>,
    handler: Option<Handler>,
    timeout_after: Duration,
    timer: Option<AbortHandle>,
    /// Bumped on every re-arm and cancel; a timer only fires for its own epoch.
    timer_epoch: u64,
    messages: Vec<InboundMessage>,
    transcript: Vec<TranscriptEntry>,
    sent_count: usize,
    wait_count: u32,
    wait_count_max: u32,
    wait_time: Duration,
    retries: Vec<AbortHandle>,
    created_at: DateTime<Utc>,
    links: ConversationLinks,
    this: Weak<Mutex<Conversation>>,
}

impl std::fmt::Debug for Conversation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conversation")
            .field("id", &self.id)
            .field("topic", &self.topic)
            .field("status", &self.status)
            .field("recipients", &self.recipients)
            .field("cc", &self.cc)
            .field("has_handler", &self.handler.is_some())
            .field("messages", &self.messages.len())
            .field("wait_count", &self.wait_count)
            .finish()
    }
}

impl Conversation {
    /// Create a pending conversation. Ids look like `<uuid>@<sending-domain>`.
    pub(crate) fn create(
        config: ConversationConfig,
        bot: &BotConfig,
        links: ConversationLinks,
    ) -> Result<ConversationHandle, ConfigError> {
        config.validate()?;

        let id = format!("{}@{}", Uuid::new_v4().simple(), bot.sending_domain());
        let inner = Arc::new_cyclic(|this| {
            Mutex::new(Conversation {
                id: id.clone(),
                topic: config.subject,
                recipients: config.recipients,
                cc: config.cc,
                status: ConversationStatus::Pending,
                transitions: Vec::new(),
                handler: None,
                timeout_after: config.timeout_after.unwrap_or(bot.timeout_after),
                timer: None,
                timer_epoch: 0,
                messages: Vec::new(),
                transcript: Vec::new(),
                sent_count: 0,
                wait_count: 0,
                wait_count_max: bot.wait_count_max,
                wait_time: bot.wait_time,
                retries: Vec::new(),
                created_at: Utc::now(),
                links,
                this: this.clone(),
            })
        });
        debug!(conversation_id = %id, "Conversation created");

        Ok(ConversationHandle {
            id: Arc::from(id),
            inner,
        })
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Activate, arm the timer and run `activate`, which may `ask`.
    ///
    /// If `activate` leaves no handler pending the conversation is over.
    pub fn start<F>(&mut self, activate: F) -> Result<(), ConversationError>
    where
        F: FnOnce(&mut Conversation),
    {
        if self.status != ConversationStatus::Pending {
            return Err(ConversationError::NotPending {
                id: self.id.clone(),
                status: self.status.to_string(),
            });
        }

        self.transition(ConversationStatus::Active);
        info!(conversation_id = %self.id, topic = %self.topic, "Conversation started");
        self.reset_timer();

        activate(self);

        if self.is_active() && self.handler.is_none() {
            self.end(ConversationStatus::Finished);
        }
        Ok(())
    }

    /// Feed a reply to the pending handler.
    pub fn handle(&mut self, inbound: &InboundMessage) -> Result<Handled, ConversationError> {
        if !self.is_active() {
            return Err(ConversationError::Inactive {
                id: self.id.clone(),
                status: self.status.to_string(),
            });
        }
        debug!(conversation_id = %self.id, message_id = %inbound.id, "Conversation received message");

        let Some(mut handler) = self.handler.take() else {
            // Addressed here but nothing is listening
            self.end(ConversationStatus::Finished);
            return Ok(Handled::Reroute);
        };

        self.record_inbound(inbound);

        match handler(self, inbound) {
            Outcome::Rearm => {
                if self.is_active() && self.handler.is_none() {
                    self.handler = Some(handler);
                }
            }
            Outcome::Completed => {
                if self.is_active() {
                    self.reset_timer();
                    self.wait_count = 0;
                    if self.handler.is_none() {
                        self.end(ConversationStatus::Finished);
                    }
                }
            }
            Outcome::Finished => self.end(ConversationStatus::Finished),
        }

        Ok(Handled::Consumed)
    }

    /// End with `status` (`Finished` if it is not terminal). Timers are
    /// cancelled first, unconditionally. Ending twice keeps the first status.
    pub fn end(&mut self, status: ConversationStatus) {
        self.cancel_timers();

        if self.status.is_terminal() {
            return;
        }
        let status = if status.is_terminal() {
            status
        } else {
            ConversationStatus::Finished
        };

        self.handler = None;
        self.transition(status);
        info!(
            conversation_id = %self.id,
            status = %status,
            messages = self.messages.len(),
            "Conversation ended"
        );
    }

    pub fn finish(&mut self) {
        self.end(ConversationStatus::Finished);
    }

    /// Called by the inactivity timer.
    pub fn timeout(&mut self) {
        self.end(ConversationStatus::Timeout);
    }

    // ── Sending ─────────────────────────────────────────────────────

    /// Send `message` to the conversation's participants.
    ///
    /// Before any reply arrived, the message opens the thread: it carries the
    /// correlation header and the topic as subject. Afterwards it is threaded
    /// as a reply to the latest inbound message.
    pub fn say(&mut self, mut message: OutboundMessage) -> Result<Delivery, OutboundError> {
        message.recipients = Some(self.recipients.clone());
        message.cc = Some(self.cc.clone());

        let latest = self.messages.last().cloned();
        if latest.is_some() {
            message.reply = true;
        } else {
            message
                .headers
                .insert("References".into(), correlation_header(&self.id));
            message.subject = Some(if self.sent_count == 0 {
                self.topic.clone()
            } else {
                format!("Re: {}", self.topic)
            });
        }

        let record = message.clone();
        let delivery = self.links.outbox.send(latest.as_ref(), message)?;
        self.transcript.push(TranscriptEntry::Sent(record));
        self.sent_count += 1;
        Ok(delivery)
    }

    /// Alias of `say`.
    pub fn send(&mut self, message: OutboundMessage) -> Result<Delivery, OutboundError> {
        self.say(message)
    }

    /// Send `message`, then wait for the reply with `handler`.
    pub fn ask<H>(&mut self, message: OutboundMessage, handler: H) -> Result<Delivery, OutboundError>
    where
        H: FnMut(&mut Conversation, &InboundMessage) -> Outcome + Send + 'static,
    {
        let delivery = self.say(message)?;
        self.handler = Some(Box::new(handler));
        Ok(delivery)
    }

    /// Wait for the next reply with `handler` without sending anything.
    pub fn expect_reply<H>(&mut self, handler: H)
    where
        H: FnMut(&mut Conversation, &InboundMessage) -> Outcome + Send + 'static,
    {
        self.handler = Some(Box::new(handler));
    }

    /// Defer the next reply: each time one arrives it is re-delivered after
    /// `wait_time`, until something else installs a real handler. Gives up
    /// with `Timeout` once `wait_count` passes `wait_count_max`.
    pub fn wait(&mut self) {
        debug!(conversation_id = %self.id, "Waiting before answering");
        self.handler = Some(Box::new(|convo: &mut Conversation, inbound: &InboundMessage| {
            convo.wait_turn(inbound)
        }));
    }

    fn wait_turn(&mut self, inbound: &InboundMessage) -> Outcome {
        self.wait_count += 1;
        if self.wait_count > self.wait_count_max {
            info!(
                conversation_id = %self.id,
                waited = self.wait_count_max,
                "Wait limit reached"
            );
            self.end(ConversationStatus::Timeout);
            return Outcome::Finished;
        }

        debug!(conversation_id = %self.id, wait_count = self.wait_count, "Scheduling re-delivery");
        let redeliver = Arc::clone(&self.links.redeliver);
        let delay = self.wait_time;
        let message = inbound.clone();
        let task = self.links.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            redeliver(message);
        });
        self.retries.retain(|r| !r.is_finished());
        self.retries.push(task.abort_handle());
        Outcome::Rearm
    }

    // ── Accessors ───────────────────────────────────────────────────

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn status(&self) -> ConversationStatus {
        self.status
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    pub fn recipients(&self) -> &[String] {
        &self.recipients
    }

    pub fn cc(&self) -> &[String] {
        &self.cc
    }

    /// Whether any reply has been received.
    pub fn has_messages(&self) -> bool {
        !self.messages.is_empty()
    }

    pub fn messages(&self) -> &[InboundMessage] {
        &self.messages
    }

    pub fn latest_message(&self) -> Option<&InboundMessage> {
        self.messages.last()
    }

    pub fn transcript(&self) -> &[TranscriptEntry] {
        &self.transcript
    }

    pub fn transitions(&self) -> &[StatusTransition] {
        &self.transitions
    }

    pub fn has_handler(&self) -> bool {
        self.handler.is_some()
    }

    pub fn wait_count(&self) -> u32 {
        self.wait_count
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Whether the timeout timer or a wait re-delivery is outstanding.
    pub fn has_pending_timers(&self) -> bool {
        self.timer.as_ref().is_some_and(|t| !t.is_finished())
            || self.retries.iter().any(|r| !r.is_finished())
    }

    /// Whether `address` takes part in this conversation.
    pub fn includes(&self, address: &str) -> bool {
        let address = clean_address(address);
        self.recipients
            .iter()
            .chain(&self.cc)
            .any(|a| clean_address(a) == address)
    }

    // ── Internals ───────────────────────────────────────────────────

    fn transition(&mut self, to: ConversationStatus) {
        debug_assert!(self.status.can_transition_to(to));
        self.transitions.push(StatusTransition::new(self.status, to));
        self.status = to;
    }

    fn record_inbound(&mut self, inbound: &InboundMessage) {
        // Wait re-deliveries hand back the same message
        if self.messages.last().is_some_and(|last| last.id == inbound.id) {
            return;
        }
        self.messages.push(inbound.clone());
        self.transcript.push(TranscriptEntry::Received(inbound.clone()));
    }

    fn reset_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        self.timer_epoch += 1;

        let epoch = self.timer_epoch;
        let this = self.this.clone();
        let after = self.timeout_after;
        let task = self.links.runtime.spawn(async move {
            tokio::time::sleep(after).await;
            if let Some(convo) = this.upgrade() {
                let mut convo = convo.lock().unwrap_or_else(PoisonError::into_inner);
                if convo.timer_epoch == epoch {
                    debug!(conversation_id = %convo.id, "Conversation timed out");
                    convo.timeout();
                }
            }
        });
        self.timer = Some(task.abort_handle());
    }

    fn cancel_timers(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        self.timer_epoch += 1;
        for retry in self.retries.drain(..) {
            retry.abort();
        }
    }
}

/// Shared, lockable conversation.
#[derive(Clone)]
pub struct ConversationHandle {
    id: Arc<str>,
    inner: Arc<Mutex<Conversation>>,
}

impl ConversationHandle {
    /// Immutable id, readable without locking.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn lock(&self) -> MutexGuard<'_, Conversation> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn status(&self) -> ConversationStatus {
        self.lock().status()
    }

    pub fn is_active(&self) -> bool {
        self.lock().is_active()
    }

    /// Status without blocking. `None` while the conversation is locked,
    /// which means a handler, activation callback or timer is running on it.
    pub fn try_status(&self) -> Option<ConversationStatus> {
        match self.inner.try_lock() {
            Ok(conversation) => Some(conversation.status()),
            Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner().status()),
            Err(TryLockError::WouldBlock) => None,
        }
    }
}

impl std::fmt::Debug for ConversationHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ConversationHandle").field(&self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::sync::mpsc;

    use super::*;
    use crate::email::Headers;
    use crate::transport::MemoryTransport;

    struct Fixture {
        transport: Arc<MemoryTransport>,
        links: ConversationLinks,
        bot: BotConfig,
        redelivered: mpsc::UnboundedReceiver<InboundMessage>,
    }

    fn fixture(bot: BotConfig) -> Fixture {
        let transport = Arc::new(MemoryTransport::new());
        let outbox = Outbox::spawn(transport.clone(), Arc::new(bot.clone()));
        let (tx, redelivered) = mpsc::unbounded_channel();
        let links = ConversationLinks {
            outbox,
            redeliver: Arc::new(move |msg| {
                let _ = tx.send(msg);
            }),
            runtime: Handle::current(),
        };
        Fixture {
            transport,
            links,
            bot,
            redelivered,
        }
    }

    fn bot() -> BotConfig {
        BotConfig::new("bot@x.com")
    }

    fn topic() -> ConversationConfig {
        ConversationConfig::new("Lunch").with_recipients(["alice@y.com"])
    }

    fn reply(id: &str, text: &str) -> InboundMessage {
        InboundMessage {
            id: id.into(),
            from: "alice@y.com".into(),
            to: "bot@x.com".into(),
            subject: "Re: Lunch".into(),
            text: text.into(),
            headers: [("message-id", id)].into_iter().collect::<Headers>(),
            ..InboundMessage::default()
        }
    }

    #[tokio::test]
    async fn config_requires_subject_and_recipients() {
        let f = fixture(bot());
        assert!(matches!(
            Conversation::create(ConversationConfig::new(""), &f.bot, f.links.clone()),
            Err(ConfigError::MissingRequired { ref key, .. }) if key == "subject"
        ));
        assert!(matches!(
            Conversation::create(ConversationConfig::new("Lunch"), &f.bot, f.links.clone()),
            Err(ConfigError::MissingRequired { ref key, .. }) if key == "recipients"
        ));
    }

    #[tokio::test]
    async fn id_is_scoped_to_sending_domain() {
        let f = fixture(bot());
        let a = Conversation::create(topic(), &f.bot, f.links.clone()).unwrap();
        let b = Conversation::create(topic(), &f.bot, f.links.clone()).unwrap();
        assert!(a.id().ends_with("@x.com"));
        assert_ne!(a.id(), b.id());
        assert_eq!(a.status(), ConversationStatus::Pending);
    }

    #[tokio::test]
    async fn start_without_question_finishes() {
        let f = fixture(bot());
        let handle = Conversation::create(topic(), &f.bot, f.links.clone()).unwrap();

        let mut convo = handle.lock();
        convo
            .start(|c| {
                c.say(OutboundMessage::text("Hello!")).unwrap();
            })
            .unwrap();

        assert_eq!(convo.status(), ConversationStatus::Finished);
        assert_eq!(convo.transcript().len(), 1);
        assert!(!convo.has_pending_timers());
        assert!(!convo.has_handler());
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let f = fixture(bot());
        let handle = Conversation::create(topic(), &f.bot, f.links.clone()).unwrap();
        let mut convo = handle.lock();
        convo.start(|_| {}).unwrap();
        assert!(matches!(
            convo.start(|_| {}),
            Err(ConversationError::NotPending { .. })
        ));
    }

    #[tokio::test]
    async fn first_message_opens_thread() {
        let f = fixture(bot());
        let handle = Conversation::create(
            topic().with_cc(["carol@y.com"]),
            &f.bot,
            f.links.clone(),
        )
        .unwrap();
        let id = handle.id().to_string();

        handle
            .lock()
            .start(|c| {
                c.say(OutboundMessage::text("one")).unwrap();
                c.ask(OutboundMessage::text("two"), |_, _| Outcome::Completed)
                    .unwrap();
            })
            .unwrap();

        let sent = f.transport.wait_for_sent(2).await;
        assert_eq!(sent[0].subject.as_deref(), Some("Lunch"));
        assert_eq!(sent[1].subject.as_deref(), Some("Re: Lunch"));
        assert_eq!(
            sent[0].headers.get("References"),
            Some(&format!("<conversation-id_{id}>"))
        );
        assert_eq!(sent[0].recipients, Some(vec!["alice@y.com".to_string()]));
        assert_eq!(sent[0].cc, Some(vec!["carol@y.com".to_string()]));
        assert!(handle.is_active());
    }

    #[tokio::test]
    async fn replies_thread_under_latest_message_with_fixed_participants() {
        let f = fixture(bot());
        let handle = Conversation::create(topic(), &f.bot, f.links.clone()).unwrap();
        handle
            .lock()
            .start(|c| {
                c.ask(OutboundMessage::text("Where?"), |c, _| {
                    c.say(OutboundMessage::text("Great")).unwrap();
                    Outcome::Completed
                })
                .unwrap();
            })
            .unwrap();

        // A reply that drags in an extra participant
        let mut inbound = reply("<r1@y.com>", "The usual");
        inbound.cc = vec!["mallory@z.com".into()];
        assert_eq!(handle.lock().handle(&inbound).unwrap(), Handled::Consumed);

        let sent = f.transport.wait_for_sent(2).await;
        assert_eq!(sent[1].subject.as_deref(), Some("Re: Lunch"));
        assert_eq!(
            sent[1].headers.get("In-Reply-To").map(String::as_str),
            Some("<r1@y.com>")
        );
        assert_eq!(sent[1].recipients, Some(vec!["alice@y.com".to_string()]));
        assert_eq!(sent[1].cc, Some(vec![]));
        assert_eq!(handle.status(), ConversationStatus::Finished);
    }

    #[tokio::test]
    async fn handler_chain_keeps_conversation_open() {
        let f = fixture(bot());
        let handle = Conversation::create(topic(), &f.bot, f.links.clone()).unwrap();
        handle
            .lock()
            .start(|c| {
                c.ask(OutboundMessage::text("Name?"), |c, _| {
                    c.ask(OutboundMessage::text("Age?"), |_, _| Outcome::Completed)
                        .unwrap();
                    Outcome::Completed
                })
                .unwrap();
            })
            .unwrap();

        let mut convo = handle.lock();
        convo.handle(&reply("<r1@y.com>", "Alice")).unwrap();
        assert!(convo.is_active());
        assert!(convo.has_handler());

        convo.handle(&reply("<r2@y.com>", "30")).unwrap();
        assert_eq!(convo.status(), ConversationStatus::Finished);
        assert_eq!(convo.messages().len(), 2);
        // 2 questions, 2 replies
        assert_eq!(convo.transcript().len(), 4);
    }

    #[tokio::test]
    async fn handle_without_handler_reroutes() {
        let f = fixture(bot());
        let handle = Conversation::create(topic(), &f.bot, f.links.clone()).unwrap();
        let mut convo = handle.lock();
        convo
            .start(|c| c.expect_reply(|_, _| Outcome::Completed))
            .unwrap();
        convo.handler = None;

        assert_eq!(
            convo.handle(&reply("<r1@y.com>", "hi")).unwrap(),
            Handled::Reroute
        );
        assert_eq!(convo.status(), ConversationStatus::Finished);
        assert!(!convo.has_messages());
    }

    #[tokio::test]
    async fn handle_rejects_inactive() {
        let f = fixture(bot());
        let handle = Conversation::create(topic(), &f.bot, f.links.clone()).unwrap();
        let mut convo = handle.lock();
        assert!(matches!(
            convo.handle(&reply("<r1@y.com>", "hi")),
            Err(ConversationError::Inactive { .. })
        ));
    }

    #[tokio::test]
    async fn explicit_finish_outcome_ends() {
        let f = fixture(bot());
        let handle = Conversation::create(topic(), &f.bot, f.links.clone()).unwrap();
        let mut convo = handle.lock();
        convo
            .start(|c| {
                c.expect_reply(|c, _| {
                    c.expect_reply(|_, _| Outcome::Completed);
                    Outcome::Finished
                })
            })
            .unwrap();
        convo.handle(&reply("<r1@y.com>", "bye")).unwrap();
        assert_eq!(convo.status(), ConversationStatus::Finished);
        assert!(!convo.has_handler());
    }

    #[tokio::test]
    async fn end_is_idempotent() {
        let f = fixture(bot());
        let handle = Conversation::create(topic(), &f.bot, f.links.clone()).unwrap();
        let mut convo = handle.lock();
        convo
            .start(|c| c.expect_reply(|_, _| Outcome::Completed))
            .unwrap();
        assert!(convo.has_pending_timers());

        convo.end(ConversationStatus::Timeout);
        convo.end(ConversationStatus::Finished);
        convo.finish();

        assert_eq!(convo.status(), ConversationStatus::Timeout);
        assert!(!convo.has_pending_timers());
        assert_eq!(convo.transitions().len(), 2);
    }

    #[tokio::test]
    async fn times_out_without_reply() {
        let f = fixture(bot());
        let handle = Conversation::create(
            topic().with_timeout_after(Duration::from_millis(50)),
            &f.bot,
            f.links.clone(),
        )
        .unwrap();
        handle
            .lock()
            .start(|c| {
                c.ask(OutboundMessage::text("Anyone?"), |_, _| Outcome::Completed)
                    .unwrap();
            })
            .unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        let convo = handle.lock();
        assert_eq!(convo.status(), ConversationStatus::Timeout);
        assert!(!convo.has_handler());
    }

    #[tokio::test]
    async fn reply_resets_timeout() {
        let f = fixture(bot());
        let handle = Conversation::create(
            topic().with_timeout_after(Duration::from_millis(100)),
            &f.bot,
            f.links.clone(),
        )
        .unwrap();
        handle
            .lock()
            .start(|c| {
                c.expect_reply(|c, _| {
                    c.expect_reply(|_, _| Outcome::Completed);
                    Outcome::Completed
                })
            })
            .unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        handle.lock().handle(&reply("<r1@y.com>", "hi")).unwrap();

        // Past the original deadline, inside the new one
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(handle.is_active());

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(handle.status(), ConversationStatus::Timeout);
    }

    #[tokio::test]
    async fn wait_redelivers_then_gives_up() {
        let mut f = fixture(bot().with_wait(3, Duration::from_millis(10)));
        let handle = Conversation::create(topic(), &f.bot, f.links.clone()).unwrap();
        handle
            .lock()
            .start(|c| {
                c.expect_reply(|c, _| {
                    c.wait();
                    Outcome::Completed
                })
            })
            .unwrap();

        handle.lock().handle(&reply("<r1@y.com>", "first")).unwrap();
        assert!(handle.is_active());

        let pending = reply("<r2@y.com>", "second");
        handle.lock().handle(&pending).unwrap();
        assert_eq!(handle.lock().wait_count(), 1);

        // Feed each re-delivery back in, as the router would
        let mut rounds = 0;
        while handle.is_active() {
            let msg = f.redelivered.recv().await.unwrap();
            assert_eq!(msg.id, pending.id);
            handle.lock().handle(&msg).unwrap();
            rounds += 1;
        }

        let convo = handle.lock();
        assert_eq!(rounds, 3);
        assert_eq!(convo.wait_count(), 4);
        assert_eq!(convo.status(), ConversationStatus::Timeout);
        // Re-deliveries are not appended again
        assert_eq!(convo.messages().len(), 2);
        assert!(!convo.has_pending_timers());
    }

    #[tokio::test]
    async fn real_handler_replaces_wait() {
        let f = fixture(bot().with_wait(3, Duration::from_millis(10)));
        let handle = Conversation::create(topic(), &f.bot, f.links.clone()).unwrap();
        let answered = Arc::new(AtomicUsize::new(0));

        handle
            .lock()
            .start(|c| c.wait())
            .unwrap();

        let msg = reply("<r1@y.com>", "question");
        handle.lock().handle(&msg).unwrap();
        assert_eq!(handle.lock().wait_count(), 1);

        // Work finished elsewhere; install the real handler
        let counter = Arc::clone(&answered);
        handle.lock().expect_reply(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Outcome::Completed
        });
        handle.lock().handle(&msg).unwrap();

        assert_eq!(answered.load(Ordering::SeqCst), 1);
        let convo = handle.lock();
        assert_eq!(convo.status(), ConversationStatus::Finished);
        assert_eq!(convo.wait_count(), 0);
    }

    #[tokio::test]
    async fn includes_compares_cleaned_addresses() {
        let f = fixture(bot());
        let handle = Conversation::create(topic(), &f.bot, f.links.clone()).unwrap();
        assert!(handle.lock().includes(" Alice@Y.com"));
        assert!(!handle.lock().includes("bob@y.com"));
    }
}
