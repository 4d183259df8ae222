//! In-process transport. Records every send; parses JSON-encoded messages.
//!
//! Used by tests and for dry runs where no mail should leave the process.

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::Notify;

use super::{SendReceipt, Transport};
use crate::config::BotConfig;
use crate::email::{InboundMessage, OutboundMessage};
use crate::error::TransportError;

#[derive(Default)]
pub struct MemoryTransport {
    sent: Mutex<Vec<OutboundMessage>>,
    notify: Notify,
    fail_with: Option<String>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport whose every send fails with `reason`.
    pub fn failing(reason: impl Into<String>) -> Self {
        Self {
            fail_with: Some(reason.into()),
            ..Self::default()
        }
    }

    /// Messages delivered so far, in delivery order.
    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Wait until at least `count` messages were delivered.
    pub async fn wait_for_sent(&self, count: usize) -> Vec<OutboundMessage> {
        loop {
            let notified = self.notify.notified();
            let sent = self.sent();
            if sent.len() >= count {
                return sent;
            }
            notified.await;
        }
    }

    pub fn clear(&self) {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn name(&self) -> &str {
        "memory"
    }

    /// Accepts a single message object or an array of them.
    fn parse(
        &self,
        body: &[u8],
        config: &BotConfig,
    ) -> Result<Vec<InboundMessage>, TransportError> {
        let value: serde_json::Value =
            serde_json::from_slice(body).map_err(|e| TransportError::Parse(e.to_string()))?;
        let items = match value {
            serde_json::Value::Array(items) => items,
            other => vec![other],
        };
        items
            .into_iter()
            .map(|item| {
                serde_json::from_value::<InboundMessage>(item)
                    .map(|msg| msg.with_defaults(config))
                    .map_err(|e| TransportError::Parse(e.to_string()))
            })
            .collect()
    }

    async fn send(&self, message: &OutboundMessage) -> Result<SendReceipt, TransportError> {
        if let Some(reason) = &self.fail_with {
            return Err(TransportError::Request {
                transport: self.name().to_string(),
                reason: reason.clone(),
            });
        }

        let accepted = message.all_recipients().count();
        let id = {
            let mut sent = self.sent.lock().unwrap_or_else(PoisonError::into_inner);
            sent.push(message.clone());
            sent.len().to_string()
        };
        self.notify.notify_waiters();

        Ok(SendReceipt {
            transport: self.name().to_string(),
            id: Some(id),
            accepted,
            rejected: 0,
        })
    }
}
