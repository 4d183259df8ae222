//! Outbound delivery queue.
//!
//! `send` validates and enqueues synchronously, so conversation handlers
//! never block on the network. A single worker task drains the queue in
//! order, finalizes each message and hands it to the transport. The caller
//! gets a `Delivery` it may await or drop.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::{SendReceipt, Transport, apply_reply};
use crate::config::BotConfig;
use crate::email::{InboundMessage, OutboundMessage};
use crate::error::{OutboundError, TransportError};

struct Job {
    message: OutboundMessage,
    inbound: Option<InboundMessage>,
    done: oneshot::Sender<Result<SendReceipt, TransportError>>,
}

/// Handle to the delivery worker. Cheap to clone.
#[derive(Clone)]
pub struct Outbox {
    tx: mpsc::UnboundedSender<Job>,
}

impl Outbox {
    /// Spawn the delivery worker. Must be called inside a tokio runtime.
    pub fn spawn(transport: Arc<dyn Transport>, config: Arc<BotConfig>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();

        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let Job {
                    mut message,
                    inbound,
                    done,
                } = job;

                finalize(&mut message, inbound.as_ref(), &config);

                let result = transport.send(&message).await;
                match &result {
                    Ok(receipt) => debug!(
                        transport = transport.name(),
                        accepted = receipt.accepted,
                        "Delivered message"
                    ),
                    Err(e) => warn!(transport = transport.name(), error = %e, "Delivery failed"),
                }
                // Receiver may have been dropped
                let _ = done.send(result);
            }
            debug!("Outbox worker stopped");
        });

        Self { tx }
    }

    /// Validate and enqueue `message`.
    ///
    /// When `message.reply` is set and `inbound` is given, threading headers
    /// and subject are derived from `inbound` at delivery time.
    pub fn send(
        &self,
        inbound: Option<&InboundMessage>,
        message: OutboundMessage,
    ) -> Result<Delivery, OutboundError> {
        message.validate()?;
        if message.all_recipients().next().is_none() {
            return Err(OutboundError::NoRecipients);
        }

        let (done, rx) = oneshot::channel();
        let job = Job {
            message,
            inbound: inbound.cloned(),
            done,
        };
        if let Err(mpsc::error::SendError(job)) = self.tx.send(job) {
            // Worker gone; report through the delivery handle
            let _ = job.done.send(Err(TransportError::Closed));
        }
        Ok(Delivery { rx })
    }
}

fn finalize(message: &mut OutboundMessage, inbound: Option<&InboundMessage>, config: &BotConfig) {
    if message.reply
        && let Some(inbound) = inbound
    {
        apply_reply(message, inbound);
    }
    message.apply_defaults(config);
}

/// Completion handle for one queued send.
#[derive(Debug)]
pub struct Delivery {
    rx: oneshot::Receiver<Result<SendReceipt, TransportError>>,
}

impl Delivery {
    /// Wait for the transport's answer.
    pub async fn wait(self) -> Result<SendReceipt, TransportError> {
        self.rx.await.unwrap_or(Err(TransportError::Closed))
    }
}
