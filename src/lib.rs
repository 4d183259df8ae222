//! mailfuse: conversational email bots.
//!
//! Inbound mail arrives through a relay webhook, is parsed by a
//! [`Transport`](transport::Transport) and routed by a [`Bot`]: replies go to
//! the [`Conversation`](conversation::Conversation) they answer, everything
//! else is classified and broadcast to event listeners.

pub mod config;
pub mod conversation;
pub mod dispatch;
pub mod email;
pub mod error;
pub mod events;
pub mod server;
pub mod transport;

pub use config::BotConfig;
pub use conversation::{Conversation, ConversationConfig, ConversationStatus, Outcome};
pub use dispatch::{Bot, EmailEvent, Responder};
pub use email::{InboundMessage, OutboundMessage};
pub use error::{Error, Result};
pub use events::{Event, Patterns, Propagation};
