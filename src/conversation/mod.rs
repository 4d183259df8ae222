//! Multi-turn conversations threaded across reply chains.

pub mod registry;
pub mod session;
pub mod state;

pub use registry::ConversationRegistry;
pub use session::{
    Conversation, ConversationConfig, ConversationHandle, Handled, Handler, Outcome, Redeliver,
    TranscriptEntry,
};
pub(crate) use session::ConversationLinks;
pub use state::{ConversationStatus, StatusTransition};
