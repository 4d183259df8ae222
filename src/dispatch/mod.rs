//! Inbound routing: admission, conversation lookup, classification and
//! the responder handed to listeners.

pub mod classify;
pub mod responder;
pub mod router;

pub use classify::{admits, classify, mentions};
pub use responder::Responder;
pub use router::{Bot, EmailEvent};
