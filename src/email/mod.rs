//! Email message model and text helpers.

pub mod text;
pub mod types;

pub use types::{Address, HeaderValue, Headers, InboundMessage, OutboundMessage};
