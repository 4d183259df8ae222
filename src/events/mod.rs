//! Event names, pattern matching and the listener registry.

pub mod kind;
pub mod pattern;
pub mod registry;

pub use kind::{Event, IntoEvents};
pub use pattern::{HearMatch, IntoPatterns, MatchField, Pattern, Patterns};
pub use registry::{EventRegistry, HearTest, Hearable, ListenerId, Propagation};
