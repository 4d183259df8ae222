//! Event names the bot fires, plus an open slot for application events.

use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// An event listeners can register on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Event {
    /// Setup finished; the bot is accepting mail.
    Ready,
    /// The bot is in the To list.
    DirectEmail,
    /// The bot is in the Cc list.
    CcEmail,
    /// The bot is in neither list, so it was blind-copied.
    BccEmail,
    /// Fires for every broadcast message, after its classification event.
    EmailReceived,
    /// The body mentions the bot by name.
    Mention,
    /// The body contains the bot's address.
    DirectMention,
    /// Application-defined event.
    Custom(String),
}

impl Event {
    pub fn custom(name: impl Into<String>) -> Self {
        Self::Custom(name.into())
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Ready => "ready",
            Self::DirectEmail => "direct_email",
            Self::CcEmail => "cc_email",
            Self::BccEmail => "bcc_email",
            Self::EmailReceived => "email_received",
            Self::Mention => "mention",
            Self::DirectMention => "direct_mention",
            Self::Custom(name) => name,
        }
    }

    /// Parse a comma-separated list. Names are trimmed and blanks dropped.
    pub fn parse_list(names: &str) -> Vec<Event> {
        names
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| match s.parse() {
                Ok(event) => event,
                Err(never) => match never {},
            })
            .collect()
    }
}

impl FromStr for Event {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "ready" => Self::Ready,
            "direct_email" => Self::DirectEmail,
            "cc_email" => Self::CcEmail,
            "bcc_email" => Self::BccEmail,
            "email_received" => Self::EmailReceived,
            "mention" => Self::Mention,
            "direct_mention" => Self::DirectMention,
            other => Self::Custom(other.to_string()),
        })
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Anything that names one or more events.
pub trait IntoEvents {
    fn into_events(self) -> Vec<Event>;
}

impl IntoEvents for Event {
    fn into_events(self) -> Vec<Event> {
        vec![self]
    }
}

impl IntoEvents for Vec<Event> {
    fn into_events(self) -> Vec<Event> {
        self
    }
}

impl<const N: usize> IntoEvents for [Event; N] {
    fn into_events(self) -> Vec<Event> {
        self.into()
    }
}

impl IntoEvents for &[Event] {
    fn into_events(self) -> Vec<Event> {
        self.to_vec()
    }
}

impl IntoEvents for &str {
    fn into_events(self) -> Vec<Event> {
        Event::parse_list(self)
    }
}
