//! Conversation state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status of a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    /// Created but not started.
    Pending,
    /// Accepting replies.
    Active,
    /// Ended normally or explicitly.
    Finished,
    /// No reply arrived in time, or the wait pattern gave up.
    Timeout,
}

impl ConversationStatus {
    /// Check if this status allows transitioning to another status.
    pub fn can_transition_to(&self, target: ConversationStatus) -> bool {
        use ConversationStatus::*;

        matches!(
            (self, target),
            (Pending, Active) | (Pending, Finished) | (Pending, Timeout) |
            (Active, Finished) | (Active, Timeout)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Timeout)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }
}

impl std::fmt::Display for ConversationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Finished => "finished",
            Self::Timeout => "timeout",
        };
        write!(f, "{s}")
    }
}

/// A recorded status change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusTransition {
    pub from: ConversationStatus,
    pub to: ConversationStatus,
    pub timestamp: DateTime<Utc>,
}

impl StatusTransition {
    pub fn new(from: ConversationStatus, to: ConversationStatus) -> Self {
        Self {
            from,
            to,
            timestamp: Utc::now(),
        }
    }
}
