//! Error types for mailfuse.

/// Top-level error type for the bot.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Pattern error: {0}")]
    Pattern(#[from] PatternError),

    #[error("Outbound message error: {0}")]
    Outbound(#[from] OutboundError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Conversation error: {0}")]
    Conversation(#[from] ConversationError),
}

/// Configuration-related errors. Always raised at setup time.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

impl ConfigError {
    pub(crate) fn missing(key: &str, hint: &str) -> Self {
        Self::MissingRequired {
            key: key.to_string(),
            hint: hint.to_string(),
        }
    }

    pub(crate) fn invalid(key: &str, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.to_string(),
            message: message.into(),
        }
    }
}

/// A `hears` pattern failed to compile.
#[derive(Debug, thiserror::Error)]
pub enum PatternError {
    #[error("Error in pattern {pattern:?}: {source}")]
    Invalid {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// Malformed outbound request. Fatal to the single send call only.
#[derive(Debug, thiserror::Error)]
pub enum OutboundError {
    #[error("Message must have a subject, body or template at minimum")]
    Empty,

    #[error("Message cannot have both a template and inline content")]
    TemplateWithContent,

    #[error("Message has no recipients")]
    NoRecipients,
}

/// Delivery, parsing and provisioning failures reported by a transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("{transport} request failed: {reason}")]
    Request { transport: String, reason: String },

    #[error("{transport} API returned {status}: {body}")]
    Api {
        transport: String,
        status: u16,
        body: String,
    },

    #[error("Failed to parse inbound payload: {0}")]
    Parse(String),

    #[error("{transport} setup failed at {stage}: {reason}")]
    Setup {
        transport: String,
        stage: String,
        reason: String,
    },

    #[error("SMTP error: {0}")]
    Smtp(String),

    #[error("Outbox is closed")]
    Closed,
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        Self::Request {
            transport: "http".into(),
            reason: e.to_string(),
        }
    }
}

/// Conversation lifecycle misuse.
#[derive(Debug, thiserror::Error)]
pub enum ConversationError {
    #[error("Conversation {id} already started (status {status})")]
    NotPending { id: String, status: String },

    #[error("Conversation {id} is not active (status {status})")]
    Inactive { id: String, status: String },
}

/// Result type alias for the bot.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_display_includes_hint() {
        let err = ConfigError::missing("sending_address", "Set FUSE_ADDRESS.");
        assert_eq!(
            err.to_string(),
            "Missing required configuration: sending_address. Set FUSE_ADDRESS."
        );
    }

    #[test]
    fn pattern_error_names_the_pattern() {
        let source = regex::Regex::new("+").unwrap_err();
        let err = PatternError::Invalid {
            pattern: "+".into(),
            source,
        };
        assert!(err.to_string().starts_with("Error in pattern \"+\""));
    }

    #[test]
    fn top_level_wraps_outbound() {
        let err: Error = OutboundError::Empty.into();
        assert!(matches!(err, Error::Outbound(OutboundError::Empty)));
    }
}
