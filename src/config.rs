//! Configuration types.

use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};

use crate::error::ConfigError;

/// Header SparkPost-style relays use to carry the webhook auth token.
pub const WEBHOOK_TOKEN_HEADER: &str = "X-MessageSystems-Webhook-Token";

/// Bot configuration.
#[derive(Debug, Clone)]
pub struct BotConfig {
    /// Bot name, used as the From display name and for `mention` detection.
    pub bot_name: String,
    /// Address outbound mail is sent from. Its domain scopes conversation ids.
    pub sending_address: String,
    /// Address inbound mail is expected on.
    pub inbound_address: String,
    /// Public base URL of this server (webhook target).
    pub domain: String,
    /// Path the inbound webhook is mounted on.
    pub endpoint_path: String,
    /// Port the HTTP server listens on.
    pub port: u16,
    /// Drop inbound mail that was not sent to `inbound_address`.
    pub restrict_inbound: bool,
    /// Shared secret the relay sends with every webhook call.
    pub auth_token: Option<SecretString>,
    /// Conversation inactivity timeout.
    pub timeout_after: Duration,
    /// How many times a waiting conversation re-delivers a message.
    pub wait_count_max: u32,
    /// Delay between wait re-deliveries.
    pub wait_time: Duration,
    /// Run transport provisioning before triggering `ready`.
    pub run_setup: bool,
    /// Also fire `mention` / `direct_mention` for broadcast mail.
    pub detect_mentions: bool,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            bot_name: "Sparky".to_string(),
            sending_address: String::new(),
            inbound_address: String::new(),
            domain: "http://localhost".to_string(),
            endpoint_path: "/relay".to_string(),
            port: 3000,
            restrict_inbound: true,
            auth_token: None,
            timeout_after: Duration::from_secs(600), // 10 minutes
            wait_count_max: 3,
            wait_time: Duration::from_secs(30),
            run_setup: false,
            detect_mentions: false,
        }
    }
}

impl BotConfig {
    /// Config that sends from and receives on the same address.
    pub fn new(address: impl Into<String>) -> Self {
        let address = address.into();
        Self {
            sending_address: address.clone(),
            inbound_address: address,
            ..Self::default()
        }
    }

    pub fn with_bot_name(mut self, name: impl Into<String>) -> Self {
        self.bot_name = name.into();
        self
    }

    pub fn with_sending_address(mut self, address: impl Into<String>) -> Self {
        self.sending_address = address.into();
        self
    }

    pub fn with_inbound_address(mut self, address: impl Into<String>) -> Self {
        self.inbound_address = address.into();
        self
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self
    }

    pub fn with_restrict_inbound(mut self, restrict: bool) -> Self {
        self.restrict_inbound = restrict;
        self
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(SecretString::from(token.into()));
        self
    }

    pub fn with_timeout_after(mut self, timeout: Duration) -> Self {
        self.timeout_after = timeout;
        self
    }

    pub fn with_wait(mut self, count_max: u32, wait_time: Duration) -> Self {
        self.wait_count_max = count_max;
        self.wait_time = wait_time;
        self
    }

    pub fn with_detect_mentions(mut self, detect: bool) -> Self {
        self.detect_mentions = detect;
        self
    }

    /// Build config from environment variables.
    ///
    /// `FUSE_ADDRESS` seeds both addresses; `FUSE_SENDING_ADDRESS` and
    /// `FUSE_INBOUND_ADDRESS` override it individually.
    pub fn from_env() -> Result<Self, ConfigError> {
        let address = std::env::var("FUSE_ADDRESS").ok();
        let sending_address = std::env::var("FUSE_SENDING_ADDRESS")
            .ok()
            .or_else(|| address.clone())
            .ok_or_else(|| {
                ConfigError::missing("sending_address", "Set FUSE_ADDRESS or FUSE_SENDING_ADDRESS.")
            })?;
        let inbound_address = std::env::var("FUSE_INBOUND_ADDRESS")
            .ok()
            .or(address)
            .unwrap_or_else(|| sending_address.clone());

        let defaults = Self::default();

        Ok(Self {
            bot_name: std::env::var("FUSE_BOT_NAME").unwrap_or(defaults.bot_name),
            sending_address,
            inbound_address,
            domain: std::env::var("FUSE_DOMAIN").unwrap_or(defaults.domain),
            endpoint_path: std::env::var("FUSE_ENDPOINT").unwrap_or(defaults.endpoint_path),
            port: env_parse("FUSE_PORT")?.unwrap_or(defaults.port),
            restrict_inbound: env_parse("FUSE_RESTRICT_INBOUND")?
                .unwrap_or(defaults.restrict_inbound),
            auth_token: std::env::var("FUSE_AUTH_TOKEN")
                .ok()
                .filter(|s| !s.is_empty())
                .map(SecretString::from),
            timeout_after: env_parse("FUSE_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout_after),
            wait_count_max: env_parse("FUSE_WAIT_COUNT_MAX")?.unwrap_or(defaults.wait_count_max),
            wait_time: env_parse("FUSE_WAIT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.wait_time),
            run_setup: env_parse("FUSE_SETUP")?.unwrap_or(defaults.run_setup),
            detect_mentions: env_parse("FUSE_DETECT_MENTIONS")?
                .unwrap_or(defaults.detect_mentions),
        })
    }

    /// Check every field eagerly. Called by `Bot::new`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bot_name.trim().is_empty() {
            return Err(ConfigError::missing("bot_name", "Give the bot a name."));
        }
        validate_address("sending_address", &self.sending_address)?;
        validate_address("inbound_address", &self.inbound_address)?;
        if !self.endpoint_path.starts_with('/') {
            return Err(ConfigError::invalid(
                "endpoint_path",
                format!("{:?} must start with '/'", self.endpoint_path),
            ));
        }
        if self.timeout_after.is_zero() {
            return Err(ConfigError::invalid("timeout_after", "must be greater than zero"));
        }
        Ok(())
    }

    /// Domain part of the sending address.
    pub fn sending_domain(&self) -> &str {
        domain_of(&self.sending_address)
    }

    /// Domain part of the inbound address.
    pub fn inbound_domain(&self) -> &str {
        domain_of(&self.inbound_address)
    }

    /// Full URL the relay should post inbound mail to.
    pub fn webhook_target(&self) -> String {
        let port = if self.domain.contains("localhost") {
            format!(":{}", self.port)
        } else {
            String::new()
        };
        format!("{}{}{}", self.domain, port, self.endpoint_path)
    }

    /// Whether `token` matches the configured webhook token. Always true when none is set.
    pub fn token_matches(&self, token: Option<&str>) -> bool {
        match &self.auth_token {
            None => true,
            Some(expected) => token == Some(expected.expose_secret()),
        }
    }
}

/// Trim and lowercase an address for comparison.
pub fn clean_address(address: &str) -> String {
    address.trim().to_lowercase()
}

fn domain_of(address: &str) -> &str {
    address.rsplit_once('@').map(|(_, d)| d.trim()).unwrap_or("")
}

fn validate_address(key: &str, address: &str) -> Result<(), ConfigError> {
    if address.trim().is_empty() {
        return Err(ConfigError::missing(key, "Set an address like bot@example.com."));
    }
    match address.trim().split_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() && !domain.contains('@') => {
            Ok(())
        }
        _ => Err(ConfigError::invalid(key, format!("{address:?} is not an email address"))),
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::invalid(key, format!("cannot parse {raw:?}"))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_fills_both_addresses() {
        let config = BotConfig::new("robot@sendmailfor.me");
        assert_eq!(config.sending_address, "robot@sendmailfor.me");
        assert_eq!(config.inbound_address, "robot@sendmailfor.me");
        assert_eq!(config.endpoint_path, "/relay");
        assert!(config.restrict_inbound);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = BotConfig::default();
        assert_eq!(config.timeout_after, Duration::from_secs(600));
        assert_eq!(config.wait_count_max, 3);
        assert_eq!(config.wait_time, Duration::from_secs(30));
        assert!(!config.detect_mentions);
    }

    #[test]
    fn missing_address_fails_validation() {
        let err = BotConfig::default().validate().unwrap_err();
        assert!(matches!(err, ConfigError::MissingRequired { ref key, .. } if key == "sending_address"));
    }

    #[test]
    fn malformed_address_fails_validation() {
        let config = BotConfig::new("not-an-address");
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn endpoint_must_be_absolute() {
        let mut config = BotConfig::new("bot@x.com");
        config.endpoint_path = "relay".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn domains_are_split_from_addresses() {
        let config = BotConfig::new("bot@x.com").with_inbound_address("in@inbound.x.com");
        assert_eq!(config.sending_domain(), "x.com");
        assert_eq!(config.inbound_domain(), "inbound.x.com");
    }

    #[test]
    fn webhook_target_adds_port_for_localhost() {
        let config = BotConfig::new("bot@x.com");
        assert_eq!(config.webhook_target(), "http://localhost:3000/relay");

        let config = config.with_domain("https://bot.example.com");
        assert_eq!(config.webhook_target(), "https://bot.example.com/relay");
    }

    #[test]
    fn token_matching() {
        let open = BotConfig::new("bot@x.com");
        assert!(open.token_matches(None));

        let locked = open.with_auth_token("secret");
        assert!(locked.token_matches(Some("secret")));
        assert!(!locked.token_matches(Some("wrong")));
        assert!(!locked.token_matches(None));
    }

    #[test]
    fn clean_address_trims_and_lowercases() {
        assert_eq!(clean_address("  Bot@X.com "), "bot@x.com");
    }
}
