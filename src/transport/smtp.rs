//! Raw-MIME transport: parses RFC 822 webhook bodies with mail-parser and
//! delivers through an SMTP relay with lettre.

use async_trait::async_trait;
use lettre::message::header::{HeaderName, HeaderValue};
use lettre::message::{Mailbox, MultiPart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, Transport as _};
use mail_parser::MessageParser;
use secrecy::{ExposeSecret, SecretString};

use super::{SendReceipt, Transport};
use crate::config::BotConfig;
use crate::email::{Address, Headers, InboundMessage, OutboundMessage};
use crate::error::{ConfigError, TransportError};

const NAME: &str = "smtp";

#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
}

impl SmtpConfig {
    /// Build config from `SMTP_HOST`, `SMTP_PORT`, `SMTP_USERNAME`, `SMTP_PASSWORD`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let host = std::env::var("SMTP_HOST")
            .map_err(|_| ConfigError::missing("SMTP_HOST", "Set the SMTP relay host."))?;

        let port: u16 = std::env::var("SMTP_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(587);

        Ok(Self {
            host,
            port,
            username: std::env::var("SMTP_USERNAME").unwrap_or_default(),
            password: SecretString::from(std::env::var("SMTP_PASSWORD").unwrap_or_default()),
        })
    }
}

pub struct SmtpTransport {
    config: SmtpConfig,
}

impl SmtpTransport {
    pub fn new(config: SmtpConfig) -> Self {
        Self { config }
    }

    fn relay(&self) -> Result<lettre::SmtpTransport, TransportError> {
        let creds = Credentials::new(
            self.config.username.clone(),
            self.config.password.expose_secret().to_string(),
        );
        Ok(lettre::SmtpTransport::relay(&self.config.host)
            .map_err(|e| TransportError::Smtp(format!("relay error: {e}")))?
            .port(self.config.port)
            .credentials(creds)
            .build())
    }
}

#[async_trait]
impl Transport for SmtpTransport {
    fn name(&self) -> &str {
        NAME
    }

    /// The body is one raw RFC 822 message.
    fn parse(
        &self,
        body: &[u8],
        config: &BotConfig,
    ) -> Result<Vec<InboundMessage>, TransportError> {
        Ok(vec![parse_rfc822(body)?.with_defaults(config)])
    }

    async fn send(&self, message: &OutboundMessage) -> Result<SendReceipt, TransportError> {
        let email = build_message(message)?;
        let accepted = message.all_recipients().count();
        let relay = self.relay()?;

        // lettre's SmtpTransport is blocking
        tokio::task::spawn_blocking(move || relay.send(&email))
            .await
            .map_err(|e| TransportError::Smtp(format!("send task failed: {e}")))?
            .map_err(|e| TransportError::Smtp(format!("send failed: {e}")))?;

        tracing::info!(accepted, "Email sent via SMTP");
        Ok(SendReceipt {
            transport: NAME.into(),
            id: None,
            accepted,
            rejected: 0,
        })
    }
}

/// Parse one raw message into an `InboundMessage` (defaults not applied).
pub fn parse_rfc822(raw: &[u8]) -> Result<InboundMessage, TransportError> {
    let parsed = MessageParser::default()
        .parse(raw)
        .ok_or_else(|| TransportError::Parse("not an RFC 822 message".into()))?;

    let addresses = |addr: Option<&mail_parser::Address>| -> Vec<String> {
        addr.map(|a| {
            a.iter()
                .filter_map(|a| a.address())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
    };

    let headers: Headers = parsed
        .headers_raw()
        .map(|(name, value)| (name, value.split_whitespace().collect::<Vec<_>>().join(" ")))
        .collect();

    // Envelope recipient, when the relay recorded one
    let to = headers
        .first("x-original-to")
        .or_else(|| headers.first("delivered-to"))
        .unwrap_or("")
        .to_string();

    Ok(InboundMessage {
        to,
        from: addresses(parsed.from()).into_iter().next().unwrap_or_default(),
        recipients: addresses(parsed.to()),
        cc: addresses(parsed.cc()),
        bcc: addresses(parsed.bcc()),
        subject: parsed.subject().unwrap_or_default().to_string(),
        text: parsed
            .body_text(0)
            .map(|t| t.to_string())
            .unwrap_or_default(),
        html: parsed
            .body_html(0)
            .map(|h| h.to_string())
            .unwrap_or_default(),
        headers,
        ..InboundMessage::default()
    })
}

fn mailbox(address: &str) -> Result<Mailbox, TransportError> {
    address
        .parse()
        .map_err(|e| TransportError::Smtp(format!("invalid address {address:?}: {e}")))
}

fn named_mailbox(address: &Address) -> Result<Mailbox, TransportError> {
    let email = address
        .email
        .parse()
        .map_err(|e| TransportError::Smtp(format!("invalid address {:?}: {e}", address.email)))?;
    let name = (!address.name.is_empty()).then(|| address.name.clone());
    Ok(Mailbox::new(name, email))
}

/// Build a lettre message from a finalized outbound message.
fn build_message(message: &OutboundMessage) -> Result<Message, TransportError> {
    if message.template_id.is_some() {
        return Err(TransportError::Smtp("stored templates need a provider transport".into()));
    }

    let mut builder = Message::builder().subject(message.subject.clone().unwrap_or_default());
    if let Some(from) = &message.from {
        builder = builder.from(named_mailbox(from)?);
    }
    if let Some(reply_to) = &message.reply_to {
        builder = builder.reply_to(named_mailbox(reply_to)?);
    }
    for address in message.recipients.iter().flatten() {
        builder = builder.to(mailbox(address)?);
    }
    for address in message.cc.iter().flatten() {
        builder = builder.cc(mailbox(address)?);
    }
    for address in message.bcc.iter().flatten() {
        builder = builder.bcc(mailbox(address)?);
    }
    for (name, value) in &message.headers {
        builder = match name.to_ascii_lowercase().as_str() {
            "references" => builder.references(value.clone()),
            "in-reply-to" => builder.in_reply_to(value.clone()),
            _ => {
                let name = HeaderName::new_from_ascii(name.clone())
                    .map_err(|e| TransportError::Smtp(format!("invalid header {name:?}: {e}")))?;
                builder.raw_header(HeaderValue::new(name, value.clone()))
            }
        };
    }

    let text = message.text.clone().unwrap_or_default();
    let built = match &message.html {
        Some(html) => builder.multipart(MultiPart::alternative_plain_html(text, html.clone())),
        None => builder.body(text),
    };
    built.map_err(|e| TransportError::Smtp(format!("failed to build email: {e}")))
}
