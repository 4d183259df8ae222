//! SparkPost transport: relay-webhook parsing, transmissions, provisioning.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use super::{SendReceipt, Transport};
use crate::config::BotConfig;
use crate::email::{Headers, InboundMessage, OutboundMessage};
use crate::error::{ConfigError, TransportError};

const NAME: &str = "sparkpost";
const DEFAULT_API_URL: &str = "https://api.sparkpost.com/api/v1";

#[derive(Debug, Clone)]
pub struct SparkPostConfig {
    pub api_key: SecretString,
    pub api_url: String,
}

impl SparkPostConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: SecretString::from(api_key.into()),
            api_url: DEFAULT_API_URL.to_string(),
        }
    }

    /// Build config from `SPARKPOST_API_KEY` and optional `SPARKPOST_API_URL`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_key = std::env::var("SPARKPOST_API_KEY").map_err(|_| {
            ConfigError::missing("SPARKPOST_API_KEY", "Create an API key in SparkPost.")
        })?;
        let mut config = Self::new(api_key);
        if let Ok(url) = std::env::var("SPARKPOST_API_URL") {
            config.api_url = url.trim_end_matches('/').to_string();
        }
        Ok(config)
    }
}

pub struct SparkPostTransport {
    config: SparkPostConfig,
    client: reqwest::Client,
}

impl SparkPostTransport {
    pub fn new(config: SparkPostConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}/{path}", self.config.api_url)
    }

    async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value, TransportError> {
        let mut req = self
            .client
            .request(method, self.api_url(path))
            .header(reqwest::header::AUTHORIZATION, self.config.api_key.expose_secret());
        if let Some(body) = body {
            req = req.json(body);
        }

        let resp = req.send().await.map_err(|e| TransportError::Request {
            transport: NAME.into(),
            reason: e.to_string(),
        })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(TransportError::Api {
                transport: NAME.into(),
                status: status.as_u16(),
                body: resp.text().await.unwrap_or_default(),
            });
        }

        resp.json::<Value>().await.or(Ok(Value::Null))
    }

    async fn get(&self, path: &str) -> Result<Value, TransportError> {
        self.request(reqwest::Method::GET, path, None).await
    }

    /// `Ok(false)` only when the resource does not exist; any other failure
    /// is returned as is.
    async fn lookup(&self, path: &str) -> Result<bool, TransportError> {
        match self.get(path).await {
            Ok(_) => Ok(true),
            Err(TransportError::Api { status: 404, .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn post(&self, path: &str, body: &Value) -> Result<Value, TransportError> {
        self.request(reqwest::Method::POST, path, Some(body)).await
    }

    async fn setup_sending_domain(&self, domain: &str) -> Result<(), TransportError> {
        debug!(domain, "Looking up sending domain");
        let found = self
            .lookup(&format!("sending-domains/{domain}"))
            .await
            .map_err(|e| stage_error("sending_domain", e))?;
        if !found {
            debug!(domain, "Creating sending domain");
            self.post("sending-domains", &json!({ "domain": domain }))
                .await
                .map_err(|e| stage_error("sending_domain", e))?;
        }

        let verified = self
            .post(
                &format!("sending-domains/{domain}/verify"),
                &json!({ "dkim_verify": true, "spf_verify": true }),
            )
            .await
            .map_err(|e| stage_error("sending_domain", e))?;

        if verified["results"]["ownership_verified"].as_bool() != Some(true) {
            return Err(TransportError::Setup {
                transport: NAME.into(),
                stage: "sending_domain".into(),
                reason: format!("{domain} is not verified; add its DKIM/SPF records"),
            });
        }
        info!(domain, "Sending domain verified");
        Ok(())
    }

    async fn setup_inbound_domain(&self, domain: &str) -> Result<(), TransportError> {
        debug!(domain, "Looking up inbound domain");
        let found = self
            .lookup(&format!("inbound-domains/{domain}"))
            .await
            .map_err(|e| stage_error("inbound_domain", e))?;
        if !found {
            debug!(domain, "Creating inbound domain");
            self.post("inbound-domains", &json!({ "domain": domain }))
                .await
                .map_err(|e| stage_error("inbound_domain", e))?;
        }
        info!(domain, "Inbound domain ready");
        Ok(())
    }

    async fn setup_webhook(&self, config: &BotConfig) -> Result<(), TransportError> {
        let domain = config.inbound_domain();
        let wanted = webhook_options(config);

        let existing = self
            .get("relay-webhooks")
            .await
            .map_err(|e| stage_error("webhook", e))?;
        let same_domain = existing["results"]
            .as_array()
            .and_then(|hooks| hooks.iter().find(|h| h["match"]["domain"] == domain));

        match same_domain {
            None => {
                debug!(domain, "Creating relay webhook");
                self.post("relay-webhooks", &wanted)
                    .await
                    .map_err(|e| stage_error("webhook", e))?;
            }
            Some(hook)
                if hook["target"] != wanted["target"]
                    || hook["auth_token"] != wanted["auth_token"] =>
            {
                let id = hook["id"].as_str().unwrap_or_default();
                debug!(domain, id, "Updating relay webhook");
                self.request(
                    reqwest::Method::PUT,
                    &format!("relay-webhooks/{id}"),
                    Some(&wanted),
                )
                .await
                .map_err(|e| stage_error("webhook", e))?;
            }
            Some(_) => debug!(domain, "Relay webhook up to date"),
        }
        info!(webhook = %config.webhook_target(), "Relay webhook ready");
        Ok(())
    }
}

fn stage_error(stage: &str, e: TransportError) -> TransportError {
    TransportError::Setup {
        transport: NAME.into(),
        stage: stage.into(),
        reason: e.to_string(),
    }
}

fn webhook_options(config: &BotConfig) -> Value {
    let mut options = json!({
        "name": format!("{} Webhook", config.bot_name),
        "target": config.webhook_target(),
        "match": { "protocol": "SMTP", "domain": config.inbound_domain() },
    });
    if let Some(token) = &config.auth_token {
        options["auth_token"] = Value::String(token.expose_secret().to_string());
    }
    options
}

#[async_trait]
impl Transport for SparkPostTransport {
    fn name(&self) -> &str {
        NAME
    }

    /// Sending domain, then inbound domain, then relay webhook. Each stage
    /// depends on the previous one.
    async fn setup(&self, config: &BotConfig) -> Result<(), TransportError> {
        info!("SparkPost setup started");
        self.setup_sending_domain(config.sending_domain()).await?;
        self.setup_inbound_domain(config.inbound_domain()).await?;
        self.setup_webhook(config).await?;
        info!("SparkPost setup complete");
        Ok(())
    }

    fn parse(
        &self,
        body: &[u8],
        config: &BotConfig,
    ) -> Result<Vec<InboundMessage>, TransportError> {
        parse_relay_batch(body, config)
    }

    async fn send(&self, message: &OutboundMessage) -> Result<SendReceipt, TransportError> {
        let body = transmission(message);
        let resp = self.post("transmissions", &body).await?;
        let results = &resp["results"];
        Ok(SendReceipt {
            transport: NAME.into(),
            id: results["id"].as_str().map(String::from),
            accepted: results["total_accepted_recipients"].as_u64().unwrap_or(0) as usize,
            rejected: results["total_rejected_recipients"].as_u64().unwrap_or(0) as usize,
        })
    }
}

// ── Relay webhook payload ───────────────────────────────────────────

#[derive(Deserialize)]
struct RelayEvent {
    msys: RelayEnvelope,
}

#[derive(Deserialize)]
struct RelayEnvelope {
    relay_message: RelayMessage,
}

#[derive(Deserialize)]
struct RelayMessage {
    #[serde(default)]
    rcpt_to: String,
    #[serde(default)]
    msg_from: String,
    content: RelayContent,
}

#[derive(Deserialize)]
struct RelayContent {
    #[serde(default)]
    subject: String,
    #[serde(default)]
    text: String,
    #[serde(default)]
    html: String,
    #[serde(default)]
    to: Vec<String>,
    #[serde(default)]
    cc: Vec<String>,
    /// One single-key object per header line.
    #[serde(default)]
    headers: Vec<serde_json::Map<String, Value>>,
}

/// Parse one relay delivery. Events that are not relay messages are
/// skipped with a warning; the rest of the batch is still delivered.
fn parse_relay_batch(body: &[u8], config: &BotConfig) -> Result<Vec<InboundMessage>, TransportError> {
    let raw: Vec<Value> =
        serde_json::from_slice(body).map_err(|e| TransportError::Parse(e.to_string()))?;

    let messages = raw
        .into_iter()
        .enumerate()
        .filter_map(|(index, item)| match relay_message(&item, config) {
            Ok(msg) => Some(msg),
            Err(e) => {
                warn!(index, error = %e, "Skipping relay event");
                None
            }
        })
        .collect();
    Ok(messages)
}

fn relay_message(item: &Value, config: &BotConfig) -> Result<InboundMessage, TransportError> {
    let event = RelayEvent::deserialize(item).map_err(|e| TransportError::Parse(e.to_string()))?;
    let relay = event.msys.relay_message;

    let headers: Headers = relay
        .content
        .headers
        .iter()
        .flat_map(|line| line.iter())
        .map(|(name, value)| {
            let value = value.as_str().map(String::from).unwrap_or_else(|| value.to_string());
            (name.as_str(), value)
        })
        .collect();

    let msg = InboundMessage {
        to: relay.rcpt_to,
        from: relay.msg_from,
        recipients: relay.content.to,
        cc: relay.content.cc,
        subject: relay.content.subject,
        text: relay.content.text,
        html: relay.content.html,
        headers,
        raw: item["msys"]["relay_message"].clone(),
        ..InboundMessage::default()
    };
    Ok(msg.with_defaults(config))
}

// ── Transmissions ───────────────────────────────────────────────────

fn transmission(message: &OutboundMessage) -> Value {
    let cc = message.cc.clone().unwrap_or_default();
    let header_to = message
        .recipients
        .as_ref()
        .and_then(|r| r.first())
        .cloned()
        .unwrap_or_default();

    let mut recipients: Vec<Value> = message
        .recipients
        .iter()
        .flatten()
        .map(|address| json!({ "address": { "email": address } }))
        .collect();
    recipients.extend(
        cc.iter()
            .chain(message.bcc.iter().flatten())
            .map(|address| json!({ "address": { "email": address, "header_to": header_to } })),
    );

    let mut headers = message.headers.clone();
    if !cc.is_empty() {
        headers.insert("CC".into(), cc.join(", "));
    }

    let content = match &message.template_id {
        Some(template_id) => json!({ "template_id": template_id }),
        None => {
            let mut content = json!({
                "subject": message.subject.clone().unwrap_or_default(),
                "headers": headers,
            });
            if let Some(html) = &message.html {
                content["html"] = json!(html);
            }
            if let Some(text) = &message.text {
                content["text"] = json!(text);
            }
            if let Some(from) = &message.from {
                content["from"] = json!({ "name": from.name, "email": from.email });
            }
            if let Some(reply_to) = &message.reply_to {
                content["reply_to"] = json!(format!("{} <{}>", reply_to.name, reply_to.email));
            }
            content
        }
    };

    json!({
        "recipients": recipients,
        "content": content,
        "substitution_data": message.substitution_data,
    })
}
