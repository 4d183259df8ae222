use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;

use mailfuse::conversation::Outcome;
use mailfuse::transport::{
    MemoryTransport, SmtpConfig, SmtpTransport, SparkPostConfig, SparkPostTransport, Transport,
};
use mailfuse::{Bot, BotConfig, Event, OutboundMessage};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = BotConfig::from_env().context("reading bot configuration")?;
    let transport = transport_from_env()?;
    let port = config.port;

    eprintln!("📬 mailfuse v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Bot: {} <{}>", config.bot_name, config.sending_address);
    eprintln!("   Transport: {}", transport.name());
    eprintln!("   Webhook: {}", config.webhook_target());

    let bot = Bot::new(config, transport)?;
    register_demo(&bot)?;
    bot.setup().await.context("transport setup")?;

    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding port {port}"))?;
    mailfuse::server::serve(bot, listener).await?;
    Ok(())
}

/// `FUSE_TRANSPORT` picks the provider: `sparkpost` (default), `smtp` or `memory`.
fn transport_from_env() -> anyhow::Result<Arc<dyn Transport>> {
    let name = std::env::var("FUSE_TRANSPORT").unwrap_or_else(|_| "sparkpost".to_string());
    let transport: Arc<dyn Transport> = match name.trim().to_lowercase().as_str() {
        "sparkpost" => Arc::new(SparkPostTransport::new(SparkPostConfig::from_env()?)),
        "smtp" => Arc::new(SmtpTransport::new(SmtpConfig::from_env()?)),
        "memory" => Arc::new(MemoryTransport::new()),
        other => anyhow::bail!("unknown FUSE_TRANSPORT {other:?} (expected sparkpost, smtp or memory)"),
    };
    Ok(transport)
}

/// Say hello back and ask for a name.
fn register_demo(bot: &Bot) -> anyhow::Result<()> {
    bot.on(Event::Ready, |_| tracing::info!("Bot ready"));

    bot.hears(
        [r"^\s*(hello|hi|hey)\b"],
        [Event::DirectEmail, Event::CcEmail],
        |e, _| {
            let started = e.responder.start_private_conversation("Introductions", |convo| {
                let asked = convo.ask(
                    OutboundMessage::text("Hi there! What should I call you?"),
                    |convo, reply| {
                        let name = reply.latest_text();
                        let name = name.lines().next().unwrap_or("").trim();
                        if name.is_empty() {
                            return Outcome::Rearm;
                        }
                        if let Err(e) = convo.say(OutboundMessage::text(format!(
                            "Nice to meet you, {name}."
                        ))) {
                            tracing::warn!(error = %e, "Could not answer");
                        }
                        Outcome::Completed
                    },
                );
                if let Err(e) = asked {
                    tracing::warn!(error = %e, "Could not ask for a name");
                }
            });
            if let Err(e) = started {
                tracing::warn!(error = %e, "Could not start conversation");
            }
        },
    )?;

    bot.on(Event::EmailReceived, |e| {
        tracing::debug!(from = %e.message.from, subject = %e.message.subject, "Email received");
    });
    Ok(())
}
