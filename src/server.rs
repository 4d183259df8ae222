//! HTTP surface: the relay webhook and a health check.

use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::dispatch::Bot;

/// Webhook route at the configured endpoint path, plus `/health`.
pub fn routes(bot: Bot) -> Router {
    let endpoint = bot.config().endpoint_path.clone();
    Router::new()
        .route(&endpoint, post(relay))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(bot)
}

/// Serve `bot` on `listener` until the server stops.
pub async fn serve(bot: Bot, listener: TcpListener) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, endpoint = %bot.config().endpoint_path, "Webhook server listening");
    }
    axum::serve(listener, routes(bot)).await
}

async fn health(State(bot): State<Bot>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "bot": bot.config().bot_name,
        "transport": bot.transport().name(),
    }))
}

/// Acknowledge at once and process in the background, so slow handlers never
/// make the relay retry.
async fn relay(State(bot): State<Bot>, headers: HeaderMap, body: Bytes) -> impl IntoResponse {
    if !bot.transport().validate(&headers, bot.config()) {
        warn!("Rejected webhook call with a bad token");
        return StatusCode::UNAUTHORIZED;
    }

    debug!(bytes = body.len(), "Webhook call accepted");
    tokio::spawn(async move {
        if let Err(e) = bot.receive(&body) {
            error!(error = %e, "Failed to parse webhook body");
        }
    });
    StatusCode::OK
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::config::{BotConfig, WEBHOOK_TOKEN_HEADER};
    use crate::transport::MemoryTransport;

    fn app(config: BotConfig) -> Router {
        let bot = Bot::new(config, Arc::new(MemoryTransport::new())).unwrap();
        routes(bot)
    }

    #[tokio::test]
    async fn health_reports_transport() {
        let response = app(BotConfig::new("bot@x.com"))
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn webhook_checks_token() {
        let config = BotConfig::new("bot@x.com").with_auth_token("s3cret");

        let rejected = app(config.clone())
            .oneshot(Request::post("/relay").body(Body::from("[]")).unwrap())
            .await
            .unwrap();
        assert_eq!(rejected.status(), StatusCode::UNAUTHORIZED);

        let accepted = app(config)
            .oneshot(
                Request::post("/relay")
                    .header(WEBHOOK_TOKEN_HEADER, "s3cret")
                    .body(Body::from("[]"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(accepted.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn webhook_acks_unparsable_bodies() {
        let response = app(BotConfig::new("bot@x.com"))
            .oneshot(Request::post("/relay").body(Body::from("garbage")).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn custom_endpoint_path() {
        let mut config = BotConfig::new("bot@x.com");
        config.endpoint_path = "/inbound".into();
        let router = app(config);

        let response = router
            .clone()
            .oneshot(Request::post("/inbound").body(Body::from("[]")).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = router
            .oneshot(Request::post("/relay").body(Body::from("[]")).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
