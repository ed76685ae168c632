//! larkgate daemon: Feishu webhook ingress wired to the task coordinator.

use larkgate::agent::{AgentDispatcher, AgentEnvelope, DispatchOutcome, SignalSender};
use larkgate::config::Config;
use larkgate::coordinator::{Coordinator, RECONCILE_MAX_AGE_MS};
use larkgate::error::{GatewayError, Result};
use larkgate::provider::feishu::{self, FeishuClient};

use anyhow::Context as _;
use async_trait::async_trait;
use axum::{Json, Router, extract::State, routing::post};
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Dispatches agent jobs to an external agent runtime over HTTP.
///
/// The runtime receives the rendered envelope and replies with the dispatch
/// outcome once it goes idle: `{"queued_final": bool, "final_count": int}`.
struct HttpAgentDispatcher {
    http: reqwest::Client,
    endpoint: String,
}

#[async_trait]
impl AgentDispatcher for HttpAgentDispatcher {
    async fn dispatch(
        &self,
        envelope: AgentEnvelope,
        _signals: SignalSender,
    ) -> Result<DispatchOutcome> {
        let prompt = envelope.render();
        let body = serde_json::json!({
            "envelope": envelope,
            "prompt": prompt,
        });
        let response = self
            .http
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|error| GatewayError::Dispatch(format!("transport: {error}")))?;
        if !response.status().is_success() {
            return Err(GatewayError::Dispatch(format!(
                "agent runtime returned {}",
                response.status()
            )));
        }
        response
            .json()
            .await
            .map_err(|error| GatewayError::Dispatch(format!("bad outcome payload: {error}")))
    }
}

struct AppState {
    coordinator: Arc<Coordinator>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.toml".to_string());
    let config = Config::load_from_path(Path::new(&config_path))?;
    anyhow::ensure!(
        !config.feishu.app_id.is_empty(),
        "feishu.app_id must be configured"
    );
    anyhow::ensure!(
        !config.agent.endpoint.is_empty(),
        "agent.endpoint must be configured"
    );

    let provider = Arc::new(FeishuClient::new(
        config.feishu.base_url.as_str(),
        config.feishu.app_id.as_str(),
        config.feishu.app_secret.as_str(),
    ));
    let dispatcher = Arc::new(HttpAgentDispatcher {
        http: reqwest::Client::new(),
        endpoint: config.agent.endpoint.clone(),
    });
    let coordinator = Arc::new(Coordinator::new(&config, provider, dispatcher));

    // Tasks stranded by the previous shutdown get their interruption marker
    // before new traffic flows.
    match coordinator.reconcile(RECONCILE_MAX_AGE_MS).await {
        Ok(0) => {}
        Ok(count) => tracing::info!(count, "reconciled interrupted tasks"),
        Err(error) => tracing::warn!(%error, "boot reconciliation failed"),
    }

    let state = Arc::new(AppState {
        coordinator: coordinator.clone(),
    });
    let app = Router::new()
        .route("/webhook", post(webhook))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    tracing::info!(
        addr = %config.listen_addr,
        account = coordinator.account_id(),
        "larkgate listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await
        .context("server error")?;
    Ok(())
}

/// Feishu webhook endpoint: answers URL-verification challenges and hands
/// message events to the coordinator. Feishu requires a response within 3
/// seconds, so event handling happens in a background task.
async fn webhook(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<feishu::EventPayload>,
) -> Json<serde_json::Value> {
    if payload.type_.as_deref() == Some("url_verification")
        && let Some(challenge) = payload.challenge
    {
        return Json(serde_json::json!({ "challenge": challenge }));
    }

    if let Some(event) = feishu::parse_message_event(&payload) {
        let coordinator = state.coordinator.clone();
        tokio::spawn(async move {
            coordinator.handle_event(event).await;
        });
    }

    Json(serde_json::json!({}))
}
