//! freegate — a local OpenAI-compatible gateway that aggregates free-tier
//! LLM models across Ollama, OpenCode Zen, and OpenRouter, fans chat
//! completions out across them, and enforces resilience and spending
//! policies in front of every call.
//!
//! This binary owns process bootstrap only: tracing/config/state wiring
//! and the route table. Each concern (catalog, streaming, fanout,
//! spending, inspection) lives in its own module and is exercised by
//! that module's own tests.

mod catalog;
mod chat;
mod circuit_breaker;
mod config;
mod error;
mod fanout;
mod inspector;
mod retry;
mod routes;
mod settings;
mod spending;
mod sse;
mod streaming_client;
mod telemetry;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::catalog::Scanner;
use crate::circuit_breaker::CircuitBreaker;
use crate::config::Config;
use crate::inspector::TransactionInspector;
use crate::settings::SettingsStore;
use crate::spending::SpendingLedger;
use crate::streaming_client::StreamingClient;
use crate::telemetry::{TelemetryLogger, TelemetrySink};

/// Shared application state handed to every route handler.
pub struct AppState {
    pub config: Arc<Config>,
    pub scanner: Arc<Scanner>,
    pub settings: Arc<SettingsStore>,
    pub spending: Arc<SpendingLedger>,
    pub inspector: Arc<TransactionInspector>,
    pub streaming_client: Arc<StreamingClient>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "freegate=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Arc::new(Config::load()?);

    tracing::info!(
        port = config.port,
        openrouter = config.has_openrouter(),
        opencode_zen = config.has_opencode_zen(),
        "starting freegate",
    );

    let http_client = reqwest::Client::builder().timeout(Duration::from_secs(300)).build()?;

    let scanner = Arc::new(Scanner::new(&config));
    let settings = Arc::new(SettingsStore::load(&config).await);
    let circuit = Arc::new(CircuitBreaker::new(config.circuit_failure_threshold, config.circuit_reset_ms));

    let telemetry_sink = match &config.telemetry_endpoint {
        Some(endpoint) => TelemetrySink::Http { client: http_client.clone(), endpoint: endpoint.clone() },
        None => TelemetrySink::Null,
    };
    let telemetry = Arc::new(TelemetryLogger::new(telemetry_sink, config.telemetry_batch_size));

    let spending = Arc::new(SpendingLedger::load(&config, Arc::clone(&telemetry)).await);
    let inspector = Arc::new(TransactionInspector::new(config.inspector_max_transactions));

    let streaming_client = Arc::new(StreamingClient::new(
        http_client,
        &config,
        Arc::clone(&settings),
        Arc::clone(&circuit),
        Arc::clone(&telemetry),
        Arc::clone(&inspector),
    ));

    let flush_interval = Duration::from_millis(config.telemetry_flush_interval_ms);
    let telemetry_flusher = Arc::clone(&telemetry);
    tokio::spawn(async move {
        telemetry_flusher.run_periodic_flush(flush_interval).await;
    });

    let refresh_interval = Duration::from_secs(config.scanner_ttl_seconds);
    let scanner_refresher = Arc::clone(&scanner);
    tokio::spawn(async move {
        scanner_refresher.run_periodic_refresh(refresh_interval).await;
    });

    let state = Arc::new(AppState {
        config: Arc::clone(&config),
        scanner,
        settings,
        spending,
        inspector,
        streaming_client,
    });

    let app = Router::new()
        .route("/health", get(routes::health::health_check))
        .route("/v1/models", get(routes::models::list_models))
        .route("/v1/models/grouped", get(routes::models::list_models_grouped))
        .route("/v1/chat/completions", post(routes::chat::chat_completions))
        .route("/v1/inspect", get(routes::inspect::export_har).delete(routes::inspect::clear))
        .route("/api/settings", get(routes::settings::get_settings).put(routes::settings::put_settings))
        .route(
            "/api/settings/spending",
            get(routes::settings::get_spending).post(routes::settings::post_spending),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .with_state(state.clone());

    let addr = format!("0.0.0.0:{}", state.config.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "freegate listening");

    axum::serve(listener, app).await?;

    Ok(())
}
