//! Fanout Router (C8): turns one client call into N parallel Streaming
//! Client invocations and merges their results.
//!
//! Two consumption modes mirror the two ways a caller can observe a
//! Client Call: a single-model request can be piped straight through as
//! one SSE stream (`dispatch_streaming`), while any request — single or
//! multi-model — can be resolved as a per-model aggregation record once
//! every child is terminal (`dispatch_aggregated`), which is what backs
//! the non-streaming JSON response and multi-model streaming alike.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::catalog::{parse_model_id, Scanner, Source};
use crate::chat::ChatMessage;
use crate::config::Config;
use crate::error::GatewayError;
use crate::settings::SettingsStore;
use crate::spending::SpendingLedger;
use crate::streaming_client::{StreamObserver, StreamOutcome, StreamRequest, StreamingClient};

/// Per-model outcome of one Client Call, as exposed to the HTTP layer.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ModelRecord {
    pub model: String,
    pub loading: bool,
    pub content: Option<String>,
    pub error: Option<String>,
    pub ttft_ms: Option<u64>,
    pub total_ms: Option<u64>,
}

/// Whether `source`'s credential precondition is satisfied. `ollama` is
/// always local and needs none; the two paid-tier sources require an
/// API key on file.
fn source_is_configured(source: Source, settings: &SettingsStore) -> bool {
    match source {
        Source::Ollama => true,
        Source::OpenCodeZen => settings.opencode_zen_api_key().is_some(),
        Source::OpenRouter => settings.openrouter_api_key().is_some(),
    }
}

/// Validate the requested model selection against the catalog and
/// provider configuration before any Streaming Client is spawned.
///
/// Enforces every Client Call precondition that doesn't depend on the
/// spending ledger: a valid, de-duplicated, in-catalog selection, and a
/// configured credential for each selected model's source (unless
/// `ollama`). Spending is checked separately, immediately before dispatch.
///
/// Returns the validated, de-duplicated selection (order preserved).
pub async fn validate_selection(
    scanner: &Scanner,
    settings: &SettingsStore,
    selection: &[String],
    max_models: usize,
) -> Result<Vec<String>, GatewayError> {
    if selection.is_empty() {
        return Err(GatewayError::ConfigurationError {
            message: "model selection must not be empty".to_string(),
        });
    }
    if selection.len() > max_models {
        return Err(GatewayError::ConfigurationError {
            message: format!("at most {max_models} models may be selected per request"),
        });
    }

    let mut seen = HashSet::new();
    for model_id in selection {
        if !seen.insert(model_id.clone()) {
            return Err(GatewayError::ConfigurationError {
                message: format!("duplicate model '{model_id}' in selection"),
            });
        }

        let exists = scanner
            .contains(model_id)
            .await
            .map_err(|e| GatewayError::InternalError { message: e.to_string() })?;
        if !exists {
            return Err(GatewayError::ConfigurationError {
                message: format!("model '{model_id}' is not in the free-model catalog"),
            });
        }

        let Some((source, _)) = parse_model_id(model_id) else {
            return Err(GatewayError::ConfigurationError {
                message: format!("unrecognized model id '{model_id}'"),
            });
        };
        if !source_is_configured(source, settings) {
            return Err(GatewayError::ConfigurationError {
                message: format!("model '{model_id}' requires credentials that are not configured"),
            });
        }
    }

    Ok(selection.to_vec())
}

/// Estimated USD cost of one model invocation for pre-flight spending
/// checks. Free-tier models have no metered cost; the estimator is a
/// pluggable input per the design notes' open question, so this gateway
/// simply returns zero and leaves headroom for a real pricing model to
/// be substituted without touching the ledger or router.
pub fn estimate_cost_per_model(_model_id: &str) -> f64 {
    0.0
}

/// Dispatch `selection` as N concurrent Streaming Client invocations and
/// resolve once every child is terminal. Succeeds (returns `Ok`) as long
/// as at least one child completes; only fails the whole call when every
/// child failed, surfacing the first error encountered.
pub async fn dispatch_aggregated(
    client: Arc<StreamingClient>,
    ledger: &SpendingLedger,
    selection: Vec<String>,
    messages: Vec<ChatMessage>,
    cancellation: CancellationToken,
) -> Result<Vec<ModelRecord>, GatewayError> {
    let estimated_total: f64 = selection.iter().map(|m| estimate_cost_per_model(m)).sum();
    ledger.check(estimated_total)?;

    let mut handles = Vec::with_capacity(selection.len());
    for model_id in selection {
        let client = Arc::clone(&client);
        let messages = messages.clone();
        let token = cancellation.child_token();
        let request_id = uuid::Uuid::new_v4().to_string();

        handles.push(tokio::spawn(async move {
            let mut recorder = RecordingObserver::new(model_id.clone());
            client
                .stream(
                    StreamRequest { request_id, model_id: model_id.clone(), messages },
                    &mut recorder,
                    token,
                )
                .await;
            recorder.into_record()
        }));
    }

    let mut records = Vec::with_capacity(handles.len());
    for handle in handles {
        match handle.await {
            Ok(record) => records.push(record),
            Err(join_err) => {
                tracing::warn!(error = %join_err, "streaming client task panicked");
            }
        }
    }

    let any_succeeded = records.iter().any(|r| r.error.is_none());
    if !any_succeeded {
        let first_error = records
            .iter()
            .find_map(|r| r.error.clone())
            .unwrap_or_else(|| "all models failed".to_string());
        return Err(GatewayError::UpstreamError {
            status: 502,
            message: first_error,
            model: "*".to_string(),
            retryable_override: None,
        });
    }

    let actual_cost: f64 = records
        .iter()
        .filter(|r| r.error.is_none())
        .map(|r| estimate_cost_per_model(&r.model))
        .sum();
    if actual_cost > 0.0 {
        if let Err(err) = ledger.record(actual_cost).await {
            tracing::warn!(error = %err, "failed to record spend after successful completion");
        }
    }

    Ok(records)
}

/// Dispatch exactly one model's stream, forwarding chunks live through
/// `sink` (egress SSE) instead of buffering into a record. Used by the
/// single-model streaming path, where the router degenerates to a
/// pass-through over one Streaming Client.
pub async fn dispatch_streaming(
    client: Arc<StreamingClient>,
    ledger: Arc<SpendingLedger>,
    model_id: String,
    messages: Vec<ChatMessage>,
    cancellation: CancellationToken,
    sink: mpsc::UnboundedSender<StreamEvent>,
) {
    if let Err(err) = ledger.check(estimate_cost_per_model(&model_id)) {
        let _ = sink.send(StreamEvent::Error(err));
        return;
    }

    let request_id = uuid::Uuid::new_v4().to_string();
    let mut observer = ForwardingObserver { sink: sink.clone() };
    client
        .stream(StreamRequest { request_id, model_id: model_id.clone(), messages }, &mut observer, cancellation)
        .await;

    if observer.sink.send(StreamEvent::Finished).is_ok() {
        let cost = estimate_cost_per_model(&model_id);
        if cost > 0.0 {
            if let Err(err) = ledger.record(cost).await {
                tracing::warn!(error = %err, "failed to record spend after successful completion");
            }
        }
    }
}

/// Events surfaced to the HTTP layer for the single-model streaming path.
pub enum StreamEvent {
    Chunk(String),
    Complete(StreamOutcome),
    Error(GatewayError),
    Finished,
}

struct ForwardingObserver {
    sink: mpsc::UnboundedSender<StreamEvent>,
}

impl StreamObserver for ForwardingObserver {
    fn on_chunk(&mut self, content: &str) {
        let _ = self.sink.send(StreamEvent::Chunk(content.to_string()));
    }
    fn on_complete(&mut self, outcome: StreamOutcome) {
        let _ = self.sink.send(StreamEvent::Complete(outcome));
    }
    fn on_error(&mut self, error: GatewayError) {
        let _ = self.sink.send(StreamEvent::Error(error));
    }
}

/// Observer that buffers one model's outcome into a `ModelRecord`
/// instead of forwarding chunks anywhere — the per-model aggregation
/// mode the design calls for. Every `StreamObserver` method already
/// takes `&mut self`, so the record needs no interior mutability of its
/// own; each instance lives entirely inside the one spawned task that
/// owns it.
struct RecordingObserver {
    record: ModelRecord,
}

impl RecordingObserver {
    fn new(model_id: String) -> Self {
        Self { record: ModelRecord { model: model_id, loading: true, ..Default::default() } }
    }

    fn into_record(self) -> ModelRecord {
        self.record
    }
}

impl StreamObserver for RecordingObserver {
    fn on_chunk(&mut self, content: &str) {
        let existing = self.record.content.get_or_insert_with(String::new);
        existing.push_str(content);
    }

    fn on_complete(&mut self, outcome: StreamOutcome) {
        self.record.loading = false;
        self.record.content = Some(outcome.content);
        self.record.ttft_ms = Some(outcome.ttft_ms);
        self.record.total_ms = Some(outcome.total_ms);
    }

    fn on_error(&mut self, error: GatewayError) {
        self.record.loading = false;
        self.record.error = Some(error.message());
    }
}

/// Surface config's fanout cap without every call site reaching into `Config` directly.
pub fn max_models(config: &Config) -> usize {
    config.fanout_max_models
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_observer_accumulates_chunks_then_resolves_on_complete() {
        let mut observer = RecordingObserver::new("m".to_string());
        observer.on_chunk("Hel");
        observer.on_chunk("lo");
        observer.on_complete(StreamOutcome { content: "Hello".to_string(), ttft_ms: 5, total_ms: 10 });
        let record = observer.into_record();
        assert_eq!(record.content, Some("Hello".to_string()));
        assert!(!record.loading);
        assert!(record.error.is_none());
    }

    #[test]
    fn recording_observer_surfaces_error_without_failing_other_models() {
        let mut observer = RecordingObserver::new("m".to_string());
        observer.on_error(GatewayError::NetworkError { message: "boom".to_string(), model: None });
        let record = observer.into_record();
        assert_eq!(record.error, Some("boom".to_string()));
        assert!(!record.loading);
    }

    #[tokio::test]
    async fn validate_selection_rejects_empty_and_oversized_and_duplicates() {
        let config = Config::load_for_test();
        let scanner = Scanner::new(&config);
        let settings = SettingsStore::load(&config).await;

        assert!(validate_selection(&scanner, &settings, &[], 3).await.is_err());
        assert!(validate_selection(
            &scanner,
            &settings,
            &["a".to_string(), "b".to_string(), "c".to_string(), "d".to_string()],
            3
        )
        .await
        .is_err());
        assert!(validate_selection(&scanner, &settings, &["a".to_string(), "a".to_string()], 3)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn source_is_configured_gates_paid_sources_but_not_ollama() {
        let mut config = Config::load_for_test();
        config.openrouter_api_key = Some("key".to_string());
        config.opencode_zen_api_key = None;
        let settings = SettingsStore::load(&config).await;

        assert!(source_is_configured(Source::Ollama, &settings));
        assert!(!source_is_configured(Source::OpenCodeZen, &settings));
        assert!(source_is_configured(Source::OpenRouter, &settings));
    }
}
