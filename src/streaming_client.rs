//! Streaming Client (C7): wraps one upstream streaming call with the
//! full resilience pipeline — circuit breaker gate, attempt loop,
//! retry/backoff, SSE re-framing, and telemetry.
//!
//! `stream()` drives a caller-supplied `StreamObserver` instead of three
//! separate closures: callers that want the OpenAI-callback shape from
//! the source protocol implement the trait once and get `on_chunk` /
//! `on_complete` / `on_error` in the same order the algorithm in the
//! design notes specifies.

use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};

use chrono::Utc;
use futures::StreamExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::catalog::{parse_model_id, Source};
use crate::chat::ChatMessage;
use crate::circuit_breaker::CircuitBreaker;
use crate::config::Config;
use crate::error::GatewayError;
use crate::inspector::{self, Transaction, TransactionInspector};
use crate::retry::{self, RetryConfig};
use crate::settings::SettingsStore;
use crate::sse::{SseFramer, SseSink};
use crate::telemetry::TelemetryLogger;

/// Result of one successful Upstream Call.
#[derive(Debug, Clone)]
pub struct StreamOutcome {
    pub content: String,
    pub ttft_ms: u64,
    pub total_ms: u64,
}

/// Callback sink for one Upstream Call's lifecycle. Exactly one of
/// `on_complete`/`on_error` fires, terminally, per `stream()` invocation.
pub trait StreamObserver: Send {
    fn on_chunk(&mut self, content: &str);
    fn on_complete(&mut self, outcome: StreamOutcome);
    fn on_error(&mut self, error: GatewayError);
}

pub struct StreamRequest {
    pub request_id: String,
    pub model_id: String,
    pub messages: Vec<ChatMessage>,
}

/// Upstream base URLs, resolved once from `Config`, plus a live handle to
/// the runtime-editable credential store. Mirrors the scanner's
/// source-routing table (`catalog::Scanner`) so the two components agree
/// on where each source lives. Credentials are read fresh on every
/// attempt rather than captured at construction, so a `PUT
/// /api/settings` update takes effect on the next call without a restart.
#[derive(Clone)]
struct ProviderRouting {
    ollama_base_url: String,
    opencode_zen_base_url: String,
    openrouter_base_url: String,
    settings: Arc<SettingsStore>,
}

impl ProviderRouting {
    fn new(config: &Config, settings: Arc<SettingsStore>) -> Self {
        Self {
            ollama_base_url: config.ollama_base_url.clone(),
            opencode_zen_base_url: config.opencode_zen_base_url.clone(),
            openrouter_base_url: config.openrouter_base_url.clone(),
            settings,
        }
    }

    fn endpoint(&self, source: Source) -> String {
        match source {
            Source::Ollama => format!("{}/v1/chat/completions", self.ollama_base_url),
            Source::OpenCodeZen => format!("{}/v1/chat/completions", self.opencode_zen_base_url),
            Source::OpenRouter => format!("{}/api/v1/chat/completions", self.openrouter_base_url),
        }
    }

    fn bearer_token(&self, source: Source) -> Result<Option<String>, GatewayError> {
        match source {
            Source::Ollama => Ok(None),
            Source::OpenCodeZen => self.settings.opencode_zen_api_key().map(Some).ok_or_else(|| {
                GatewayError::ConfigurationError {
                    message: "OPENCODE_ZEN_API_KEY is not configured".to_string(),
                }
            }),
            Source::OpenRouter => self.settings.openrouter_api_key().map(Some).ok_or_else(|| {
                GatewayError::ConfigurationError {
                    message: "OPENROUTER_API_KEY is not configured".to_string(),
                }
            }),
        }
    }
}

pub struct StreamingClient {
    http: reqwest::Client,
    routing: ProviderRouting,
    circuit: Arc<CircuitBreaker>,
    retry_config: RetryConfig,
    telemetry: Arc<TelemetryLogger>,
    total_timeout: StdDuration,
    idle_timeout: StdDuration,
    inspector: Arc<TransactionInspector>,
    inspector_enabled: bool,
}

impl StreamingClient {
    pub fn new(
        http: reqwest::Client,
        config: &Config,
        settings: Arc<SettingsStore>,
        circuit: Arc<CircuitBreaker>,
        telemetry: Arc<TelemetryLogger>,
        inspector: Arc<TransactionInspector>,
    ) -> Self {
        Self {
            http,
            routing: ProviderRouting::new(config, settings),
            circuit,
            retry_config: RetryConfig {
                max_attempts: config.retry_max_attempts,
                base_delay_ms: config.retry_base_delay_ms,
                max_delay_ms: config.retry_max_delay_ms,
            },
            telemetry,
            total_timeout: StdDuration::from_millis(config.streaming_total_timeout_ms),
            idle_timeout: StdDuration::from_millis(config.streaming_idle_timeout_ms),
            inspector,
            inspector_enabled: config.inspector_enabled,
        }
    }

    /// Drive one Client Call's worth of attempts for a single model to
    /// completion. Returns once the call is terminal (success, error, or
    /// abort); never panics on a malformed upstream response.
    pub async fn stream(
        &self,
        request: StreamRequest,
        observer: &mut dyn StreamObserver,
        cancellation: CancellationToken,
    ) {
        let Some((source, upstream_model)) = parse_model_id(&request.model_id) else {
            observer.on_error(GatewayError::ConfigurationError {
                message: format!("unrecognized model id '{}'", request.model_id),
            });
            return;
        };

        let circuit_open = match self.circuit.is_open(&request.model_id) {
            Ok(open) => open,
            Err(err) => {
                let err = GatewayError::InternalError { message: err.to_string() };
                self.telemetry
                    .streaming_error(&request.model_id, 0, err.to_telemetry_json());
                observer.on_error(err);
                return;
            }
        };
        if circuit_open {
            let reset_at = self
                .circuit
                .reset_time(&request.model_id)
                .ok()
                .flatten()
                .unwrap_or_else(Utc::now);
            let err = GatewayError::CircuitOpenError {
                model: request.model_id.clone(),
                reset_at,
            };
            self.telemetry
                .streaming_error(&request.model_id, 0, err.to_telemetry_json());
            observer.on_error(err);
            return;
        }

        let mut attempt_number = 1u32;
        loop {
            if cancellation.is_cancelled() {
                observer.on_error(GatewayError::AbortError { model: Some(request.model_id.clone()) });
                return;
            }

            let attempt_started_wall = Utc::now();
            let result = match tokio::time::timeout(
                self.total_timeout,
                self.attempt(&request, source, upstream_model, observer, &cancellation),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(GatewayError::NetworkError {
                    message: format!("upstream call exceeded total timeout of {:?}", self.total_timeout),
                    model: Some(request.model_id.clone()),
                }),
            };

            if self.inspector_enabled {
                self.record_transaction(source, attempt_started_wall, &result);
            }

            match result {
                Ok(outcome) => {
                    self.circuit.record_success(&request.model_id);
                    self.telemetry.streaming_success(
                        &request.model_id,
                        attempt_number,
                        outcome.ttft_ms,
                        outcome.total_ms,
                    );
                    observer.on_complete(outcome);
                    return;
                }
                Err(GatewayError::AbortError { model }) => {
                    // Cancellation short-circuits the Failure path entirely: no
                    // telemetry, no circuit update, per the design notes.
                    observer.on_error(GatewayError::AbortError { model });
                    return;
                }
                Err(err) => {
                    self.telemetry
                        .streaming_error(&request.model_id, attempt_number, err.to_telemetry_json());
                    if err.counts_toward_circuit() {
                        if let Err(lock_err) = self.circuit.record_failure(&request.model_id) {
                            tracing::warn!(error = %lock_err, "failed to record circuit breaker failure");
                        }
                    }

                    if retry::should_retry(&err, attempt_number, &self.retry_config) {
                        let delay = retry::delay_ms(attempt_number, &self.retry_config, retry::random_jitter());
                        tokio::select! {
                            _ = cancellation.cancelled() => {
                                observer.on_error(GatewayError::AbortError { model: Some(request.model_id.clone()) });
                                return;
                            }
                            _ = tokio::time::sleep(StdDuration::from_millis(delay)) => {}
                        }
                        attempt_number += 1;
                        continue;
                    }

                    observer.on_error(err);
                    return;
                }
            }
        }
    }

    /// Capture one attempt as a Transaction Inspector entry. Called only
    /// when inspection is enabled, keeping the disabled-path overhead to
    /// the single boolean check the design notes call for.
    fn record_transaction(
        &self,
        source: Source,
        started_at: chrono::DateTime<Utc>,
        result: &Result<StreamOutcome, GatewayError>,
    ) {
        let request_headers = inspector::redact_headers(&[
            ("content-type".to_string(), "application/json".to_string()),
            ("authorization".to_string(), "Bearer <redacted>".to_string()),
        ]);

        let (status, body_snippet, ttfb_ms) = match result {
            Ok(outcome) => (200u16, outcome.content.clone(), Some(outcome.ttft_ms)),
            Err(GatewayError::UpstreamError { status, message, .. }) => (*status, message.clone(), None),
            Err(GatewayError::RateLimitError { message, .. }) => (429, message.clone(), None),
            Err(err) => (0, err.message(), None),
        };

        self.inspector.record(Transaction {
            started_at,
            ended_at: Utc::now(),
            ttfb_ms,
            request_method: "POST".to_string(),
            request_url: self.routing.endpoint(source),
            request_headers,
            response_status: status,
            response_headers: Vec::new(),
            response_body_snippet: inspector::snippet(&body_snippet),
            token_counts: None,
        });
    }

    async fn attempt(
        &self,
        request: &StreamRequest,
        source: Source,
        upstream_model: &str,
        observer: &mut dyn StreamObserver,
        cancellation: &CancellationToken,
    ) -> Result<StreamOutcome, GatewayError> {
        let started_at = Instant::now();
        let model_id = request.model_id.clone();

        let token = self.routing.bearer_token(source)?;
        let body = serde_json::json!({
            "model": upstream_model,
            "messages": request.messages,
            "stream": true,
        });

        let mut builder = self.http.post(self.routing.endpoint(source)).json(&body);
        if let Some(token) = token {
            builder = builder.bearer_auth(token);
        }

        let response = tokio::select! {
            _ = cancellation.cancelled() => {
                return Err(GatewayError::AbortError { model: Some(model_id) });
            }
            result = builder.send() => result,
        };

        let response = response.map_err(|err| GatewayError::NetworkError {
            message: err.to_string(),
            model: Some(model_id.clone()),
        })?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok());
            let body_text = tokio::select! {
                _ = cancellation.cancelled() => {
                    return Err(GatewayError::AbortError { model: Some(model_id) });
                }
                result = response.text() => result.unwrap_or_default(),
            };
            let (parsed_message, retryable_override) = extract_error_details(&body_text);
            let message = parsed_message.unwrap_or_else(|| format!("upstream returned {status}"));

            if status.as_u16() == 429 {
                return Err(GatewayError::RateLimitError {
                    message,
                    model: model_id,
                    retry_after,
                    retryable_override,
                });
            }
            return Err(GatewayError::UpstreamError {
                status: status.as_u16(),
                message,
                model: model_id,
                retryable_override,
            });
        }

        let mut framer = SseFramer::new();
        let mut byte_stream = response.bytes_stream();
        let mut content = String::new();
        let mut ttft_ms: Option<u64> = None;

        loop {
            tokio::select! {
                _ = cancellation.cancelled() => {
                    return Err(GatewayError::AbortError { model: Some(model_id) });
                }
                timed_out = tokio::time::timeout(self.idle_timeout, byte_stream.next()) => {
                    let Ok(next) = timed_out else {
                        return Err(GatewayError::NetworkError {
                            message: format!("no chunk received within idle timeout of {:?}", self.idle_timeout),
                            model: Some(model_id),
                        });
                    };
                    match next {
                        Some(Ok(bytes)) => {
                            let mut sink = CollectingSink::default();
                            framer.feed(&bytes, &mut sink);
                            if let Some(outcome) = self.drain_events(
                                sink.events, observer, &mut content, &mut ttft_ms, started_at, &model_id, status.as_u16(),
                            )? {
                                return Ok(outcome);
                            }
                        }
                        Some(Err(err)) => {
                            return Err(GatewayError::NetworkError { message: err.to_string(), model: Some(model_id) });
                        }
                        None => {
                            // Stream closed without `[DONE]`: flush any trailing
                            // buffered line, then complete with what was accumulated.
                            let mut sink = CollectingSink::default();
                            framer.finish(&mut sink);
                            if let Some(outcome) = self.drain_events(
                                sink.events, observer, &mut content, &mut ttft_ms, started_at, &model_id, status.as_u16(),
                            )? {
                                return Ok(outcome);
                            }
                            let total_ms = started_at.elapsed().as_millis() as u64;
                            return Ok(StreamOutcome { content, ttft_ms: ttft_ms.unwrap_or(total_ms), total_ms });
                        }
                    }
                }
            }
        }
    }

    /// Forward parsed SSE events to the observer, tracking TTFT and
    /// accumulated content. Returns `Ok(Some(outcome))` once `on_done` is
    /// observed, `Ok(None)` to keep reading, or `Err` on an upstream error
    /// event.
    #[allow(clippy::too_many_arguments)]
    fn drain_events(
        &self,
        events: Vec<SseEvent>,
        observer: &mut dyn StreamObserver,
        content: &mut String,
        ttft_ms: &mut Option<u64>,
        started_at: Instant,
        model_id: &str,
        status: u16,
    ) -> Result<Option<StreamOutcome>, GatewayError> {
        for event in events {
            match event {
                SseEvent::Chunk(chunk) => {
                    if ttft_ms.is_none() {
                        *ttft_ms = Some(started_at.elapsed().as_millis() as u64);
                    }
                    observer.on_chunk(&chunk);
                    content.push_str(&chunk);
                }
                SseEvent::Done => {
                    let total_ms = started_at.elapsed().as_millis() as u64;
                    return Ok(Some(StreamOutcome {
                        content: content.clone(),
                        ttft_ms: ttft_ms.unwrap_or(total_ms),
                        total_ms,
                    }));
                }
                SseEvent::Error(message) => {
                    return Err(GatewayError::UpstreamError {
                        status,
                        message,
                        model: model_id.to_string(),
                        retryable_override: None,
                    });
                }
            }
        }
        Ok(None)
    }
}

enum SseEvent {
    Chunk(String),
    Done,
    Error(String),
}

#[derive(Default)]
struct CollectingSink {
    events: Vec<SseEvent>,
}

impl SseSink for CollectingSink {
    fn on_chunk(&mut self, content: &str) {
        self.events.push(SseEvent::Chunk(content.to_string()));
    }
    fn on_done(&mut self) {
        self.events.push(SseEvent::Done);
    }
    fn on_error(&mut self, message: &str) {
        self.events.push(SseEvent::Error(message.to_string()));
    }
}

/// Parse an upstream error body's `error.message` and, when present, an
/// explicit `error.retryable` override to honor ahead of the per-variant
/// default (see `GatewayError::retryable`).
fn extract_error_details(body: &str) -> (Option<String>, Option<bool>) {
    let Ok(value) = serde_json::from_str::<Value>(body) else {
        return (None, None);
    };
    let Some(error) = value.get("error") else {
        return (None, None);
    };
    let message = error.get("message").and_then(Value::as_str).map(str::to_string);
    let retryable = error.get("retryable").and_then(Value::as_bool);
    (message, retryable)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_error_details_reads_nested_message() {
        let body = r#"{"error":{"message":"bad thing"}}"#;
        assert_eq!(extract_error_details(body), (Some("bad thing".to_string()), None));
    }

    #[test]
    fn extract_error_details_is_none_for_malformed_or_absent() {
        assert_eq!(extract_error_details("not json"), (None, None));
        assert_eq!(extract_error_details(r#"{"ok":true}"#), (None, None));
    }

    #[test]
    fn extract_error_details_reads_explicit_retryable_override() {
        let body = r#"{"error":{"message":"quota exhausted","retryable":false}}"#;
        assert_eq!(extract_error_details(body), (Some("quota exhausted".to_string()), Some(false)));
    }

    #[tokio::test]
    async fn provider_routing_requires_credential_for_paid_sources_but_not_ollama() {
        let mut config = Config::load_for_test();
        config.openrouter_api_key = Some("key".to_string());
        config.opencode_zen_api_key = None;
        let settings = Arc::new(SettingsStore::load(&config).await);
        let routing = ProviderRouting::new(&config, settings);

        assert!(routing.bearer_token(Source::Ollama).unwrap().is_none());
        assert!(routing.bearer_token(Source::OpenCodeZen).is_err());
        assert_eq!(routing.bearer_token(Source::OpenRouter).unwrap(), Some("key".to_string()));
    }

    async fn client_with_inspector() -> (StreamingClient, Arc<TransactionInspector>) {
        let config = Config::load_for_test();
        let settings = Arc::new(SettingsStore::load(&config).await);
        let circuit = Arc::new(CircuitBreaker::new(config.circuit_failure_threshold, config.circuit_reset_ms));
        let telemetry = Arc::new(TelemetryLogger::new(crate::telemetry::TelemetrySink::Null, 10));
        let inspector = Arc::new(TransactionInspector::new(10));
        let client = StreamingClient::new(
            reqwest::Client::new(),
            &config,
            settings,
            circuit,
            telemetry,
            Arc::clone(&inspector),
        );
        (client, inspector)
    }

    #[tokio::test]
    async fn record_transaction_captures_success_and_redacts_auth_header() {
        let (client, inspector) = client_with_inspector().await;
        let outcome = StreamOutcome { content: "hi there".to_string(), ttft_ms: 5, total_ms: 12 };
        client.record_transaction(Source::Ollama, Utc::now(), &Ok(outcome));

        assert_eq!(inspector.len(), 1);
        let har = inspector.to_har();
        let entry = &har["log"]["entries"][0];
        assert_eq!(entry["response"]["status"], 200);
        assert_eq!(entry["response"]["content"]["text"], "hi there");
        let auth_header = entry["request"]["headers"]
            .as_array()
            .unwrap()
            .iter()
            .find(|h| h["name"] == "authorization")
            .unwrap();
        assert_eq!(auth_header["value"], "[redacted]");
    }

    #[tokio::test]
    async fn record_transaction_captures_upstream_error_status() {
        let (client, inspector) = client_with_inspector().await;
        let err = GatewayError::UpstreamError {
            status: 503,
            message: "boom".to_string(),
            model: "m".to_string(),
            retryable_override: None,
        };
        client.record_transaction(Source::OpenRouter, Utc::now(), &Err(err));

        let har = inspector.to_har();
        let entry = &har["log"]["entries"][0];
        assert_eq!(entry["response"]["status"], 503);
        assert_eq!(entry["response"]["content"]["text"], "boom");
    }

    #[tokio::test]
    async fn disabled_inspector_flag_is_honored_by_callers() {
        let config = Config::load_for_test();
        assert!(config.inspector_enabled, "default should be enabled");
    }
}
