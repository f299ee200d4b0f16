//! POST /v1/chat/completions — the fanout chat-completion endpoint.
//!
//! Streaming and non-streaming requests both go through the Fanout
//! Router; this layer only translates between the OpenAI-ish wire shape
//! and the router's per-model aggregation records, and ties a
//! `CancellationToken` to the lifetime of the HTTP request so a client
//! disconnect promptly aborts every child Streaming Client.

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::chat::{ChatCompletionRequest, ChatCompletionResponse};
use crate::error::GatewayError;
use crate::fanout::{self, StreamEvent};
use crate::sse as egress;
use crate::AppState;

/// Cancels its token when dropped — ties a Client Call's cancellation to
/// the lifetime of the axum handler future, so an aborted/disconnected
/// request (the future gets dropped) reaches every spawned child.
struct CancelOnDrop(CancellationToken);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ChatCompletionRequest>,
) -> Result<Response, GatewayError> {
    request.validate()?;

    let selection = request.model_selection();
    let max_models = fanout::max_models(&state.config);
    let validated =
        fanout::validate_selection(&state.scanner, &state.settings, &selection, max_models).await?;

    if request.stream {
        Ok(stream_response(state, validated, request))
    } else {
        non_streaming_response(state, validated, request).await
    }
}

async fn non_streaming_response(
    state: Arc<AppState>,
    selection: Vec<String>,
    request: ChatCompletionRequest,
) -> Result<Response, GatewayError> {
    let cancellation = CancellationToken::new();
    let _guard = CancelOnDrop(cancellation.clone());

    let records = fanout::dispatch_aggregated(
        Arc::clone(&state.streaming_client),
        &state.spending,
        selection,
        request.messages,
        cancellation.clone(),
    )
    .await?;

    if records.len() == 1 {
        let record = &records[0];
        return match &record.content {
            Some(content) => Ok(Json(ChatCompletionResponse::single(record.model.clone(), content.clone()))
                .into_response()),
            None => Err(GatewayError::UpstreamError {
                status: 502,
                message: record.error.clone().unwrap_or_else(|| "no content returned".to_string()),
                model: record.model.clone(),
                retryable_override: None,
            }),
        };
    }

    Ok(Json(json!({ "object": "chat.completion.multi", "models": records })).into_response())
}

/// Builds the raw `text/event-stream` response body directly from C1's
/// egress encoders (`sse::encode_chunk`/`encode_done`/`encode_error`),
/// which already produce the exact `data: ...\n\n` wire bytes. Using
/// `axum::response::sse::Event` here instead would re-wrap those bytes in
/// its own `data: ` framing and double-encode them, so the response is
/// built directly over a streamed `Body` instead.
fn stream_response(state: Arc<AppState>, selection: Vec<String>, request: ChatCompletionRequest) -> Response {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<String>();
    let cancellation = CancellationToken::new();

    if selection.len() == 1 {
        spawn_single_model_stream(state, selection.into_iter().next().unwrap(), request, cancellation, tx);
    } else {
        spawn_multiplexed_stream(state, selection, request, cancellation, tx);
    }

    let body = Body::from_stream(UnboundedReceiverStream::new(rx).map(Ok::<String, Infallible>));

    Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(body)
        .expect("static SSE response headers are always valid")
}

/// Single-model streaming pipes chunks through 1:1, matching C1's egress
/// framing exactly (no extra envelope), per the router's "single-model
/// pass-through" mode.
fn spawn_single_model_stream(
    state: Arc<AppState>,
    model_id: String,
    request: ChatCompletionRequest,
    cancellation: CancellationToken,
    tx: tokio::sync::mpsc::UnboundedSender<String>,
) {
    tokio::spawn(async move {
        let (forward_tx, mut forward_rx) = tokio::sync::mpsc::unbounded_channel();
        let child_cancellation = cancellation.clone();

        let dispatch = tokio::spawn(fanout::dispatch_streaming(
            Arc::clone(&state.streaming_client),
            Arc::clone(&state.spending),
            model_id,
            request.messages,
            child_cancellation,
            forward_tx,
        ));

        while let Some(event) = forward_rx.recv().await {
            let wire = match event {
                StreamEvent::Chunk(content) => egress::encode_chunk(&content),
                StreamEvent::Error(err) => egress::encode_error(&err.message()),
                StreamEvent::Complete(_) => egress::encode_done().to_string(),
                StreamEvent::Finished => break,
            };
            if tx.send(wire).is_err() {
                // Receiver gone: client disconnected. Cancel the upstream call.
                cancellation.cancel();
                break;
            }
        }

        let _ = dispatch.await;
    });
}

/// N>1 streaming tags every event with its originating model, since raw
/// content chunks from different models can't be told apart on a single
/// unmultiplexed wire — the UI-layer alternative the design notes call
/// out, implemented here as a model-tagged event rather than a second
/// transport.
fn spawn_multiplexed_stream(
    state: Arc<AppState>,
    selection: Vec<String>,
    request: ChatCompletionRequest,
    cancellation: CancellationToken,
    tx: tokio::sync::mpsc::UnboundedSender<String>,
) {
    tokio::spawn(async move {
        match fanout::dispatch_aggregated(
            Arc::clone(&state.streaming_client),
            &state.spending,
            selection,
            request.messages,
            cancellation,
        )
        .await
        {
            Ok(records) => {
                for record in &records {
                    let payload = json!({
                        "model": record.model,
                        "content": record.content,
                        "error": record.error,
                    });
                    let _ = tx.send(format!("data: {payload}\n\n"));
                }
                let _ = tx.send(egress::encode_done().to_string());
            }
            Err(err) => {
                let _ = tx.send(egress::encode_error(&err.message()));
            }
        }
    });
}
