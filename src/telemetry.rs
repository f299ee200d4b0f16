//! Fire-and-forget, batched telemetry.
//!
//! `log()` never blocks the caller and never fails visibly: a full
//! network failure on flush is swallowed (logged at `warn` and
//! dropped), matching the "never interrupts user flow" contract this
//! gateway inherits from the proxy it is built from. Unlike that
//! proxy's usage reporter, the sink is swappable (`TelemetrySink`) so
//! tests can observe what would have been sent without a network.

use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio::time::{interval, Duration};

/// Where a flushed batch goes.
#[derive(Clone)]
pub enum TelemetrySink {
    /// No endpoint configured: batches are dropped silently.
    Null,
    /// POST each batch as a JSON array to the configured URL.
    Http { client: reqwest::Client, endpoint: String },
    /// Test sink: flushed batches are pushed onto a channel the test owns.
    Channel(mpsc::UnboundedSender<Vec<Value>>),
}

impl TelemetrySink {
    async fn flush(&self, batch: Vec<Value>) {
        if batch.is_empty() {
            return;
        }
        match self {
            TelemetrySink::Null => {}
            TelemetrySink::Http { client, endpoint } => {
                if let Err(err) = client.post(endpoint).json(&batch).send().await {
                    tracing::warn!(error = %err, "telemetry flush failed, batch dropped");
                }
            }
            TelemetrySink::Channel(tx) => {
                let _ = tx.send(batch);
            }
        }
    }
}

/// Bounded in-memory queue with size- and timer-triggered flush.
pub struct TelemetryLogger {
    queue: Mutex<VecDeque<Value>>,
    batch_size: usize,
    sink: TelemetrySink,
    app_version: &'static str,
    platform: &'static str,
}

impl TelemetryLogger {
    pub fn new(sink: TelemetrySink, batch_size: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            batch_size,
            sink,
            app_version: env!("CARGO_PKG_VERSION"),
            platform: std::env::consts::OS,
        }
    }

    /// Enqueue one event, augmented with `{timestamp, app_version, platform}`.
    /// Non-blocking: triggers an async flush once the queue reaches `batch_size`,
    /// but does not await it.
    pub fn log(&self, mut event: Value) {
        if let Value::Object(ref mut map) = event {
            map.insert("timestamp".into(), Value::from(chrono::Utc::now().to_rfc3339()));
            map.insert("app_version".into(), Value::from(self.app_version));
            map.insert("platform".into(), Value::from(self.platform));
        }

        let batch = {
            let mut queue = self.queue.lock().expect("telemetry queue poisoned");
            queue.push_back(event);
            if queue.len() >= self.batch_size {
                Some(queue.drain(..).collect::<Vec<_>>())
            } else {
                None
            }
        };

        if let Some(batch) = batch {
            let sink = self.sink.clone();
            tokio::spawn(async move {
                sink.flush(batch).await;
            });
        }
    }

    /// Drain and flush whatever is currently queued, regardless of size.
    pub async fn flush_now(&self) {
        let batch = {
            let mut queue = self.queue.lock().expect("telemetry queue poisoned");
            queue.drain(..).collect::<Vec<_>>()
        };
        self.sink.flush(batch).await;
    }

    /// Run forever, flushing on a fixed interval. Intended to be spawned as its
    /// own task alongside the HTTP server.
    pub async fn run_periodic_flush(&self, flush_interval: Duration) {
        let mut tick = interval(flush_interval);
        loop {
            tick.tick().await;
            self.flush_now().await;
        }
    }

    pub fn streaming_success(&self, model: &str, attempt_number: u32, ttft_ms: u64, total_ms: u64) {
        self.log(serde_json::json!({
            "type": "streaming_success",
            "model": model,
            "attempt_number": attempt_number,
            "ttft_ms": ttft_ms,
            "total_ms": total_ms,
        }));
    }

    pub fn streaming_error(&self, model: &str, attempt_number: u32, error_json: Value) {
        self.log(serde_json::json!({
            "type": "streaming_error",
            "model": model,
            "attempt_number": attempt_number,
            "error": error_json,
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn flushes_once_batch_size_is_reached() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let logger = TelemetryLogger::new(TelemetrySink::Channel(tx), 3);

        logger.log(serde_json::json!({"type": "a"}));
        logger.log(serde_json::json!({"type": "b"}));
        assert!(rx.try_recv().is_err(), "should not flush before batch_size");

        logger.log(serde_json::json!({"type": "c"}));
        let batch = rx.recv().await.expect("batch should be flushed");
        assert_eq!(batch.len(), 3);
    }

    #[tokio::test]
    async fn events_are_augmented_with_metadata() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let logger = TelemetryLogger::new(TelemetrySink::Channel(tx), 1);
        logger.log(serde_json::json!({"type": "streaming_success"}));
        let batch = rx.recv().await.unwrap();
        assert!(batch[0].get("timestamp").is_some());
        assert!(batch[0].get("app_version").is_some());
        assert!(batch[0].get("platform").is_some());
    }

    #[tokio::test]
    async fn flush_now_drains_partial_batch() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let logger = TelemetryLogger::new(TelemetrySink::Channel(tx), 100);
        logger.log(serde_json::json!({"type": "a"}));
        logger.flush_now().await;
        let batch = rx.recv().await.unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test]
    async fn null_sink_drops_silently() {
        let logger = TelemetryLogger::new(TelemetrySink::Null, 1);
        logger.log(serde_json::json!({"type": "a"}));
        logger.flush_now().await; // must not panic
    }
}
