//! Transaction Inspector (C10): a bounded ring buffer of upstream
//! request/response pairs, exportable as a HAR 1.2 document.
//!
//! Participation is opt-in per call — callers that don't want the
//! overhead simply never call `record`, which keeps the cost of being
//! disabled down to nothing beyond holding an `Arc` nobody touches.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};

/// One captured Upstream Call, redacted of credentials before storage.
#[derive(Debug, Clone, Serialize)]
pub struct Transaction {
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub ttfb_ms: Option<u64>,
    pub request_method: String,
    pub request_url: String,
    pub request_headers: Vec<(String, String)>,
    pub response_status: u16,
    pub response_headers: Vec<(String, String)>,
    pub response_body_snippet: String,
    pub token_counts: Option<TokenCounts>,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct TokenCounts {
    pub prompt: u32,
    pub completion: u32,
}

const REDACTED_HEADERS: &[&str] = &["authorization", "x-api-key"];
const BODY_SNIPPET_MAX_LEN: usize = 2048;

/// Strip credential-bearing header values before a transaction is ever stored.
pub fn redact_headers(headers: &[(String, String)]) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(name, value)| {
            if REDACTED_HEADERS.contains(&name.to_ascii_lowercase().as_str()) {
                (name.clone(), "[redacted]".to_string())
            } else {
                (name.clone(), value.clone())
            }
        })
        .collect()
}

/// Truncate a response body for storage, never persisting a stream's full content.
pub fn snippet(body: &str) -> String {
    if body.len() <= BODY_SNIPPET_MAX_LEN {
        body.to_string()
    } else {
        format!("{}...", &body[..BODY_SNIPPET_MAX_LEN])
    }
}

/// Fixed-capacity ring buffer with LRU (oldest-first) eviction.
pub struct TransactionInspector {
    buffer: Mutex<VecDeque<Transaction>>,
    max_transactions: usize,
}

impl TransactionInspector {
    pub fn new(max_transactions: usize) -> Self {
        Self { buffer: Mutex::new(VecDeque::with_capacity(max_transactions)), max_transactions }
    }

    pub fn record(&self, transaction: Transaction) {
        let mut buffer = self.buffer.lock().expect("inspector buffer poisoned");
        if buffer.len() >= self.max_transactions {
            buffer.pop_front();
        }
        buffer.push_back(transaction);
    }

    pub fn clear(&self) {
        self.buffer.lock().expect("inspector buffer poisoned").clear();
    }

    pub fn len(&self) -> usize {
        self.buffer.lock().expect("inspector buffer poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Render the captured transactions as a HAR 1.2 document.
    pub fn to_har(&self) -> Value {
        let buffer = self.buffer.lock().expect("inspector buffer poisoned");
        let entries: Vec<Value> = buffer.iter().map(transaction_to_har_entry).collect();

        json!({
            "log": {
                "version": "1.2",
                "creator": { "name": "freegate", "version": env!("CARGO_PKG_VERSION") },
                "entries": entries,
            }
        })
    }
}

fn transaction_to_har_entry(tx: &Transaction) -> Value {
    let total_ms = (tx.ended_at - tx.started_at).num_milliseconds().max(0);
    json!({
        "startedDateTime": tx.started_at.to_rfc3339(),
        "time": total_ms,
        "request": {
            "method": tx.request_method,
            "url": tx.request_url,
            "httpVersion": "HTTP/1.1",
            "headers": headers_to_har(&tx.request_headers),
            "queryString": [],
            "headersSize": -1,
            "bodySize": -1,
        },
        "response": {
            "status": tx.response_status,
            "statusText": "",
            "httpVersion": "HTTP/1.1",
            "headers": headers_to_har(&tx.response_headers),
            "content": {
                "size": tx.response_body_snippet.len(),
                "mimeType": "application/json",
                "text": tx.response_body_snippet,
            },
            "headersSize": -1,
            "bodySize": -1,
        },
        "cache": {},
        "timings": {
            "send": 0,
            "wait": tx.ttfb_ms.unwrap_or(0),
            "receive": (total_ms as u64).saturating_sub(tx.ttfb_ms.unwrap_or(0)),
        },
    })
}

fn headers_to_har(headers: &[(String, String)]) -> Vec<Value> {
    headers.iter().map(|(name, value)| json!({"name": name, "value": value})).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_transaction() -> Transaction {
        let now = Utc::now();
        Transaction {
            started_at: now,
            ended_at: now + chrono::Duration::milliseconds(120),
            ttfb_ms: Some(40),
            request_method: "POST".to_string(),
            request_url: "https://openrouter.ai/api/v1/chat/completions".to_string(),
            request_headers: vec![("authorization".to_string(), "Bearer secret".to_string())],
            response_status: 200,
            response_headers: vec![],
            response_body_snippet: "ok".to_string(),
            token_counts: None,
        }
    }

    #[test]
    fn redact_headers_masks_authorization_but_keeps_others() {
        let redacted = redact_headers(&[
            ("authorization".to_string(), "Bearer secret".to_string()),
            ("content-type".to_string(), "application/json".to_string()),
        ]);
        assert_eq!(redacted[0].1, "[redacted]");
        assert_eq!(redacted[1].1, "application/json");
    }

    #[test]
    fn snippet_truncates_long_bodies() {
        let long = "x".repeat(BODY_SNIPPET_MAX_LEN + 100);
        let truncated = snippet(&long);
        assert!(truncated.len() < long.len());
        assert!(truncated.ends_with("..."));
    }

    #[test]
    fn ring_buffer_evicts_oldest_past_capacity() {
        let inspector = TransactionInspector::new(2);
        for i in 0..3 {
            let mut tx = sample_transaction();
            tx.request_url = format!("url-{i}");
            inspector.record(tx);
        }
        assert_eq!(inspector.len(), 2);
        let har = inspector.to_har();
        let entries = har["log"]["entries"].as_array().unwrap();
        assert_eq!(entries[0]["request"]["url"], "url-1");
        assert_eq!(entries[1]["request"]["url"], "url-2");
    }

    #[test]
    fn clear_empties_the_buffer() {
        let inspector = TransactionInspector::new(10);
        inspector.record(sample_transaction());
        inspector.clear();
        assert!(inspector.is_empty());
    }

    #[test]
    fn har_export_has_expected_top_level_shape() {
        let inspector = TransactionInspector::new(10);
        inspector.record(sample_transaction());
        let har = inspector.to_har();
        assert_eq!(har["log"]["version"], "1.2");
        assert_eq!(har["log"]["entries"].as_array().unwrap().len(), 1);
    }
}
