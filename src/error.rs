//! Error Taxonomy
//!
//! Every failure that can originate from an upstream call, the circuit
//! breaker, or the spending ledger is classified exactly once, at the
//! point it originates, into one of the variants below. Reclassifying
//! an error after the fact is forbidden: callers match on the variant,
//! not on message text.
//!
//! `GatewayError` also implements `IntoResponse` so route handlers can
//! return it directly; it never leaks a bare Rust debug string to a
//! client.

use axum::{
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

/// Tagged error variants carrying retryability and provider context.
#[derive(Debug, Clone)]
pub enum GatewayError {
    /// Transport failure, DNS, TCP/TLS, or a stream abort not originated locally.
    NetworkError { message: String, model: Option<String> },

    /// Upstream HTTP 429 or an explicit rate-limit signal.
    RateLimitError {
        message: String,
        model: String,
        retry_after: Option<u64>,
        /// Explicit per-instance override of the default retryability, when
        /// the upstream body itself carries a `retryable` signal.
        retryable_override: Option<bool>,
    },

    /// Non-2xx response with a parsed `error.message`. Retryable iff `status >= 500`,
    /// unless `retryable_override` says otherwise.
    UpstreamError {
        status: u16,
        message: String,
        model: String,
        retryable_override: Option<bool>,
    },

    /// The circuit breaker refused the request.
    CircuitOpenError { model: String, reset_at: DateTime<Utc> },

    /// Client-initiated cancellation.
    AbortError { model: Option<String> },

    /// Missing or invalid credentials for the selected source.
    ConfigurationError { message: String },

    /// The spending ledger rejected the request pre-flight.
    SpendingCapError { message: String },

    /// An internal invariant broke (e.g. a poisoned lock) rather than an
    /// upstream or configuration failure. Never retryable, never counted
    /// toward the circuit: the failure is this gateway's own, not the
    /// model's.
    InternalError { message: String },
}

impl GatewayError {
    /// Whether this error is retryable, honoring an explicit per-instance
    /// override first and falling back to the per-variant default.
    pub fn retryable(&self) -> bool {
        match self {
            GatewayError::NetworkError { .. } => true,
            GatewayError::RateLimitError { retryable_override, .. } => {
                retryable_override.unwrap_or(true)
            }
            GatewayError::UpstreamError { status, retryable_override, .. } => {
                retryable_override.unwrap_or(*status >= 500)
            }
            GatewayError::CircuitOpenError { .. } => false,
            GatewayError::AbortError { .. } => false,
            GatewayError::ConfigurationError { .. } => false,
            GatewayError::SpendingCapError { .. } => false,
            GatewayError::InternalError { .. } => false,
        }
    }

    /// Whether this error should count as a failure toward the circuit breaker.
    /// Network errors, rate limits, and 5xx upstream errors all do; configuration,
    /// spending-cap, and abort errors never do (see §4.4 of the design notes).
    pub fn counts_toward_circuit(&self) -> bool {
        match self {
            GatewayError::NetworkError { .. } => true,
            GatewayError::RateLimitError { .. } => true,
            GatewayError::UpstreamError { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// The model this error is scoped to, if any.
    pub fn model(&self) -> Option<&str> {
        match self {
            GatewayError::NetworkError { model, .. } => model.as_deref(),
            GatewayError::RateLimitError { model, .. } => Some(model),
            GatewayError::UpstreamError { model, .. } => Some(model),
            GatewayError::CircuitOpenError { model, .. } => Some(model),
            GatewayError::AbortError { model, .. } => model.as_deref(),
            GatewayError::ConfigurationError { .. } => None,
            GatewayError::SpendingCapError { .. } => None,
            GatewayError::InternalError { .. } => None,
        }
    }

    /// Human-readable message, used both in HTTP responses and telemetry.
    pub fn message(&self) -> String {
        match self {
            GatewayError::NetworkError { message, .. } => message.clone(),
            GatewayError::RateLimitError { message, .. } => message.clone(),
            GatewayError::UpstreamError { message, .. } => message.clone(),
            GatewayError::CircuitOpenError { model, reset_at } => {
                format!("circuit open for model '{model}' until {reset_at}")
            }
            GatewayError::AbortError { .. } => "request aborted".to_string(),
            GatewayError::ConfigurationError { message } => message.clone(),
            GatewayError::SpendingCapError { message } => message.clone(),
            GatewayError::InternalError { message } => message.clone(),
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            GatewayError::NetworkError { .. } => "network_error",
            GatewayError::RateLimitError { .. } => "rate_limit_error",
            GatewayError::UpstreamError { .. } => "upstream_error",
            GatewayError::CircuitOpenError { .. } => "circuit_open",
            GatewayError::AbortError { .. } => "aborted",
            GatewayError::ConfigurationError { .. } => "configuration_error",
            GatewayError::SpendingCapError { .. } => "spending_cap_exceeded",
            GatewayError::InternalError { .. } => "internal_error",
        }
    }

    /// Flat JSON representation used by telemetry events. Never contains chat content.
    pub fn to_telemetry_json(&self) -> Value {
        serde_json::json!({
            "type": self.error_type(),
            "message": self.message(),
            "model": self.model(),
            "retryable": self.retryable(),
            "timestamp": Utc::now(),
        })
    }
}

impl std::fmt::Display for GatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.error_type(), self.message())
    }
}

impl std::error::Error for GatewayError {}

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetails,
}

#[derive(Serialize)]
struct ErrorDetails {
    message: String,
    #[serde(rename = "type")]
    kind: &'static str,
    code: &'static str,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let (status, retry_after) = match &self {
            GatewayError::SpendingCapError { .. } => (StatusCode::PAYMENT_REQUIRED, None),
            GatewayError::ConfigurationError { .. } => (StatusCode::BAD_REQUEST, None),
            GatewayError::CircuitOpenError { reset_at, .. } => {
                let secs = (*reset_at - Utc::now()).num_seconds().max(0) as u64;
                (StatusCode::SERVICE_UNAVAILABLE, Some(secs))
            }
            GatewayError::RateLimitError { .. } => (StatusCode::TOO_MANY_REQUESTS, None),
            GatewayError::UpstreamError { status, .. } => (
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY),
                None,
            ),
            GatewayError::NetworkError { .. } => (StatusCode::BAD_GATEWAY, None),
            // An aborted call has no client left to answer; this arm is only reached
            // if a handler mistakenly propagates it as a response.
            GatewayError::AbortError { .. } => (StatusCode::CONFLICT, None),
            GatewayError::InternalError { .. } => (StatusCode::INTERNAL_SERVER_ERROR, None),
        };

        let body = ErrorBody {
            error: ErrorDetails {
                message: self.message(),
                kind: self.error_type(),
                code: self.error_type(),
            },
        };

        let mut response = (status, axum::Json(body)).into_response();
        if let Some(secs) = retry_after {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert("Retry-After", value);
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_matches_table() {
        assert!(GatewayError::NetworkError { message: "x".into(), model: None }.retryable());
        assert!(GatewayError::RateLimitError {
            message: "x".into(),
            model: "m".into(),
            retry_after: None,
            retryable_override: None,
        }
        .retryable());
        assert!(GatewayError::UpstreamError {
            status: 500,
            message: "x".into(),
            model: "m".into(),
            retryable_override: None,
        }
        .retryable());
        assert!(!GatewayError::UpstreamError {
            status: 400,
            message: "x".into(),
            model: "m".into(),
            retryable_override: None,
        }
        .retryable());
        assert!(!GatewayError::CircuitOpenError { model: "m".into(), reset_at: Utc::now() }
            .retryable());
        assert!(!GatewayError::AbortError { model: None }.retryable());
        assert!(!GatewayError::ConfigurationError { message: "x".into() }.retryable());
        assert!(!GatewayError::SpendingCapError { message: "x".into() }.retryable());
        assert!(!GatewayError::InternalError { message: "x".into() }.retryable());
    }

    #[test]
    fn explicit_override_takes_precedence_over_default_retryability() {
        let forced_no_retry = GatewayError::UpstreamError {
            status: 503,
            message: "x".into(),
            model: "m".into(),
            retryable_override: Some(false),
        };
        assert!(!forced_no_retry.retryable());

        let forced_retry = GatewayError::UpstreamError {
            status: 400,
            message: "x".into(),
            model: "m".into(),
            retryable_override: Some(true),
        };
        assert!(forced_retry.retryable());

        let forced_rate_limit_no_retry = GatewayError::RateLimitError {
            message: "x".into(),
            model: "m".into(),
            retry_after: None,
            retryable_override: Some(false),
        };
        assert!(!forced_rate_limit_no_retry.retryable());
    }

    #[test]
    fn only_network_rate_limit_and_5xx_count_toward_circuit() {
        assert!(GatewayError::NetworkError { message: "x".into(), model: None }.counts_toward_circuit());
        assert!(GatewayError::RateLimitError {
            message: "x".into(),
            model: "m".into(),
            retry_after: None,
            retryable_override: None,
        }
        .counts_toward_circuit());
        assert!(GatewayError::UpstreamError {
            status: 503,
            message: "x".into(),
            model: "m".into(),
            retryable_override: None,
        }
        .counts_toward_circuit());
        assert!(!GatewayError::UpstreamError {
            status: 404,
            message: "x".into(),
            model: "m".into(),
            retryable_override: None,
        }
        .counts_toward_circuit());
        assert!(!GatewayError::AbortError { model: None }.counts_toward_circuit());
        assert!(!GatewayError::ConfigurationError { message: "x".into() }.counts_toward_circuit());
        assert!(!GatewayError::SpendingCapError { message: "x".into() }.counts_toward_circuit());
        assert!(!GatewayError::InternalError { message: "x".into() }.counts_toward_circuit());
    }

    #[test]
    fn telemetry_json_never_contains_raw_content_field() {
        let err = GatewayError::UpstreamError {
            status: 503,
            message: "boom".into(),
            model: "m/1".into(),
            retryable_override: None,
        };
        let json = err.to_telemetry_json();
        assert!(json.get("messages").is_none());
        assert_eq!(json["model"], "m/1");
    }
}
