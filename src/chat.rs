//! Wire-level shapes for the OpenAI-compatible chat-completions surface.
//!
//! These mirror the subset of the OpenAI schema this gateway actually
//! produces and consumes; upstream responses are normalized into these
//! same types before they reach the client, so `/v1/chat/completions`
//! looks identical regardless of which free provider served it.

use serde::{Deserialize, Serialize};

use crate::error::GatewayError;

const VALID_ROLES: [&str; 3] = ["system", "user", "assistant"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// Body accepted by `POST /v1/chat/completions`.
///
/// `model` is usually a single descriptor id, but a comma-separated list
/// (`"ollama/llama3,openrouter/foo"`) selects fanout across multiple
/// models in one call — the wire-level "model selection" the router's
/// data model calls for, without inventing a second request shape.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: bool,
}

impl ChatCompletionRequest {
    pub fn model_selection(&self) -> Vec<String> {
        self.model
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Rejects a request whose `messages` array is empty or contains a
    /// message with an unrecognized `role` or empty `content`.
    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.messages.is_empty() {
            return Err(GatewayError::ConfigurationError {
                message: "messages must not be empty".to_string(),
            });
        }
        for message in &self.messages {
            if !VALID_ROLES.contains(&message.role.as_str()) {
                return Err(GatewayError::ConfigurationError {
                    message: format!(
                        "invalid role '{}', expected one of {:?}",
                        message.role, VALID_ROLES
                    ),
                });
            }
            if message.content.is_empty() {
                return Err(GatewayError::ConfigurationError {
                    message: "message content must not be empty".to_string(),
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Serialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChatCompletionChoice>,
}

#[derive(Debug, Serialize)]
pub struct ChatCompletionChoice {
    pub index: u32,
    pub message: ChatMessage,
    pub finish_reason: &'static str,
}

impl ChatCompletionResponse {
    pub fn single(model: String, content: String) -> Self {
        Self {
            id: format!("chatcmpl-{}", uuid::Uuid::new_v4()),
            object: "chat.completion",
            created: chrono::Utc::now().timestamp(),
            model,
            choices: vec![ChatCompletionChoice {
                index: 0,
                message: ChatMessage { role: "assistant".to_string(), content },
                finish_reason: "stop",
            }],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_model_selection_is_one_entry() {
        let req = ChatCompletionRequest {
            model: "ollama/llama3".to_string(),
            messages: vec![],
            stream: false,
        };
        assert_eq!(req.model_selection(), vec!["ollama/llama3".to_string()]);
    }

    #[test]
    fn comma_separated_model_selects_fanout() {
        let req = ChatCompletionRequest {
            model: "ollama/llama3, openrouter/foo".to_string(),
            messages: vec![],
            stream: false,
        };
        assert_eq!(
            req.model_selection(),
            vec!["ollama/llama3".to_string(), "openrouter/foo".to_string()]
        );
    }

    #[test]
    fn validate_rejects_empty_messages() {
        let req = ChatCompletionRequest { model: "ollama/llama3".to_string(), messages: vec![], stream: false };
        assert!(req.validate().is_err());
    }

    #[test]
    fn validate_rejects_unknown_role() {
        let req = ChatCompletionRequest {
            model: "ollama/llama3".to_string(),
            messages: vec![ChatMessage { role: "developer".to_string(), content: "hi".to_string() }],
            stream: false,
        };
        assert!(req.validate().is_err());
    }

    #[test]
    fn validate_rejects_empty_content() {
        let req = ChatCompletionRequest {
            model: "ollama/llama3".to_string(),
            messages: vec![ChatMessage { role: "user".to_string(), content: String::new() }],
            stream: false,
        };
        assert!(req.validate().is_err());
    }

    #[test]
    fn validate_accepts_well_formed_messages() {
        let req = ChatCompletionRequest {
            model: "ollama/llama3".to_string(),
            messages: vec![
                ChatMessage { role: "system".to_string(), content: "be terse".to_string() },
                ChatMessage { role: "user".to_string(), content: "hi".to_string() },
            ],
            stream: false,
        };
        assert!(req.validate().is_ok());
    }
}
