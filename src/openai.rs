//! Review generation against the OpenAI chat completions API.
//!
//! The backend is a black box to the rest of the pipeline: it takes the diff
//! plus context and either returns markdown or fails. Any failure here is a
//! generation failure, retried only within the job-level budget.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

use crate::context::{ContextFile, ReviewInput};

const COMPLETIONS_URL: &str = "https://api.openai.com/v1/chat/completions";

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("OpenAI API error: {status} - {message}")]
    Status { status: u16, message: String },
    #[error("network error: {0}")]
    Network(String),
    #[error("malformed response: {0}")]
    Malformed(String),
}

#[async_trait]
pub trait ReviewBackend: Send + Sync {
    /// Produce a markdown review for the given input, or fail.
    async fn generate_review(
        &self,
        input: &ReviewInput,
        context: &[ContextFile],
    ) -> Result<String, BackendError>;
}

#[derive(Clone)]
pub struct OpenAiClient {
    client: Client,
    api_key: String,
    model: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    content: String,
}

/// System prompt for code review.
pub fn get_system_prompt() -> &'static str {
    include_str!("prompt.txt")
}

/// Build the user prompt from PR metadata, diff and collected context files.
pub fn create_user_prompt(input: &ReviewInput, context: &[ContextFile]) -> String {
    let mut prompt = format!(
        "Pull request: {}\n\nDescription:\n{}\n\nDIFF BEGINS:\n{}\nDIFF ENDS\n",
        input.title,
        if input.description.is_empty() {
            "(none)"
        } else {
            &input.description
        },
        input.diff
    );

    if !context.is_empty() {
        prompt.push_str("\nREPOSITORY CONTEXT (selected files, may be partial):\n");
        for file in context {
            prompt.push_str(&format!("\n === {} ===\n\n{}\n", file.path, file.content));
        }
    }

    prompt
}

impl OpenAiClient {
    pub fn new(api_key: String, model: String, request_timeout: Duration) -> Self {
        let client = Client::builder()
            .user_agent(concat!("reviewd/", env!("CARGO_PKG_VERSION")))
            .timeout(request_timeout)
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            api_key,
            model,
        }
    }
}

#[async_trait]
impl ReviewBackend for OpenAiClient {
    async fn generate_review(
        &self,
        input: &ReviewInput,
        context: &[ContextFile],
    ) -> Result<String, BackendError> {
        let user_prompt = create_user_prompt(input, context);
        info!(
            "Requesting review from model {} ({} prompt bytes)",
            self.model,
            user_prompt.len()
        );

        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: get_system_prompt(),
                },
                ChatMessage {
                    role: "user",
                    content: &user_prompt,
                },
            ],
        };

        let response = self
            .client
            .post(COMPLETIONS_URL)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await
            .map_err(|e| BackendError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(BackendError::Status {
                status: status.as_u16(),
                message,
            });
        }

        let body: ChatResponse = response
            .json()
            .await
            .map_err(|e| BackendError::Malformed(e.to_string()))?;

        let review = body
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| BackendError::Malformed("no choices in response".to_string()))?;

        if review.trim().is_empty() {
            return Err(BackendError::Malformed("empty review text".to_string()));
        }

        info!("Received review ({} bytes)", review.len());
        Ok(review)
    }
}
