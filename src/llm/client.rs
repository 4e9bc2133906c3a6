use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

use super::types::{ChatMessage, ChatRequest, ChatResponse};
use crate::config::{LlmConfig, RequestConfig};
use crate::error::{LlmError, LlmResult};
use crate::retry::{RetryError, RetryPolicy};

/// Language-model collaborator used for intent extraction and
/// indicator disambiguation.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Send `messages` and return the raw completion text.
    async fn complete(&self, messages: Vec<ChatMessage>, json_output: bool) -> LlmResult<String>;
}

/// Client for a local Ollama server's chat API
#[derive(Clone)]
pub struct OllamaClient {
    client: Client,
    endpoint: String,
    model: String,
    temperature: f64,
    request_config: RequestConfig,
    retry: RetryPolicy,
}

impl OllamaClient {
    /// Create a new Ollama client
    pub fn new(config: &LlmConfig, request_config: RequestConfig) -> LlmResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(request_config.timeout_ms))
            .build()
            .map_err(LlmError::Http)?;

        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            temperature: config.temperature,
            retry: RetryPolicy::from_config(&request_config),
            request_config,
        })
    }

    /// Run a chat request with retry
    pub async fn chat(&self, request: ChatRequest) -> LlmResult<ChatResponse> {
        let url = format!("{}/api/chat", self.endpoint);
        let operation = format!("ollama:{}", request.model);

        self.retry
            .run(&operation, || self.execute_request(&url, &request))
            .await
            .map_err(|e| match e {
                RetryError::Fatal(e) => e,
                RetryError::Exhausted { last, retries } => LlmError::Unavailable {
                    message: last.to_string(),
                    retries,
                },
            })
    }

    /// Execute a single request (internal)
    async fn execute_request(&self, url: &str, request: &ChatRequest) -> LlmResult<ChatResponse> {
        debug!(
            model = %request.model,
            messages = request.messages.len(),
            json = request.format.is_some(),
            "Calling Ollama chat"
        );

        let response = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout {
                        timeout_ms: self.request_config.timeout_ms,
                    }
                } else {
                    LlmError::Http(e)
                }
            })?;

        let status = response.status();

        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            return Err(LlmError::Api {
                status: status.as_u16(),
                message: error_body,
            });
        }

        let chat_response: ChatResponse =
            response
                .json()
                .await
                .map_err(|e| LlmError::InvalidResponse {
                    message: format!("Failed to parse response: {}", e),
                })?;

        Ok(chat_response)
    }

    /// Get the endpoint (for testing)
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Configured model name
    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl LanguageModel for OllamaClient {
    async fn complete(&self, messages: Vec<ChatMessage>, json_output: bool) -> LlmResult<String> {
        let mut request = ChatRequest::new(&self.model, messages, self.temperature);
        if json_output {
            request = request.with_json_output();
        }

        let response = self.chat(request).await?;
        if response.message.content.trim().is_empty() {
            return Err(LlmError::InvalidResponse {
                message: "model returned an empty completion".to_string(),
            });
        }
        Ok(response.message.content)
    }
}
