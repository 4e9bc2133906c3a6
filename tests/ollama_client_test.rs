//! Integration tests for the Ollama client
//!
//! Tests HTTP client behavior using wiremock for request/response mocking,
//! including intent extraction driven through the real client.

use std::sync::Arc;

use serde_json::json;
use wiremock::{
    matchers::{body_partial_json, method, path},
    Mock, MockServer, ResponseTemplate,
};

use census_query_resolver::config::{LlmConfig, RequestConfig};
use census_query_resolver::error::{AppError, LlmError};
use census_query_resolver::intent::{IntentExtractor, Task};
use census_query_resolver::llm::{ChatMessage, ChatRequest, LanguageModel, OllamaClient};

/// Create a test client pointing to mock server
fn create_test_client(base_url: &str) -> OllamaClient {
    let config = LlmConfig {
        endpoint: base_url.to_string(),
        model: "phi3:mini".to_string(),
        temperature: 0.1,
    };

    let request_config = RequestConfig {
        timeout_ms: 5000,
        max_retries: 0, // No retries for testing
        retry_delay_ms: 10,
    };

    OllamaClient::new(&config, request_config).expect("Failed to create client")
}

fn chat_reply(content: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "model": "phi3:mini",
        "message": {"role": "assistant", "content": content},
        "done": true,
        "prompt_eval_count": 120,
        "eval_count": 30
    }))
}

#[cfg(test)]
mod chat_tests {
    use super::*;

    #[tokio::test]
    async fn test_successful_chat() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .and(body_partial_json(json!({
                "model": "phi3:mini",
                "stream": false,
                "format": "json"
            })))
            .respond_with(chat_reply(r#"{"task": "top"}"#))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = create_test_client(&mock_server.uri());
        let completion = client
            .complete(vec![ChatMessage::user("top tracts by income")], true)
            .await
            .unwrap();

        assert_eq!(completion, r#"{"task": "top"}"#);
    }

    #[tokio::test]
    async fn test_chat_response_metadata() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(chat_reply("hello"))
            .mount(&mock_server)
            .await;

        let client = create_test_client(&mock_server.uri());
        let response = client
            .chat(ChatRequest::new("phi3:mini", vec![ChatMessage::user("hi")], 0.0))
            .await
            .unwrap();

        assert!(response.done);
        assert_eq!(response.eval_count, Some(30));
        assert_eq!(response.message.content, "hello");
    }

    #[tokio::test]
    async fn test_empty_completion_is_invalid() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(chat_reply("   "))
            .mount(&mock_server)
            .await;

        let client = create_test_client(&mock_server.uri());
        let result = client.complete(vec![ChatMessage::user("hi")], false).await;

        assert!(matches!(result, Err(LlmError::InvalidResponse { .. })));
    }

    #[tokio::test]
    async fn test_model_not_found() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(
                ResponseTemplate::new(404).set_body_json(json!({"error": "model 'phi3:mini' not found"})),
            )
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = create_test_client(&mock_server.uri());
        let result = client.complete(vec![ChatMessage::user("hi")], true).await;

        match result {
            Err(LlmError::Api { status, message }) => {
                assert_eq!(status, 404);
                assert!(message.contains("not found"));
            }
            other => panic!("Expected Api error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_server_error_exhausts_retries() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(500))
            .expect(2)
            .mount(&mock_server)
            .await;

        let config = LlmConfig {
            endpoint: mock_server.uri(),
            model: "phi3:mini".to_string(),
            temperature: 0.1,
        };
        let client = OllamaClient::new(
            &config,
            RequestConfig {
                timeout_ms: 5000,
                max_retries: 1,
                retry_delay_ms: 10,
            },
        )
        .unwrap();
        let result = client.complete(vec![ChatMessage::user("hi")], true).await;

        assert!(matches!(result, Err(LlmError::Unavailable { retries: 1, .. })));
    }

    #[tokio::test]
    async fn test_malformed_body_is_invalid() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&mock_server)
            .await;

        let client = create_test_client(&mock_server.uri());
        let result = client.complete(vec![ChatMessage::user("hi")], true).await;

        assert!(matches!(result, Err(LlmError::InvalidResponse { .. })));
    }
}

#[cfg(test)]
mod extraction_tests {
    use super::*;

    #[tokio::test]
    async fn test_extract_intent_through_client() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(chat_reply(
                "```json\n{\"task\": \"filter\", \"measure\": \"median income\", \"geography\": \"Orleans\", \"op\": \"<\", \"value\": \"35k\"}\n```",
            ))
            .expect(1)
            .mount(&mock_server)
            .await;

        let extractor = IntentExtractor::new(Arc::new(create_test_client(&mock_server.uri())));
        let intent = extractor
            .extract("tracts in Orleans with median income under $35k", None)
            .await
            .unwrap();

        assert_eq!(intent.task, Task::FilterThreshold);
        assert_eq!(intent.measure_phrase.as_deref(), Some("median income"));
        assert_eq!(intent.geography_phrase.as_deref(), Some("Orleans"));
        assert_eq!(intent.comparison_value, Some(35_000.0));
    }

    #[tokio::test]
    async fn test_non_conforming_output_is_retried_once() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(chat_reply(r#"{"task": "summarize", "measure": "income"}"#))
            .up_to_n_times(1)
            .expect(1)
            .mount(&mock_server)
            .await;

        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(chat_reply(r#"{"task": "bottom", "measure": "median rent", "limit": 3}"#))
            .expect(1)
            .mount(&mock_server)
            .await;

        let extractor = IntentExtractor::new(Arc::new(create_test_client(&mock_server.uri())));
        let intent = extractor
            .extract("cheapest 3 tracts for rent", None)
            .await
            .unwrap();

        assert_eq!(intent.task, Task::RankBottom);
        assert_eq!(intent.limit, Some(3));
    }

    #[tokio::test]
    async fn test_unreachable_model_is_llm_error() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&mock_server)
            .await;

        let extractor = IntentExtractor::new(Arc::new(create_test_client(&mock_server.uri())));
        let result = extractor.extract("top tracts by income", None).await;

        // Transport failures are not retried as parse failures
        assert!(matches!(result, Err(AppError::Llm(LlmError::Unavailable { .. }))));
    }
}
