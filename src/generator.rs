use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::Config;
use crate::context_source::ContextItem;
use crate::error::GenerationError;

/// Produces an answer for a query from already-merged context.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, query: &str, context: &[ContextItem]) -> Result<String, GenerationError>;
}

/// Render the prompt sent to the model. Context items appear in the given order,
/// separated by blank lines.
pub fn build_prompt(query: &str, context: &[ContextItem]) -> String {
    let context_text = context
        .iter()
        .map(|item| item.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");

    format!(
        "Use the context below to answer the question.\n\n\
         Context:\n{context_text}\n\n\
         Question: {query}\n\n\
         Answer only from the context. If the context does not contain the answer, say so."
    )
}

#[derive(Serialize)]
struct OllamaGenerateRequest<'a> {
    model: &'a str,
    prompt: String,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Serialize)]
struct OllamaOptions {
    temperature: f32,
}

#[derive(Deserialize, Debug)]
struct OllamaGenerateResponse {
    #[serde(default)]
    response: Option<String>,
}

/// Generation service backed by Ollama's `/api/generate`, non-streamed.
pub struct OllamaGenerator {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    temperature: f32,
    timeout: Duration,
}

impl OllamaGenerator {
    pub fn new(
        ollama_url: &str,
        model: impl Into<String>,
        temperature: f32,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .pool_idle_timeout(Some(Duration::from_secs(300)))
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            endpoint: format!("{}/api/generate", ollama_url.trim_end_matches('/')),
            model: model.into(),
            temperature,
            timeout,
        })
    }

    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        Self::new(
            &config.ollama_url,
            config.generation_model.clone(),
            config.temperature,
            config.generation_timeout,
        )
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn classify(&self, err: reqwest::Error) -> GenerationError {
        if err.is_timeout() {
            GenerationError::Timeout {
                secs: self.timeout.as_secs(),
            }
        } else if err.is_connect() {
            GenerationError::ConnectionRefused {
                url: self.endpoint.clone(),
            }
        } else {
            GenerationError::Transport(err.to_string())
        }
    }

    async fn call(&self, prompt: String) -> Result<String, GenerationError> {
        let request = OllamaGenerateRequest {
            model: &self.model,
            prompt,
            stream: false,
            options: OllamaOptions {
                temperature: self.temperature,
            },
        };

        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = response.status();
        let body = response.text().await.map_err(|e| self.classify(e))?;
        if !status.is_success() {
            return Err(GenerationError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let payload: OllamaGenerateResponse = serde_json::from_str(&body)
            .map_err(|e| GenerationError::MalformedResponse(format!("invalid JSON: {e}")))?;

        payload
            .response
            .map(|answer| answer.trim().to_string())
            .ok_or_else(|| GenerationError::MalformedResponse("missing `response` field".to_string()))
    }
}

#[async_trait]
impl Generator for OllamaGenerator {
    async fn generate(&self, query: &str, context: &[ContextItem]) -> Result<String, GenerationError> {
        let prompt = build_prompt(query, context);
        tracing::debug!(model = %self.model, prompt_chars = prompt.len(), "Sending generation request");

        match tokio::time::timeout(self.timeout, self.call(prompt)).await {
            Ok(result) => result,
            Err(_) => Err(GenerationError::Timeout {
                secs: self.timeout.as_secs(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrieval::Tags;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn item(content: &str) -> ContextItem {
        ContextItem {
            content: content.to_string(),
            metadata: Tags::new(),
        }
    }

    fn generator_for(url: &str, timeout: Duration) -> OllamaGenerator {
        OllamaGenerator::new(url, "mistral", 0.7, timeout).unwrap()
    }

    #[test]
    fn test_prompt_keeps_context_order() {
        let prompt = build_prompt("What is Rust?", &[item("local chunk"), item("Title: web\nSnippet: hit")]);

        let local = prompt.find("local chunk").unwrap();
        let external = prompt.find("Title: web").unwrap();
        assert!(local < external);
        assert!(prompt.contains("local chunk\n\nTitle: web"));
        assert!(prompt.contains("Question: What is Rust?"));
    }

    #[tokio::test]
    async fn test_generate_sends_non_streamed_request_and_trims_answer() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .and(body_partial_json(serde_json::json!({
                "model": "mistral",
                "stream": false,
                "options": { "temperature": 0.7 }
            })))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "response": "  Rust is a language.\n" })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let generator = generator_for(&server.uri(), Duration::from_secs(5));
        let answer = generator.generate("What is Rust?", &[item("ctx")]).await.unwrap();

        assert_eq!(answer, "Rust is a language.");
    }

    #[tokio::test]
    async fn test_missing_response_field_is_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "done": true })))
            .mount(&server)
            .await;

        let generator = generator_for(&server.uri(), Duration::from_secs(5));
        let err = generator.generate("q", &[item("ctx")]).await.unwrap_err();

        assert!(matches!(err, GenerationError::MalformedResponse(_)));
    }

    #[tokio::test]
    async fn test_error_status_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(404).set_body_string("model 'mistral' not found"))
            .mount(&server)
            .await;

        let generator = generator_for(&server.uri(), Duration::from_secs(5));
        let err = generator.generate("q", &[item("ctx")]).await.unwrap_err();

        match err {
            GenerationError::Status { status, body } => {
                assert_eq!(status, 404);
                assert!(body.contains("not found"));
            }
            other => panic!("expected status error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_timeout_and_connection_refused_are_distinct() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "response": "late" }))
                    .set_delay(Duration::from_secs(3)),
            )
            .mount(&server)
            .await;

        let slow = generator_for(&server.uri(), Duration::from_millis(200));
        let timeout = slow.generate("q", &[item("ctx")]).await.unwrap_err();
        assert!(matches!(timeout, GenerationError::Timeout { .. }));

        let unreachable = generator_for("http://127.0.0.1:1", Duration::from_secs(5));
        let refused = unreachable.generate("q", &[item("ctx")]).await.unwrap_err();
        assert!(matches!(refused, GenerationError::ConnectionRefused { .. }));

        assert_ne!(timeout.to_string(), refused.to_string());
    }
}
