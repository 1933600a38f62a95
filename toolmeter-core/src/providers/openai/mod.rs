use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde_json::json;

use crate::error::CoreResult;
use crate::http_client::{HttpClient, RequestCtx, SseStream};
use crate::model::{ChatRequest, ChatResponse};
use crate::provider::ChatProvider;

/// Any upstream speaking the OpenAI chat-completions protocol (OpenAI,
/// OpenRouter, self-hosted gateways). Registered under a configured name.
pub struct OpenAiCompatible {
    http: HttpClient,
    base: String,
    name: String,
    api_key: SecretString,
}

impl OpenAiCompatible {
    pub fn new(name: &str, http: HttpClient, api_key: SecretString, base: &str) -> Self {
        Self {
            http,
            api_key,
            base: base.trim_end_matches('/').to_string(),
            name: name.to_string(),
        }
    }

    #[cfg(test)]
    pub fn new_for_tests(server_base: &str) -> Self {
        Self::new(
            "openai",
            HttpClient::new_default().unwrap(),
            SecretString::from("test-key"),
            &format!("{server_base}/v1"),
        )
    }

    fn url(&self) -> String {
        format!("{}/chat/completions", self.base)
    }

    fn auth(&self) -> String {
        format!("Bearer {}", self.api_key.expose_secret())
    }

    fn ctx(&self) -> RequestCtx<'_> {
        RequestCtx {
            provider: Some(&self.name),
            ..RequestCtx::default()
        }
    }
}

#[async_trait]
impl ChatProvider for OpenAiCompatible {
    fn name(&self) -> &str {
        &self.name
    }

    async fn chat(&self, mut req: ChatRequest) -> CoreResult<ChatResponse> {
        req.stream = None;
        req.extra.remove("stream_options");
        let auth = self.auth();
        let (resp, upstream_id, latency_ms) = self
            .http
            .post_json::<_, ChatResponse>(&self.url(), &req, &[("Authorization", &auth)], &self.ctx())
            .await?;
        tracing::debug!(
            provider = %self.name,
            model = %resp.model,
            upstream_id = upstream_id.as_deref().unwrap_or(""),
            latency_ms,
            "chat completion"
        );
        Ok(resp)
    }

    async fn chat_stream(&self, mut req: ChatRequest) -> CoreResult<SseStream> {
        req.stream = Some(true);
        // Ask for the trailing usage frame; callers may already have set it.
        req.extra
            .entry("stream_options")
            .or_insert_with(|| json!({ "include_usage": true }));
        let auth = self.auth();
        self.http
            .post_sse_lines(&self.url(), &req, &[("Authorization", &auth)], &self.ctx())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use httpmock::Method::POST;
    use httpmock::MockServer;
    use serde_json::json;

    use crate::error::MeterError;
    use crate::model::{ChatMessage, Role};

    fn req() -> ChatRequest {
        ChatRequest::new("gpt-4o", vec![ChatMessage::new(Role::User, "Hi")])
    }

    #[tokio::test]
    async fn chat_200_maps_fields() {
        let server = MockServer::start();
        let provider = OpenAiCompatible::new_for_tests(&server.base_url());

        let m = server.mock(|when, then| {
            when.method(POST)
                .path("/v1/chat/completions")
                .header("Authorization", "Bearer test-key");
            then.status(200).json_body(json!({
                "id": "cmpl_123",
                "object": "chat.completion",
                "created": 1700000000,
                "model": "gpt-4o-2024-08-06",
                "choices": [{
                    "index": 0,
                    "message": {"role":"assistant", "content":"Hello!"},
                    "finish_reason": "stop"
                }],
                "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
            }));
        });

        let resp = provider.chat(req()).await.unwrap();
        m.assert();
        assert_eq!(resp.id, "cmpl_123");
        assert_eq!(resp.model, "gpt-4o-2024-08-06");
        assert_eq!(resp.first_message().unwrap().text(), "Hello!");
        assert_eq!(resp.finish_reason(), Some("stop"));
        assert_eq!(resp.usage.unwrap().total(), 15);
    }

    #[tokio::test]
    async fn chat_passes_unknown_fields_through() {
        let server = MockServer::start();
        let provider = OpenAiCompatible::new_for_tests(&server.base_url());
        let m = server.mock(|when, then| {
            when.method(POST)
                .path("/v1/chat/completions")
                .json_body_partial(r#"{"tools":[{"type":"function"}]}"#);
            then.status(200).json_body(json!({"choices": []}));
        });
        let mut r = req();
        r.extra
            .insert("tools".into(), json!([{"type": "function"}]));
        provider.chat(r).await.unwrap();
        m.assert();
    }

    #[tokio::test]
    async fn chat_error_keeps_provider_name() {
        let server = MockServer::start();
        let provider = OpenAiCompatible::new_for_tests(&server.base_url());
        server.mock(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(401)
                .json_body(json!({"error": {"message": "bad key"}}));
        });
        match provider.chat(req()).await.unwrap_err() {
            MeterError::ProviderError {
                provider,
                code,
                message,
            } => {
                assert_eq!(provider, "openai");
                assert_eq!(code, "401");
                assert_eq!(message, "bad key");
            }
            other => panic!("expected ProviderError, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stream_requests_usage_and_yields_lines() {
        let server = MockServer::start();
        let provider = OpenAiCompatible::new_for_tests(&server.base_url());
        let m = server.mock(|when, then| {
            when.method(POST)
                .path("/v1/chat/completions")
                .json_body_partial(r#"{"stream":true,"stream_options":{"include_usage":true}}"#);
            then.status(200)
                .header("content-type", "text/event-stream")
                .body("data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\ndata: [DONE]\n\n");
        });
        let lines: Vec<String> = provider
            .chat_stream(req())
            .await
            .unwrap()
            .map(|l| l.unwrap().line)
            .collect()
            .await;
        m.assert();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[2], "data: [DONE]");
    }
}
