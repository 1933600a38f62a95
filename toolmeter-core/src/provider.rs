use async_trait::async_trait;
use futures_util::stream;

use crate::error::CoreResult;
use crate::http_client::{SseLine, SseStream};
use crate::model::{ChatMessage, ChatRequest, ChatResponse, Choice, Role, Usage};

/// Upstream LLM collaborator.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    fn name(&self) -> &str;
    /// Buffered completion.
    async fn chat(&self, req: ChatRequest) -> CoreResult<ChatResponse>;
    /// Raw SSE lines of a streamed completion.
    async fn chat_stream(&self, req: ChatRequest) -> CoreResult<SseStream>;
}

/// A dummy provider implementation that always returns canned responses.
/// Useful for tests or offline smoke runs.
pub struct NullProvider;

/// Registry name of the built-in offline provider.
pub const NULL_PROVIDER: &str = "null";
pub const NULL_REPLY: &str = "[null provider response]";

fn prompt_len(req: &ChatRequest) -> u64 {
    req.messages.iter().map(|m| m.text().chars().count() as u64).sum()
}

#[async_trait]
impl ChatProvider for NullProvider {
    fn name(&self) -> &str {
        NULL_PROVIDER
    }

    async fn chat(&self, req: ChatRequest) -> CoreResult<ChatResponse> {
        let prompt_tokens = prompt_len(&req);
        Ok(ChatResponse {
            id: "null-completion".into(),
            object: "chat.completion".into(),
            created: 0,
            model: req.model,
            choices: vec![Choice {
                index: 0,
                message: ChatMessage::new(Role::Assistant, NULL_REPLY),
                finish_reason: Some("stop".into()),
            }],
            usage: Some(Usage {
                prompt_tokens,
                completion_tokens: 0,
                total_tokens: prompt_tokens,
            }),
        })
    }

    async fn chat_stream(&self, req: ChatRequest) -> CoreResult<SseStream> {
        let prompt_tokens = prompt_len(&req);
        let model = req.model;
        let lines = vec![
            format!(
                r#"data: {{"id":"null-completion","model":"{model}","choices":[{{"index":0,"delta":{{"role":"assistant","content":"{NULL_REPLY}"}}}}]}}"#
            ),
            String::new(),
            format!(
                r#"data: {{"choices":[{{"index":0,"delta":{{}},"finish_reason":"stop"}}],"usage":{{"prompt_tokens":{prompt_tokens},"completion_tokens":0,"total_tokens":{prompt_tokens}}}}}"#
            ),
            String::new(),
            "data: [DONE]".to_string(),
        ];
        Ok(Box::pin(stream::iter(
            lines.into_iter().map(|line| Ok(SseLine { line })),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::DeltaAccumulator;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn null_provider_chat() {
        let req = ChatRequest::new("gpt-4o", vec![ChatMessage::new(Role::User, "hi")]);
        let resp = NullProvider.chat(req).await.unwrap();
        assert_eq!(resp.model, "gpt-4o");
        assert_eq!(resp.first_message().unwrap().text(), NULL_REPLY);
        assert_eq!(resp.usage.unwrap().prompt_tokens, 2);
    }

    #[tokio::test]
    async fn null_stream_reduces_to_same_text() {
        let req = ChatRequest::new("gpt-4o", vec![ChatMessage::new(Role::User, "hey")]);
        let mut lines = NullProvider.chat_stream(req).await.unwrap();
        let mut acc = DeltaAccumulator::default();
        while let Some(line) = lines.next().await {
            acc.push_line(&line.unwrap().line);
        }
        assert!(acc.saw_done());
        let resp = acc.finish("fallback");
        assert_eq!(resp.model, "gpt-4o");
        assert_eq!(resp.first_message().unwrap().text(), NULL_REPLY);
        assert_eq!(resp.usage.unwrap().prompt_tokens, 3);
    }
}
