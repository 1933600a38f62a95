//! Turn one proxied chat-completion exchange into OTLP-shaped spans.
//!
//! Every exchange yields a `gen_ai.request` root span. A response (full or
//! partial) adds a `gen_ai.response` child, each returned tool call a
//! `gen_ai.tool_call` child and each tool message in the request a
//! `gen_ai.tool_result` child. Long text is cut with a visible marker.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::attribution::Attribution;
use crate::config::LimitsCfg;
use crate::error::CoreResult;
use crate::ingest::IngestEngine;
use crate::metering::{MeteringEvent, record_committed};
use crate::model::{ChatRequest, ChatResponse, Role};
use crate::store::{PersistReceipt, PersistUnit};
use crate::telemetry::{
    KEY_COMPLETION, KEY_ERROR_MESSAGE, KEY_ERROR_STATUS, KEY_FINISH_REASON, KEY_GEN_AI_SYSTEM,
    KEY_PROMPT, KEY_REQUEST_MODEL, KEY_REQUEST_STREAM, KEY_REQUEST_TEMPERATURE, KEY_RESPONSE_ID,
    KEY_RESPONSE_MODEL, KEY_SERVICE_NAME, KEY_TOKENS_INPUT, KEY_TOKENS_OUTPUT, KEY_TOKENS_TOTAL,
    KEY_TOOL_ARGUMENTS, KEY_TOOL_CALL_ID, KEY_TOOL_NAME, KEY_TOOL_OUTPUT, SpanDraft, SpanKind,
    StatusCode, Vendor, canonicalize_vendor,
};

pub const PROXY_SERVICE_NAME: &str = "toolmeter-proxy";

pub const SPAN_REQUEST: &str = "gen_ai.request";
pub const SPAN_RESPONSE: &str = "gen_ai.response";
pub const SPAN_TOOL_CALL: &str = "gen_ai.tool_call";
pub const SPAN_TOOL_RESULT: &str = "gen_ai.tool_result";

#[derive(Debug, Clone)]
pub enum ExchangeOutcome {
    Completed {
        status: u16,
        response: ChatResponse,
    },
    Failed {
        status: Option<u16>,
        message: String,
        /// What a stream produced before it broke.
        partial: Option<ChatResponse>,
    },
}

#[derive(Debug, Clone)]
pub struct CompletionExchange {
    pub provider: String,
    pub request: ChatRequest,
    pub outcome: ExchangeOutcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl CompletionExchange {
    fn response(&self) -> Option<&ChatResponse> {
        match &self.outcome {
            ExchangeOutcome::Completed { response, .. } => Some(response),
            ExchangeOutcome::Failed { partial, .. } => partial.as_ref(),
        }
    }

    /// `(status, message)` when the exchange should be marked as an error.
    fn failure(&self) -> Option<(Option<u16>, &str)> {
        match &self.outcome {
            ExchangeOutcome::Completed { status, .. } if (200..300).contains(status) => None,
            ExchangeOutcome::Completed { status, .. } => Some((Some(*status), "non-success status")),
            ExchangeOutcome::Failed {
                status, message, ..
            } => Some((*status, message.as_str())),
        }
    }
}

/// Keep at most `max_chars` characters, appending `...[truncated N chars]`
/// with the number of characters removed.
pub fn truncate_with_marker(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        None => s.to_string(),
        Some((cut, _)) => {
            let removed = s[cut..].chars().count();
            format!("{}...[truncated {removed} chars]", &s[..cut])
        }
    }
}

fn new_trace_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

fn new_span_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(16);
    id
}

/// Builds span drafts for an exchange and hands them to the engine.
pub struct SpanSynthesizer {
    limits: LimitsCfg,
}

impl SpanSynthesizer {
    pub fn new(limits: LimitsCfg) -> Self {
        Self { limits }
    }

    pub fn resource_attributes(provider: &str) -> HashMap<String, String> {
        HashMap::from([
            (KEY_SERVICE_NAME.to_string(), PROXY_SERVICE_NAME.to_string()),
            (KEY_GEN_AI_SYSTEM.to_string(), provider.to_string()),
        ])
    }

    /// Pure part: vendor plus span drafts, root first.
    pub fn build(&self, ex: &CompletionExchange) -> (Vendor, Vec<SpanDraft>) {
        let resource = Self::resource_attributes(&ex.provider);
        let vendor = canonicalize_vendor(&resource);
        let trace_id = new_trace_id();
        let root_id = new_span_id();
        let failure = ex.failure();
        let duration_ms = (ex.finished_at - ex.started_at)
            .num_microseconds()
            .map(|us| us as f64 / 1e3);

        // The upstream status lives in its own attribute; the message is kept verbatim.
        let (status_code, status_message) = match failure {
            Some((_, msg)) => (StatusCode::Error, Some(msg.to_string())),
            None => (StatusCode::Ok, None),
        };

        let span = |name: &str, kind: SpanKind, parent: Option<&str>, attributes: HashMap<String, String>| SpanDraft {
            trace_id: trace_id.clone(),
            span_id: if parent.is_none() { root_id.clone() } else { new_span_id() },
            parent_span_id: parent.map(str::to_string),
            name: name.to_string(),
            kind,
            start_time: ex.started_at,
            end_time: Some(ex.finished_at),
            duration_ms,
            status_code,
            status_message: status_message.clone(),
            service_name: Some(PROXY_SERVICE_NAME.to_string()),
            resource_attributes: resource.clone(),
            attributes,
        };

        let mut out = Vec::new();

        let mut attrs = HashMap::new();
        attrs.insert(KEY_GEN_AI_SYSTEM.to_string(), ex.provider.clone());
        attrs.insert(KEY_REQUEST_MODEL.to_string(), ex.request.model.clone());
        attrs.insert(KEY_REQUEST_STREAM.to_string(), ex.request.is_stream().to_string());
        if let Some(t) = ex.request.temperature {
            attrs.insert(KEY_REQUEST_TEMPERATURE.to_string(), t.to_string());
        }
        if let Some(msg) = ex.request.last_user_message() {
            attrs.insert(KEY_PROMPT.to_string(), truncate_with_marker(&msg.text(), self.limits.prompt_chars));
        }
        if let Some((status, msg)) = failure {
            if let Some(code) = status {
                attrs.insert(KEY_ERROR_STATUS.to_string(), code.to_string());
            }
            attrs.insert(KEY_ERROR_MESSAGE.to_string(), msg.to_string());
        }
        out.push(span(SPAN_REQUEST, SpanKind::Client, None, attrs));

        if let Some(resp) = ex.response() {
            let mut attrs = HashMap::new();
            let model = if resp.model.is_empty() { &ex.request.model } else { &resp.model };
            attrs.insert(KEY_RESPONSE_MODEL.to_string(), model.clone());
            if !resp.id.is_empty() {
                attrs.insert(KEY_RESPONSE_ID.to_string(), resp.id.clone());
            }
            if let Some(text) = resp.first_message().map(|m| m.text()).filter(|t| !t.is_empty()) {
                attrs.insert(KEY_COMPLETION.to_string(), truncate_with_marker(&text, self.limits.prompt_chars));
            }
            if let Some(u) = resp.usage {
                attrs.insert(KEY_TOKENS_INPUT.to_string(), u.prompt_tokens.to_string());
                attrs.insert(KEY_TOKENS_OUTPUT.to_string(), u.completion_tokens.to_string());
                attrs.insert(KEY_TOKENS_TOTAL.to_string(), u.total().to_string());
            }
            if let Some(reason) = resp.finish_reason() {
                attrs.insert(KEY_FINISH_REASON.to_string(), reason.to_string());
            }
            out.push(span(SPAN_RESPONSE, SpanKind::Internal, Some(&root_id), attrs));

            for call in resp.tool_calls() {
                let mut attrs = HashMap::new();
                attrs.insert(KEY_TOOL_NAME.to_string(), call.function.name.clone());
                attrs.insert(KEY_TOOL_CALL_ID.to_string(), call.id.clone());
                attrs.insert(
                    KEY_TOOL_ARGUMENTS.to_string(),
                    truncate_with_marker(&call.function.arguments, self.limits.tool_args_chars),
                );
                out.push(span(SPAN_TOOL_CALL, SpanKind::Internal, Some(&root_id), attrs));
            }
        }

        for msg in ex.request.messages.iter().filter(|m| m.role == Role::Tool) {
            let mut attrs = HashMap::new();
            if let Some(id) = &msg.tool_call_id {
                attrs.insert(KEY_TOOL_CALL_ID.to_string(), id.clone());
            }
            attrs.insert(
                KEY_TOOL_OUTPUT.to_string(),
                truncate_with_marker(&msg.text(), self.limits.tool_output_chars),
            );
            out.push(span(SPAN_TOOL_RESULT, SpanKind::Internal, Some(&root_id), attrs));
        }

        (vendor, out)
    }

    /// Persist an exchange through the engine's shared step, then meter it.
    #[tracing::instrument(skip_all, fields(tenant_id = %attribution.tenant_id, provider = %ex.provider))]
    pub async fn record(
        &self,
        engine: &IngestEngine,
        attribution: &Attribution,
        ex: &CompletionExchange,
    ) -> CoreResult<PersistReceipt> {
        let (vendor, spans) = self.build(ex);
        let span_count = spans.len();
        let mut unit = PersistUnit::new(attribution.clone());
        unit.push(vendor, spans);

        let receipt = engine.persist_unit(&unit).await?;

        let tenant = &attribution.tenant_id;
        let customer = engine.metering_customer(tenant).await;
        let volume = MeteringEvent::spans_ingested(tenant, span_count as u64, "proxy")
            .with_customer(customer.clone());
        record_committed(engine.metering(), &volume).await;

        if let Some(customer) = customer {
            for created in receipt.created_profiles() {
                let event = MeteringEvent::tool_profile_created(tenant, &created.vendor_slug, &customer);
                record_committed(engine.metering(), &event).await;
            }
        }
        tracing::debug!(span_count, "exchange recorded");
        Ok(receipt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::metering::MeteringKind;
    use crate::model::{ChatMessage, Choice, FunctionCall, ToolCall, Usage};
    use crate::test_util::{RecordingSink, attribution, seeded_store};

    fn request() -> ChatRequest {
        let mut tool = ChatMessage::new(Role::Tool, "sunny, 21C");
        tool.tool_call_id = Some("call_0".into());
        let mut req = ChatRequest::new(
            "gpt-4o",
            vec![
                ChatMessage::new(Role::System, "be brief"),
                ChatMessage::new(Role::User, "weather?"),
                tool,
            ],
        );
        req.temperature = Some(0.5);
        req
    }

    fn response() -> ChatResponse {
        let mut msg = ChatMessage::new(Role::Assistant, "It is sunny.");
        msg.tool_calls = Some(vec![ToolCall {
            id: "call_1".into(),
            kind: "function".into(),
            function: FunctionCall {
                name: "get_weather".into(),
                arguments: r#"{"city":"Oslo"}"#.into(),
            },
        }]);
        ChatResponse {
            id: "cmpl_1".into(),
            object: "chat.completion".into(),
            created: 0,
            model: "gpt-4o-2024-08-06".into(),
            choices: vec![Choice {
                index: 0,
                message: msg,
                finish_reason: Some("tool_calls".into()),
            }],
            usage: Some(Usage {
                prompt_tokens: 12,
                completion_tokens: 4,
                total_tokens: 16,
            }),
        }
    }

    fn exchange(outcome: ExchangeOutcome) -> CompletionExchange {
        let started_at = Utc::now();
        CompletionExchange {
            provider: "openai".into(),
            request: request(),
            outcome,
            started_at,
            finished_at: started_at + chrono::Duration::milliseconds(1500),
        }
    }

    fn synth() -> SpanSynthesizer {
        SpanSynthesizer::new(LimitsCfg::default())
    }

    #[test]
    fn truncation_marks_removed_chars() {
        assert_eq!(truncate_with_marker("short", 10), "short");
        assert_eq!(truncate_with_marker("abcdef", 6), "abcdef");
        assert_eq!(truncate_with_marker("abcdefgh", 5), "abcde...[truncated 3 chars]");
        assert_eq!(truncate_with_marker("ééééé", 2), "éé...[truncated 3 chars]");
    }

    #[test]
    fn prompt_over_cap_is_marked() {
        let mut ex = exchange(ExchangeOutcome::Failed {
            status: None,
            message: "x".into(),
            partial: None,
        });
        ex.request = ChatRequest::new("gpt-4o", vec![ChatMessage::new(Role::User, &"p".repeat(50_010))]);
        let (_, spans) = synth().build(&ex);
        let prompt = &spans[0].attributes[KEY_PROMPT];
        assert!(prompt.ends_with("...[truncated 10 chars]"));
        assert!(prompt.starts_with(&"p".repeat(50_000)));
    }

    #[test]
    fn completed_exchange_shape() {
        let ex = exchange(ExchangeOutcome::Completed {
            status: 200,
            response: response(),
        });
        let (vendor, spans) = synth().build(&ex);
        assert_eq!(vendor.slug, "openai");

        let names: Vec<_> = spans.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec![SPAN_REQUEST, SPAN_RESPONSE, SPAN_TOOL_CALL, SPAN_TOOL_RESULT]);

        let root = &spans[0];
        assert_eq!(root.kind, SpanKind::Client);
        assert_eq!(root.parent_span_id, None);
        assert_eq!(root.status_code, StatusCode::Ok);
        assert_eq!(root.duration_ms, Some(1500.0));
        assert_eq!(root.attributes[KEY_PROMPT], "weather?");
        assert_eq!(root.attributes[KEY_REQUEST_TEMPERATURE], "0.5");
        assert_eq!(root.attributes[KEY_REQUEST_STREAM], "false");

        for child in &spans[1..] {
            assert_eq!(child.trace_id, root.trace_id);
            assert_eq!(child.parent_span_id.as_deref(), Some(root.span_id.as_str()));
            assert_ne!(child.span_id, root.span_id);
        }
        assert_eq!(spans[1].attributes[KEY_TOKENS_TOTAL], "16");
        assert_eq!(spans[1].attributes[KEY_FINISH_REASON], "tool_calls");
        assert_eq!(spans[2].attributes[KEY_TOOL_NAME], "get_weather");
        assert_eq!(spans[3].attributes[KEY_TOOL_CALL_ID], "call_0");
        assert_eq!(spans[3].attributes[KEY_TOOL_OUTPUT], "sunny, 21C");
        assert_eq!(root.trace_id.len(), 32);
        assert_eq!(root.span_id.len(), 16);
    }

    #[test]
    fn failed_exchange_is_error_without_response_span() {
        let ex = exchange(ExchangeOutcome::Failed {
            status: Some(400),
            message: "model not found".into(),
            partial: None,
        });
        let (_, spans) = synth().build(&ex);
        assert_eq!(spans.len(), 2); // request + tool result
        let root = &spans[0];
        assert_eq!(root.status_code, StatusCode::Error);
        assert_eq!(root.status_message.as_deref(), Some("model not found"));
        assert_eq!(root.attributes[KEY_ERROR_STATUS], "400");
    }

    #[test]
    fn partial_stream_keeps_response_span_marked_error() {
        let ex = exchange(ExchangeOutcome::Failed {
            status: None,
            message: "stream interrupted".into(),
            partial: Some(response()),
        });
        let (_, spans) = synth().build(&ex);
        assert!(spans.iter().any(|s| s.name == SPAN_RESPONSE));
        assert!(spans.iter().all(|s| s.status_code == StatusCode::Error));
    }

    #[tokio::test]
    async fn record_persists_and_meters_new_profile_once() {
        let store = seeded_store().await;
        let sink = Arc::new(RecordingSink::default());
        let engine = IngestEngine::new(store.clone(), store.clone(), sink.clone());
        let ex = exchange(ExchangeOutcome::Completed {
            status: 200,
            response: response(),
        });
        let who = attribution("t_1", "u_1");

        synth().record(&engine, &who, &ex).await.unwrap();
        synth().record(&engine, &who, &ex).await.unwrap();

        let p = store.tool_profile("t_1", "openai").await.unwrap().unwrap();
        assert_eq!(p.total_spans, 8);
        assert_eq!(p.total_traces, 2);

        let events = sink.events();
        let volume: Vec<_> = events.iter().filter(|e| e.kind == MeteringKind::SpansIngested).collect();
        assert_eq!(volume.len(), 2);
        assert_eq!(volume[0].quantity, 4);
        let created: Vec<_> = events
            .iter()
            .filter(|e| e.kind == MeteringKind::ToolProfileCreated)
            .collect();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].idempotency_key, "tool_profile:t_1:openai");
    }

    #[tokio::test]
    async fn no_customer_no_profile_event() {
        let store = seeded_store().await;
        store.put_tenant("t_free", None, None).await.unwrap();
        let sink = Arc::new(RecordingSink::default());
        let engine = IngestEngine::new(store.clone(), store.clone(), sink.clone());
        let ex = exchange(ExchangeOutcome::Completed {
            status: 200,
            response: response(),
        });
        synth().record(&engine, &attribution("t_free", "u_9"), &ex).await.unwrap();
        assert!(sink.events().iter().all(|e| e.kind == MeteringKind::SpansIngested));
    }
}
