//! Reconstruction of a streamed chat completion.
//!
//! Contract:
//! - Input is the SSE line stream of an OpenAI-compatible `stream: true` call.
//! - Only `data:` lines carry frames; `[DONE]`, comments and other SSE fields are ignored.
//! - A frame that fails to parse is skipped; accumulation continues with the next one.
//! - Tool-call fragments are routed to a slot by `index` (or by arrival order
//!   when the index is absent); `name` and `arguments` are concatenated.
//! - `usage` replaces any previously seen usage.

use crate::model::{ChatMessage, ChatResponse, Choice, FunctionCall, MessageContent, Role, ToolCall, Usage};
use serde::Deserialize;

const DONE_SENTINEL: &str = "[DONE]";

/// Upper bound on tool-call slot indices; bigger indices are dropped.
const MAX_TOOL_CALL_SLOTS: usize = 256;

/// What happened to one SSE line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Applied,
    Ignored,
    Done,
    Malformed,
}

#[derive(Debug, Clone, Default, PartialEq)]
struct ToolCallSlot {
    id: String,
    name: String,
    arguments: String,
}

/// Stateful accumulator for one streamed exchange.
#[derive(Debug, Default)]
pub struct DeltaAccumulator {
    id: Option<String>,
    model: Option<String>,
    created: Option<i64>,
    content: String,
    tool_calls: Vec<Option<ToolCallSlot>>,
    usage: Option<Usage>,
    finish_reason: Option<String>,
    skipped: usize,
    done: bool,
}

// ---- Wire structs for chunk frames (lenient) ----
#[derive(Deserialize)]
struct ChunkFrame {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    created: Option<i64>,
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: Option<ChunkDelta>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ToolCallFragment>,
}

#[derive(Deserialize)]
struct ToolCallFragment {
    #[serde(default)]
    index: Option<usize>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<FunctionFragment>,
}

#[derive(Deserialize)]
struct FunctionFragment {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

impl DeltaAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one raw SSE line (without its trailing newline).
    pub fn push_line(&mut self, line: &str) -> FrameOutcome {
        let Some(payload) = line.strip_prefix("data:") else {
            return FrameOutcome::Ignored;
        };
        let payload = payload.trim();
        if payload.is_empty() {
            return FrameOutcome::Ignored;
        }
        if payload == DONE_SENTINEL {
            self.done = true;
            return FrameOutcome::Done;
        }
        match serde_json::from_str::<ChunkFrame>(payload) {
            Ok(frame) => {
                self.apply(frame);
                FrameOutcome::Applied
            }
            Err(e) => {
                self.skipped += 1;
                tracing::debug!(error = %e, "skipping malformed SSE frame");
                FrameOutcome::Malformed
            }
        }
    }

    fn apply(&mut self, frame: ChunkFrame) {
        if self.id.is_none() {
            self.id = frame.id.filter(|s| !s.is_empty());
        }
        if self.model.is_none() {
            self.model = frame.model.filter(|s| !s.is_empty());
        }
        if self.created.is_none() {
            self.created = frame.created;
        }
        if let Some(usage) = frame.usage {
            self.usage = Some(usage);
        }
        for choice in frame.choices {
            if let Some(reason) = choice.finish_reason {
                self.finish_reason = Some(reason);
            }
            let Some(delta) = choice.delta else { continue };
            if let Some(text) = delta.content {
                self.content.push_str(&text);
            }
            for fragment in delta.tool_calls {
                self.apply_tool_fragment(fragment);
            }
        }
    }

    fn apply_tool_fragment(&mut self, fragment: ToolCallFragment) {
        let index = fragment.index.unwrap_or(self.tool_calls.len());
        if index >= MAX_TOOL_CALL_SLOTS {
            tracing::debug!(index, "dropping tool-call fragment with out-of-range index");
            return;
        }
        if self.tool_calls.len() <= index {
            self.tool_calls.resize(index + 1, None);
        }
        let slot = self.tool_calls[index].get_or_insert_with(ToolCallSlot::default);
        if let Some(id) = fragment.id
            && slot.id.is_empty()
        {
            slot.id = id;
        }
        if let Some(f) = fragment.function {
            if let Some(name) = f.name {
                slot.name.push_str(&name);
            }
            if let Some(args) = f.arguments {
                slot.arguments.push_str(&args);
            }
        }
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn usage(&self) -> Option<Usage> {
        self.usage
    }

    pub fn saw_done(&self) -> bool {
        self.done
    }

    pub fn skipped_frames(&self) -> usize {
        self.skipped
    }

    /// True once any frame contributed content, tool calls or usage.
    pub fn has_output(&self) -> bool {
        !self.content.is_empty() || self.tool_calls.iter().any(Option::is_some) || self.usage.is_some()
    }

    /// Freeze into a non-streaming response. Empty tool-call slots (index
    /// holes) are dropped; the rest keep ascending index order.
    pub fn finish(self, fallback_model: &str) -> ChatResponse {
        let tool_calls: Vec<ToolCall> = self
            .tool_calls
            .into_iter()
            .flatten()
            .map(|slot| ToolCall {
                id: slot.id,
                kind: "function".into(),
                function: FunctionCall {
                    name: slot.name,
                    arguments: slot.arguments,
                },
            })
            .collect();

        let message = ChatMessage {
            role: Role::Assistant,
            content: (!self.content.is_empty()).then(|| MessageContent::Text(self.content)),
            name: None,
            tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
            tool_call_id: None,
        };

        ChatResponse {
            id: self.id.unwrap_or_default(),
            object: "chat.completion".into(),
            created: self.created.unwrap_or_default(),
            model: self.model.unwrap_or_else(|| fallback_model.to_string()),
            choices: vec![Choice {
                index: 0,
                message,
                finish_reason: self.finish_reason,
            }],
            usage: self.usage,
        }
    }
}
