/// Span/resource attribute keys read or written by the pipeline.
/// Keep these stable; changing them is a breaking change for stored spans.
pub const KEY_SERVICE_NAME: &str = "service.name";
pub const KEY_CLOUD_PROVIDER: &str = "cloud.provider";
pub const KEY_CLOUD_PLATFORM: &str = "cloud.platform";
pub const KEY_FAAS_NAME: &str = "faas.name";
pub const KEY_MCP_SERVER: &str = "mcp.server.name";

pub const KEY_GEN_AI_SYSTEM: &str = "gen_ai.system";
pub const KEY_GEN_AI_PROVIDER: &str = "gen_ai.provider.name";
pub const KEY_REQUEST_MODEL: &str = "gen_ai.request.model";
pub const KEY_REQUEST_TEMPERATURE: &str = "gen_ai.request.temperature";
pub const KEY_REQUEST_STREAM: &str = "gen_ai.request.stream";
pub const KEY_PROMPT: &str = "gen_ai.prompt";
pub const KEY_RESPONSE_MODEL: &str = "gen_ai.response.model";
pub const KEY_RESPONSE_ID: &str = "gen_ai.response.id";
pub const KEY_COMPLETION: &str = "gen_ai.completion";
pub const KEY_FINISH_REASON: &str = "gen_ai.response.finish_reason";
pub const KEY_TOKENS_INPUT: &str = "gen_ai.usage.input_tokens";
pub const KEY_TOKENS_OUTPUT: &str = "gen_ai.usage.output_tokens";
pub const KEY_TOKENS_TOTAL: &str = "gen_ai.usage.total_tokens";
pub const KEY_TOOL_NAME: &str = "gen_ai.tool.name";
pub const KEY_TOOL_CALL_ID: &str = "gen_ai.tool.call.id";
pub const KEY_TOOL_ARGUMENTS: &str = "gen_ai.tool.arguments";
pub const KEY_TOOL_OUTPUT: &str = "gen_ai.tool.output";

/// Error-related (if applicable)
pub const KEY_ERROR_STATUS: &str = "error.http_status";
pub const KEY_ERROR_MESSAGE: &str = "error.message";

/// User identity aliases, checked in order. Root-level keys win over
/// `trace.metadata.*` keys set by tracing SDKs that nest caller metadata.
pub const USER_ID_KEYS: &[&str] = &[
    "user.id",
    "user_id",
    "enduser.id",
    "userId",
    "trace.metadata.user_id",
    "trace.metadata.userId",
    "trace.metadata.user.id",
];

/// Team identity aliases, checked in order.
pub const TEAM_ID_KEYS: &[&str] = &[
    "team.id",
    "team_id",
    "teamId",
    "trace.metadata.team_id",
    "trace.metadata.teamId",
    "trace.metadata.team.id",
];
