//! OTLP/JSON trace wire model.
//!
//! Only the subset consumed by ingestion is modelled. Decoding is lenient at
//! the attribute level: a malformed attribute entry degrades to "no value"
//! instead of failing the whole batch.

use serde::{Deserialize, Deserializer};
use serde_json::Value;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceBatch {
    #[serde(default)]
    pub resource_spans: Vec<ResourceGroup>,
}

impl TraceBatch {
    pub fn span_count(&self) -> usize {
        self.resource_spans.iter().map(ResourceGroup::span_count).sum()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceGroup {
    #[serde(default)]
    pub resource: Option<Resource>,
    #[serde(default)]
    pub scope_spans: Vec<ScopeSpans>,
}

impl ResourceGroup {
    pub fn attributes(&self) -> &[KeyValue] {
        self.resource
            .as_ref()
            .map(|r| r.attributes.as_slice())
            .unwrap_or(&[])
    }

    pub fn spans(&self) -> impl Iterator<Item = &RawSpan> {
        self.scope_spans.iter().flat_map(|s| s.spans.iter())
    }

    pub fn span_count(&self) -> usize {
        self.scope_spans.iter().map(|s| s.spans.len()).sum()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Resource {
    #[serde(default, deserialize_with = "lenient_attributes")]
    pub attributes: Vec<KeyValue>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScopeSpans {
    #[serde(default)]
    pub scope: Option<Value>,
    #[serde(default)]
    pub spans: Vec<RawSpan>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawSpan {
    #[serde(default)]
    pub trace_id: String,
    #[serde(default)]
    pub span_id: String,
    #[serde(default)]
    pub parent_span_id: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default, deserialize_with = "lenient_enum")]
    pub kind: i64,
    #[serde(default, deserialize_with = "lenient_nanos")]
    pub start_time_unix_nano: Option<u64>,
    #[serde(default, deserialize_with = "lenient_nanos")]
    pub end_time_unix_nano: Option<u64>,
    #[serde(default)]
    pub status: Option<RawStatus>,
    #[serde(default, deserialize_with = "lenient_attributes")]
    pub attributes: Vec<KeyValue>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawStatus {
    #[serde(default, deserialize_with = "lenient_enum")]
    pub code: i64,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct KeyValue {
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub value: Option<AnyValue>,
}

/// OTLP `AnyValue`; each member is kept raw so the flattener decides what is usable.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnyValue {
    #[serde(default)]
    pub string_value: Option<Value>,
    #[serde(default)]
    pub int_value: Option<Value>,
    #[serde(default)]
    pub bool_value: Option<Value>,
    #[serde(default)]
    pub double_value: Option<Value>,
    #[serde(default)]
    pub array_value: Option<Value>,
}

impl KeyValue {
    pub fn string(key: &str, value: &str) -> Self {
        Self {
            key: key.to_string(),
            value: Some(AnyValue {
                string_value: Some(Value::String(value.to_string())),
                ..Default::default()
            }),
        }
    }
}

fn lenient_attributes<'de, D>(de: D) -> Result<Vec<KeyValue>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(de)?;
    let Some(Value::Array(items)) = raw else {
        return Ok(Vec::new());
    };
    Ok(items
        .into_iter()
        .filter_map(|v| serde_json::from_value::<KeyValue>(v).ok())
        .collect())
}

/// Nanosecond timestamps arrive as decimal strings (OTLP/JSON int64 rule) or numbers.
fn lenient_nanos<'de, D>(de: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(de)?;
    Ok(match raw {
        Some(Value::String(s)) => s.trim().parse::<u64>().ok().filter(|n| *n > 0),
        Some(Value::Number(n)) => n.as_u64().filter(|n| *n > 0),
        _ => None,
    })
}

/// Enum fields may be numeric or the proto enum name (`SPAN_KIND_CLIENT`, `STATUS_CODE_ERROR`).
fn lenient_enum<'de, D>(de: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(de)?;
    Ok(match raw {
        Some(Value::Number(n)) => n.as_i64().unwrap_or(0),
        Some(Value::String(s)) => enum_name_to_number(&s),
        _ => 0,
    })
}

fn enum_name_to_number(name: &str) -> i64 {
    match name {
        "SPAN_KIND_INTERNAL" | "STATUS_CODE_OK" => 1,
        "SPAN_KIND_SERVER" | "STATUS_CODE_ERROR" => 2,
        "SPAN_KIND_CLIENT" => 3,
        "SPAN_KIND_PRODUCER" => 4,
        "SPAN_KIND_CONSUMER" => 5,
        other => other.parse::<i64>().unwrap_or(0),
    }
}
