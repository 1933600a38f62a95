use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// OTLP span kind, persisted by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SpanKind {
    Unspecified,
    Internal,
    Server,
    Client,
    Producer,
    Consumer,
}

/// Indexed by the OTLP numeric kind.
const SPAN_KINDS: [SpanKind; 6] = [
    SpanKind::Unspecified,
    SpanKind::Internal,
    SpanKind::Server,
    SpanKind::Client,
    SpanKind::Producer,
    SpanKind::Consumer,
];

impl SpanKind {
    /// Out-of-range values map to `Unspecified`.
    pub fn from_otlp(kind: i64) -> Self {
        usize::try_from(kind)
            .ok()
            .and_then(|i| SPAN_KINDS.get(i).copied())
            .unwrap_or(SpanKind::Unspecified)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unspecified => "UNSPECIFIED",
            Self::Internal => "INTERNAL",
            Self::Server => "SERVER",
            Self::Client => "CLIENT",
            Self::Producer => "PRODUCER",
            Self::Consumer => "CONSUMER",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StatusCode {
    Unset,
    Ok,
    Error,
}

impl StatusCode {
    pub fn from_otlp(code: i64) -> Self {
        match code {
            1 => Self::Ok,
            2 => Self::Error,
            _ => Self::Unset,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unset => "UNSET",
            Self::Ok => "OK",
            Self::Error => "ERROR",
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error)
    }
}

pub const SIGNAL_TRACE: &str = "trace";

/// A span row ready for persistence, minus the tool-profile id which the
/// store assigns once the profile upsert resolves.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpanDraft {
    pub trace_id: String,
    pub span_id: String,
    pub parent_span_id: Option<String>,
    pub name: String,
    pub kind: SpanKind,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_ms: Option<f64>,
    pub status_code: StatusCode,
    pub status_message: Option<String>,
    pub service_name: Option<String>,
    pub resource_attributes: HashMap<String, String>,
    pub attributes: HashMap<String, String>,
}

impl SpanDraft {
    pub fn timing(start_ns: u64, end_ns: Option<u64>) -> (DateTime<Utc>, Option<DateTime<Utc>>, Option<f64>) {
        let start = nanos_to_datetime(start_ns);
        let end = end_ns.map(nanos_to_datetime);
        // Epoch nanos exceed f64's exact range; take the difference first.
        let duration_ms = end_ns.map(|end| (i128::from(end) - i128::from(start_ns)) as f64 / 1e6);
        (start, end, duration_ms)
    }
}

pub fn nanos_to_datetime(ns: u64) -> DateTime<Utc> {
    DateTime::from_timestamp_nanos(i64::try_from(ns).unwrap_or(i64::MAX))
}

/// Persisted span row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Span {
    pub tenant_id: String,
    pub user_id: Option<String>,
    pub team_id: Option<String>,
    pub tool_profile_id: i64,
    pub vendor_slug: String,
    pub signal_type: String,
    #[serde(flatten)]
    pub draft: SpanDraft,
}

/// Per-tenant, per-vendor rollup counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolProfile {
    pub id: i64,
    pub tenant_id: String,
    pub vendor_slug: String,
    pub display_name: String,
    pub category: String,
    pub total_spans: i64,
    pub total_traces: i64,
    pub total_errors: i64,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_lookup_table() {
        assert_eq!(SpanKind::from_otlp(0), SpanKind::Unspecified);
        assert_eq!(SpanKind::from_otlp(3), SpanKind::Client);
        assert_eq!(SpanKind::from_otlp(5), SpanKind::Consumer);
        assert_eq!(SpanKind::from_otlp(6), SpanKind::Unspecified);
        assert_eq!(SpanKind::from_otlp(-1), SpanKind::Unspecified);
    }

    #[test]
    fn duration_is_none_without_end() {
        let (_, end, dur) = SpanDraft::timing(1_000_000_000, None);
        assert!(end.is_none());
        assert_eq!(dur, None);

        let (_, _, dur) = SpanDraft::timing(1_000_000_000, Some(1_002_500_000));
        assert_eq!(dur, Some(2.5));
    }

    #[test]
    fn duration_keeps_precision_at_epoch_scale() {
        let start = 1_700_000_000_000_000_000;
        let (_, _, dur) = SpanDraft::timing(start, Some(start + 250_000_000));
        assert_eq!(dur, Some(250.0));

        let (_, _, dur) = SpanDraft::timing(start, Some(start + 1_234_567));
        assert_eq!(dur, Some(1.234567));

        // End before start gives a negative duration rather than wrapping.
        let (_, _, dur) = SpanDraft::timing(start, Some(start - 1_000_000));
        assert_eq!(dur, Some(-1.0));
    }

    #[test]
    fn status_codes() {
        assert_eq!(StatusCode::from_otlp(2), StatusCode::Error);
        assert_eq!(StatusCode::from_otlp(1).as_str(), "OK");
        assert_eq!(StatusCode::from_otlp(9), StatusCode::Unset);
    }
}
