//! OTLP trace-batch ingestion.
//!
//! A batch is attributed as a whole before anything is written. Spans are
//! grouped by the vendor their resource canonicalizes to, persisted as one
//! unit, and only then metered.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;

use crate::attribution::{Attribution, AttributionResolver, Directory, RequestIdentity};
use crate::error::CoreResult;
use crate::metering::{MeteringEvent, MeteringSink, record_committed};
use crate::store::{PersistReceipt, PersistUnit, SpanStore};
use crate::telemetry::{
    KEY_SERVICE_NAME, RawSpan, SpanDraft, SpanKind, StatusCode, TraceBatch, canonicalize_vendor,
    flatten_attributes,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct IngestOutcome {
    pub accepted_spans: usize,
    pub rejected_spans: usize,
}

pub struct IngestEngine {
    resolver: AttributionResolver,
    store: Arc<dyn SpanStore>,
    metering: Arc<dyn MeteringSink>,
}

impl IngestEngine {
    pub fn new(
        directory: Arc<dyn Directory>,
        store: Arc<dyn SpanStore>,
        metering: Arc<dyn MeteringSink>,
    ) -> Self {
        Self {
            resolver: AttributionResolver::new(directory),
            store,
            metering,
        }
    }

    pub fn resolver(&self) -> &AttributionResolver {
        &self.resolver
    }

    pub fn metering(&self) -> &dyn MeteringSink {
        self.metering.as_ref()
    }

    /// Attribute, persist and meter one pushed batch.
    #[tracing::instrument(skip_all, fields(spans = batch.span_count()))]
    pub async fn ingest(
        &self,
        batch: &TraceBatch,
        identity: &RequestIdentity,
    ) -> CoreResult<IngestOutcome> {
        if batch.span_count() == 0 {
            return Ok(IngestOutcome::default());
        }
        let attribution = self.resolver.resolve_batch(batch, identity).await?;
        self.ingest_attributed(batch, &attribution).await
    }

    #[tracing::instrument(skip_all, fields(tenant_id = %attribution.tenant_id))]
    pub async fn ingest_attributed(
        &self,
        batch: &TraceBatch,
        attribution: &Attribution,
    ) -> CoreResult<IngestOutcome> {
        let (unit, rejected_spans) = build_unit(batch, attribution);
        let accepted_spans = unit.span_count();
        if accepted_spans == 0 {
            if rejected_spans > 0 {
                tracing::info!(rejected_spans, "batch had no acceptable spans");
            }
            return Ok(IngestOutcome {
                accepted_spans,
                rejected_spans,
            });
        }

        self.persist_unit(&unit).await?;

        let event = MeteringEvent::spans_ingested(&attribution.tenant_id, accepted_spans as u64, "otlp")
            .with_customer(self.metering_customer(&attribution.tenant_id).await);
        record_committed(self.metering.as_ref(), &event).await;

        tracing::info!(accepted_spans, rejected_spans, "batch ingested");
        Ok(IngestOutcome {
            accepted_spans,
            rejected_spans,
        })
    }

    /// The single persistence step shared by OTLP ingestion and the proxy.
    pub async fn persist_unit(&self, unit: &PersistUnit) -> CoreResult<PersistReceipt> {
        self.store.persist(unit).await.inspect_err(|e| {
            tracing::error!(
                tenant_id = %unit.attribution.tenant_id,
                spans = unit.span_count(),
                error = %e,
                "persist failed; unit dropped"
            );
        })
    }

    /// Billing customer for a tenant. Lookup failures degrade to `None`.
    pub async fn metering_customer(&self, tenant_id: &str) -> Option<String> {
        self.resolver
            .directory()
            .metering_customer(tenant_id)
            .await
            .unwrap_or_else(|e| {
                tracing::warn!(tenant_id, error = %e, "metering customer lookup failed");
                None
            })
    }
}

/// Group a batch into vendor buckets. Returns the unit and the number of
/// rejected spans.
pub fn build_unit(batch: &TraceBatch, attribution: &Attribution) -> (PersistUnit, usize) {
    let mut unit = PersistUnit::new(attribution.clone());
    let mut seen: HashSet<(String, String)> = HashSet::new();
    let mut rejected = 0;

    for group in &batch.resource_spans {
        let resource = flatten_attributes(group.attributes());
        let vendor = canonicalize_vendor(&resource);
        let service_name = resource
            .get(KEY_SERVICE_NAME)
            .filter(|s| !s.trim().is_empty())
            .cloned();

        let mut drafts = Vec::with_capacity(group.span_count());
        for raw in group.spans() {
            let key = (raw.trace_id.to_ascii_lowercase(), raw.span_id.to_ascii_lowercase());
            if !seen.insert(key) {
                tracing::debug!(trace_id = %raw.trace_id, span_id = %raw.span_id, "duplicate span in batch");
                rejected += 1;
                continue;
            }
            match draft_from_raw(raw, &resource, service_name.as_deref()) {
                Some(d) => drafts.push(d),
                None => rejected += 1,
            }
        }
        unit.push(vendor, drafts);
    }
    (unit, rejected)
}

fn is_hex_id(id: &str) -> bool {
    !id.is_empty() && id.bytes().all(|b| b.is_ascii_hexdigit())
}

fn non_empty(s: Option<&String>) -> Option<String> {
    s.map(|v| v.trim()).filter(|v| !v.is_empty()).map(str::to_string)
}

/// `None` when the span cannot be stored: bad ids or no start time.
fn draft_from_raw(
    raw: &RawSpan,
    resource: &HashMap<String, String>,
    service_name: Option<&str>,
) -> Option<SpanDraft> {
    if !is_hex_id(&raw.trace_id) || !is_hex_id(&raw.span_id) {
        tracing::debug!(trace_id = %raw.trace_id, span_id = %raw.span_id, "span rejected: invalid id");
        return None;
    }
    let Some(start_ns) = raw.start_time_unix_nano else {
        tracing::debug!(span_id = %raw.span_id, "span rejected: no start time");
        return None;
    };
    let (start_time, end_time, duration_ms) = SpanDraft::timing(start_ns, raw.end_time_unix_nano);
    let status = raw.status.as_ref();

    Some(SpanDraft {
        trace_id: raw.trace_id.to_ascii_lowercase(),
        span_id: raw.span_id.to_ascii_lowercase(),
        parent_span_id: non_empty(raw.parent_span_id.as_ref()),
        name: raw.name.clone(),
        kind: SpanKind::from_otlp(raw.kind),
        start_time,
        end_time,
        duration_ms,
        status_code: status.map_or(StatusCode::Unset, |s| StatusCode::from_otlp(s.code)),
        status_message: non_empty(status.and_then(|s| s.message.as_ref())),
        service_name: service_name.map(str::to_string),
        resource_attributes: resource.clone(),
        attributes: flatten_attributes(&raw.attributes),
    })
}
