//! Usage metering for billing.
//!
//! Events are only built from committed work. Every event carries an
//! idempotency key so the sink can de-duplicate retries.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use serde_json::json;

use crate::config::MeteringCfg;
use crate::error::{CoreResult, MeterError};
use crate::http_client::{HttpClient, RequestCtx};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MeteringKind {
    SpansIngested,
    ToolProfileCreated,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MeteringEvent {
    pub tenant_id: String,
    pub kind: MeteringKind,
    pub quantity: u64,
    pub idempotency_key: String,
    /// Billing customer for the tenant, when one is configured.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<String>,
    pub metadata: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
}

impl MeteringEvent {
    /// Span volume. Each event is distinct, so the key is random.
    pub fn spans_ingested(tenant_id: &str, quantity: u64, source: &str) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            kind: MeteringKind::SpansIngested,
            quantity,
            idempotency_key: format!("spans:{}", uuid::Uuid::new_v4()),
            customer_id: None,
            metadata: json!({ "source": source }),
            occurred_at: Utc::now(),
        }
    }

    /// One-shot per `(tenant, vendor)`; the key is deterministic so a
    /// replay can never bill twice.
    pub fn tool_profile_created(tenant_id: &str, vendor_slug: &str, customer_id: &str) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            kind: MeteringKind::ToolProfileCreated,
            quantity: 1,
            idempotency_key: format!("tool_profile:{tenant_id}:{vendor_slug}"),
            customer_id: Some(customer_id.to_string()),
            metadata: json!({ "vendor_slug": vendor_slug }),
            occurred_at: Utc::now(),
        }
    }

    pub fn with_customer(mut self, customer_id: Option<String>) -> Self {
        self.customer_id = customer_id;
        self
    }
}

#[async_trait]
pub trait MeteringSink: Send + Sync {
    async fn record(&self, event: &MeteringEvent) -> CoreResult<()>;
}

/// Record after a durable commit. Failures are logged, never propagated:
/// the data is already stored and the caller must not see an error for it.
pub async fn record_committed(sink: &dyn MeteringSink, event: &MeteringEvent) -> bool {
    match sink.record(event).await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(
                tenant_id = %event.tenant_id,
                kind = ?event.kind,
                idempotency_key = %event.idempotency_key,
                error = %e,
                "metering event not recorded"
            );
            false
        }
    }
}

/// Used when no billing endpoint is configured.
pub struct NoopMeteringSink;

#[async_trait]
impl MeteringSink for NoopMeteringSink {
    async fn record(&self, event: &MeteringEvent) -> CoreResult<()> {
        tracing::trace!(kind = ?event.kind, quantity = event.quantity, "metering disabled; event dropped");
        Ok(())
    }
}

/// POSTs each event as JSON with an `Idempotency-Key` header.
pub struct HttpMeteringSink {
    http: HttpClient,
    endpoint: String,
    api_key: Option<SecretString>,
}

impl HttpMeteringSink {
    pub fn new(http: HttpClient, endpoint: &str, api_key: Option<SecretString>) -> Self {
        Self {
            http,
            endpoint: endpoint.to_string(),
            api_key,
        }
    }
}

#[async_trait]
impl MeteringSink for HttpMeteringSink {
    async fn record(&self, event: &MeteringEvent) -> CoreResult<()> {
        let auth = self
            .api_key
            .as_ref()
            .map(|k| format!("Bearer {}", k.expose_secret()));
        let headers: Vec<(&str, &str)> = auth
            .as_deref()
            .map(|a| vec![("Authorization", a)])
            .unwrap_or_default();
        let ctx = RequestCtx {
            provider: Some("metering"),
            idempotency_key: Some(&event.idempotency_key),
            ..RequestCtx::default()
        };
        self.http
            .post_json_ack(&self.endpoint, event, &headers, &ctx)
            .await
            .map_err(|e| MeterError::Metering(e.to_string()))?;
        Ok(())
    }
}

/// Pick the sink for a config: HTTP when an endpoint is set, else no-op.
pub fn sink_from_config<F>(
    cfg: &MeteringCfg,
    http: HttpClient,
    lookup: F,
) -> Arc<dyn MeteringSink>
where
    F: Fn(&str) -> Option<String>,
{
    match &cfg.endpoint {
        Some(endpoint) => {
            let key = cfg
                .api_key_env
                .as_deref()
                .and_then(&lookup)
                .map(SecretString::from);
            Arc::new(HttpMeteringSink::new(http, endpoint, key))
        }
        None => Arc::new(NoopMeteringSink),
    }
}
