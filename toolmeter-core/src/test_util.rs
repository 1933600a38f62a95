//! Shared fixtures for unit tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};

use crate::attribution::{Attribution, Directory};
use crate::config::{
    Config, HttpCfg, LimitsCfg, MeteringCfg, ProviderCfg, RoutingCfg, RoutingRule, StorageCfg,
};
use crate::error::{CoreResult, MeterError};
use crate::metering::{MeteringEvent, MeteringSink};
use crate::store::{PersistReceipt, PersistUnit, SpanStore, SqliteStore};
use crate::telemetry::otlp::{Resource, ScopeSpans};
use crate::telemetry::{
    KeyValue, RawSpan, ResourceGroup, SpanDraft, SpanKind, StatusCode, TraceBatch,
};

/// In-memory [`Directory`] built up with chained `with_*` calls.
#[derive(Default)]
pub struct MemoryDirectory {
    users: HashMap<String, Option<String>>,
    owners: HashMap<String, String>,
    teams: HashSet<(String, String, String)>,
}

impl MemoryDirectory {
    pub fn with_user(mut self, user: &str, tenant: Option<&str>) -> Self {
        self.users
            .insert(user.to_string(), tenant.map(str::to_string));
        self
    }

    pub fn with_owner(mut self, tenant: &str, user: &str) -> Self {
        self.owners.insert(user.to_string(), tenant.to_string());
        self
    }

    pub fn with_team(mut self, tenant: &str, team: &str, user: &str) -> Self {
        self.teams
            .insert((tenant.to_string(), team.to_string(), user.to_string()));
        self
    }
}

#[async_trait]
impl Directory for MemoryDirectory {
    async fn tenant_of_user(&self, user_id: &str) -> CoreResult<Option<String>> {
        Ok(self.users.get(user_id).cloned().flatten())
    }

    async fn tenant_owned_by(&self, user_id: &str) -> CoreResult<Option<String>> {
        Ok(self.owners.get(user_id).cloned())
    }

    async fn is_team_member(&self, tenant_id: &str, team_id: &str, user_id: &str) -> CoreResult<bool> {
        Ok(self.teams.contains(&(
            tenant_id.to_string(),
            team_id.to_string(),
            user_id.to_string(),
        )))
    }

    async fn teams_of_user(&self, tenant_id: &str, user_id: &str) -> CoreResult<Vec<String>> {
        let mut teams: Vec<String> = self
            .teams
            .iter()
            .filter(|(t, _, u)| t == tenant_id && u == user_id)
            .map(|(_, team, _)| team.clone())
            .collect();
        teams.sort();
        Ok(teams)
    }

    async fn metering_customer(&self, _tenant_id: &str) -> CoreResult<Option<String>> {
        Ok(None)
    }
}

fn kvs(pairs: &[(&str, &str)]) -> Vec<KeyValue> {
    pairs.iter().map(|(k, v)| KeyValue::string(k, v)).collect()
}

/// One resource group with `n_spans` spans, each carrying `span_attrs`.
pub fn batch_with(
    resource_attrs: &[(&str, &str)],
    span_attrs: &[(&str, &str)],
    n_spans: usize,
) -> TraceBatch {
    let spans = (0..n_spans)
        .map(|i| RawSpan {
            trace_id: "0af7651916cd43dd8448eb211c80319c".into(),
            span_id: format!("{:016x}", i + 1),
            name: "llm.call".into(),
            kind: 3,
            start_time_unix_nano: Some(1_700_000_000_000_000_000),
            attributes: kvs(span_attrs),
            ..RawSpan::default()
        })
        .collect();
    TraceBatch {
        resource_spans: vec![ResourceGroup {
            resource: Some(Resource {
                attributes: kvs(resource_attrs),
            }),
            scope_spans: vec![ScopeSpans { scope: None, spans }],
        }],
    }
}

pub fn attribution(tenant: &str, user: &str) -> Attribution {
    Attribution {
        tenant_id: tenant.to_string(),
        user_id: Some(user.to_string()),
        team_id: None,
    }
}

pub fn draft(trace: &str, span: &str) -> SpanDraft {
    SpanDraft {
        trace_id: trace.to_string(),
        span_id: span.to_string(),
        parent_span_id: None,
        name: "llm.call".into(),
        kind: SpanKind::Client,
        start_time: Utc.timestamp_millis_opt(1_700_000_000_000).unwrap(),
        end_time: None,
        duration_ms: None,
        status_code: StatusCode::Ok,
        status_message: None,
        service_name: None,
        resource_attributes: HashMap::new(),
        attributes: HashMap::new(),
    }
}

/// An `openai` upstream plus the given routing.
pub fn config_with(default: &str, rules: &[(&str, &str)]) -> Config {
    let mut providers = BTreeMap::new();
    providers.insert(
        "openai".to_string(),
        ProviderCfg {
            base_url: "https://api.openai.com/v1".into(),
            api_key_env: "OPENAI_API_KEY".into(),
        },
    );
    Config {
        providers,
        routing: RoutingCfg {
            default: default.to_string(),
            rules: rules
                .iter()
                .map(|(model, provider)| RoutingRule {
                    model: model.to_string(),
                    provider: provider.to_string(),
                })
                .collect(),
        },
        http: HttpCfg::default(),
        storage: StorageCfg::default(),
        metering: MeteringCfg::default(),
        limits: LimitsCfg::default(),
    }
}

/// In-memory store with tenant `t_1` (owner `owner`, customer `cus_1`)
/// and member `u_1`.
pub async fn seeded_store() -> Arc<SqliteStore> {
    let store = SqliteStore::in_memory().await.unwrap();
    store
        .put_tenant("t_1", Some("owner"), Some("cus_1"))
        .await
        .unwrap();
    store.put_user("u_1", Some("t_1")).await.unwrap();
    Arc::new(store)
}

/// Keeps every event; `failing()` rejects them all instead.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<MeteringEvent>>,
    fail: bool,
}

impl RecordingSink {
    pub fn failing() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn events(&self) -> Vec<MeteringEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl MeteringSink for RecordingSink {
    async fn record(&self, event: &MeteringEvent) -> CoreResult<()> {
        if self.fail {
            return Err(MeterError::Metering("sink down".into()));
        }
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

/// Store that never commits and a directory that knows nobody.
pub struct FailingStore;

#[async_trait]
impl SpanStore for FailingStore {
    async fn persist(&self, _unit: &PersistUnit) -> CoreResult<PersistReceipt> {
        Err(MeterError::Storage(sqlx::Error::PoolTimedOut))
    }
}

#[async_trait]
impl Directory for FailingStore {
    async fn tenant_of_user(&self, _user_id: &str) -> CoreResult<Option<String>> {
        Ok(None)
    }

    async fn tenant_owned_by(&self, _user_id: &str) -> CoreResult<Option<String>> {
        Ok(None)
    }

    async fn is_team_member(&self, _tenant_id: &str, _team_id: &str, _user_id: &str) -> CoreResult<bool> {
        Ok(false)
    }

    async fn teams_of_user(&self, _tenant_id: &str, _user_id: &str) -> CoreResult<Vec<String>> {
        Ok(Vec::new())
    }

    async fn metering_customer(&self, _tenant_id: &str) -> CoreResult<Option<String>> {
        Ok(None)
    }
}
