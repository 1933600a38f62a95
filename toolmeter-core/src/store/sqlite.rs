use std::collections::HashMap;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};

use super::{PersistReceipt, PersistUnit, ProfileReceipt, SpanStore};
use crate::attribution::Directory;
use crate::config::StorageCfg;
use crate::error::{CoreResult, MeterError};
use crate::telemetry::{SIGNAL_TRACE, Span, SpanDraft, ToolProfile};

/// Rows per bulk INSERT. 20 columns per row keeps each statement well under
/// SQLite's bound-parameter limit.
const SPAN_CHUNK: usize = 500;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS tenants (
        id TEXT PRIMARY KEY,
        owner_user_id TEXT,
        metering_customer_id TEXT
    )",
    "CREATE INDEX IF NOT EXISTS idx_tenants_owner ON tenants(owner_user_id)",
    "CREATE TABLE IF NOT EXISTS users (
        id TEXT PRIMARY KEY,
        tenant_id TEXT REFERENCES tenants(id)
    )",
    "CREATE TABLE IF NOT EXISTS team_members (
        tenant_id TEXT NOT NULL,
        team_id TEXT NOT NULL,
        user_id TEXT NOT NULL,
        PRIMARY KEY (tenant_id, team_id, user_id)
    )",
    "CREATE TABLE IF NOT EXISTS tool_profiles (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        tenant_id TEXT NOT NULL,
        vendor_slug TEXT NOT NULL,
        display_name TEXT NOT NULL,
        category TEXT NOT NULL,
        total_spans INTEGER NOT NULL DEFAULT 0,
        total_traces INTEGER NOT NULL DEFAULT 0,
        total_errors INTEGER NOT NULL DEFAULT 0,
        first_seen_at TEXT NOT NULL,
        last_seen_at TEXT NOT NULL,
        UNIQUE (tenant_id, vendor_slug)
    )",
    "CREATE TABLE IF NOT EXISTS spans (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        tenant_id TEXT NOT NULL,
        user_id TEXT,
        team_id TEXT,
        tool_profile_id INTEGER NOT NULL REFERENCES tool_profiles(id),
        trace_id TEXT NOT NULL,
        span_id TEXT NOT NULL,
        parent_span_id TEXT,
        name TEXT NOT NULL,
        kind TEXT NOT NULL,
        start_time TEXT NOT NULL,
        end_time TEXT,
        duration_ms REAL,
        status_code TEXT NOT NULL,
        status_message TEXT,
        vendor_slug TEXT NOT NULL,
        service_name TEXT,
        resource_attributes TEXT NOT NULL,
        span_attributes TEXT NOT NULL,
        signal_type TEXT NOT NULL,
        UNIQUE (tenant_id, trace_id, span_id)
    )",
    "CREATE INDEX IF NOT EXISTS idx_spans_profile ON spans(tool_profile_id)",
];

/// SQLite-backed span store and directory.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn open(cfg: &StorageCfg) -> CoreResult<Self> {
        let pool = open_pool(&cfg.database_url, cfg.max_connections).await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// In-memory database, mostly for tests and dry runs.
    pub async fn in_memory() -> CoreResult<Self> {
        Self::open(&StorageCfg {
            database_url: "sqlite::memory:".into(),
            max_connections: 1,
        })
        .await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn migrate(&self) -> CoreResult<()> {
        for stmt in SCHEMA {
            sqlx::query(stmt).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub async fn put_tenant(
        &self,
        id: &str,
        owner_user_id: Option<&str>,
        metering_customer_id: Option<&str>,
    ) -> CoreResult<()> {
        sqlx::query(
            "INSERT INTO tenants (id, owner_user_id, metering_customer_id) VALUES (?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET owner_user_id = excluded.owner_user_id,
                 metering_customer_id = excluded.metering_customer_id",
        )
        .bind(id)
        .bind(owner_user_id)
        .bind(metering_customer_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn put_user(&self, id: &str, tenant_id: Option<&str>) -> CoreResult<()> {
        sqlx::query(
            "INSERT INTO users (id, tenant_id) VALUES (?, ?)
             ON CONFLICT(id) DO UPDATE SET tenant_id = excluded.tenant_id",
        )
        .bind(id)
        .bind(tenant_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn add_team_member(&self, tenant_id: &str, team_id: &str, user_id: &str) -> CoreResult<()> {
        sqlx::query("INSERT OR IGNORE INTO team_members (tenant_id, team_id, user_id) VALUES (?, ?, ?)")
            .bind(tenant_id)
            .bind(team_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn tool_profile(&self, tenant_id: &str, vendor_slug: &str) -> CoreResult<Option<ToolProfile>> {
        let row = sqlx::query("SELECT * FROM tool_profiles WHERE tenant_id = ? AND vendor_slug = ?")
            .bind(tenant_id)
            .bind(vendor_slug)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(profile_from_row).transpose()
    }

    pub async fn tool_profiles(&self, tenant_id: &str) -> CoreResult<Vec<ToolProfile>> {
        let rows = sqlx::query("SELECT * FROM tool_profiles WHERE tenant_id = ? ORDER BY vendor_slug")
            .bind(tenant_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(profile_from_row).collect()
    }

    /// Spans of one trace ordered by start time.
    pub async fn spans_for_trace(&self, tenant_id: &str, trace_id: &str) -> CoreResult<Vec<Span>> {
        let rows = sqlx::query(
            "SELECT * FROM spans WHERE tenant_id = ? AND trace_id = ? ORDER BY start_time, id",
        )
        .bind(tenant_id)
        .bind(trace_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(span_from_row).collect()
    }

    pub async fn count_spans(&self, tenant_id: &str) -> CoreResult<i64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM spans WHERE tenant_id = ?")
            .bind(tenant_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }
}

/// Open (or create) the pool. `:memory:` databases are per-connection, so
/// they get exactly one connection.
async fn open_pool(database_url: &str, max_connections: u32) -> CoreResult<SqlitePool> {
    let opts = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true)
        .busy_timeout(std::time::Duration::from_secs(5));
    let max = if database_url.contains(":memory:") {
        1
    } else {
        max_connections.max(1)
    };
    let pool = SqlitePoolOptions::new()
        .max_connections(max)
        .connect_with(opts)
        .await?;
    Ok(pool)
}

/// One span row, fully owned apart from borrowed ids.
struct SpanRow<'a> {
    profile_id: i64,
    vendor_slug: &'a str,
    span: &'a SpanDraft,
    resource_json: String,
    attributes_json: String,
}

fn to_json(map: &HashMap<String, String>) -> CoreResult<String> {
    serde_json::to_string(map).map_err(|e| MeterError::Other(e.into()))
}

#[async_trait]
impl SpanStore for SqliteStore {
    async fn persist(&self, unit: &PersistUnit) -> CoreResult<PersistReceipt> {
        let attribution = &unit.attribution;
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let mut receipt = PersistReceipt::default();
        let mut rows: Vec<SpanRow<'_>> = Vec::with_capacity(unit.span_count());

        for group in unit.groups() {
            let delta = group.delta();
            let vendor = &group.vendor;
            let inserted = sqlx::query(
                "INSERT INTO tool_profiles (tenant_id, vendor_slug, display_name, category,
                     total_spans, total_traces, total_errors, first_seen_at, last_seen_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(tenant_id, vendor_slug) DO NOTHING",
            )
            .bind(&attribution.tenant_id)
            .bind(&vendor.slug)
            .bind(&vendor.display_name)
            .bind(vendor.category.as_str())
            .bind(delta.spans)
            .bind(delta.traces)
            .bind(delta.errors)
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await?;

            let (profile_id, created) = if inserted.rows_affected() == 1 {
                (inserted.last_insert_rowid(), true)
            } else {
                let id: i64 = sqlx::query_scalar(
                    "UPDATE tool_profiles
                     SET total_spans = total_spans + ?,
                         total_traces = total_traces + ?,
                         total_errors = total_errors + ?,
                         last_seen_at = ?
                     WHERE tenant_id = ? AND vendor_slug = ?
                     RETURNING id",
                )
                .bind(delta.spans)
                .bind(delta.traces)
                .bind(delta.errors)
                .bind(now)
                .bind(&attribution.tenant_id)
                .bind(&vendor.slug)
                .fetch_one(&mut *tx)
                .await?;
                (id, false)
            };
            receipt.profiles.push(ProfileReceipt {
                vendor_slug: vendor.slug.clone(),
                profile_id,
                created,
            });

            for span in &group.spans {
                rows.push(SpanRow {
                    profile_id,
                    vendor_slug: &vendor.slug,
                    span,
                    resource_json: to_json(&span.resource_attributes)?,
                    attributes_json: to_json(&span.attributes)?,
                });
            }
        }

        for chunk in rows.chunks(SPAN_CHUNK) {
            let mut qb = QueryBuilder::<Sqlite>::new(
                "INSERT INTO spans (tenant_id, user_id, team_id, tool_profile_id, trace_id, span_id,
                    parent_span_id, name, kind, start_time, end_time, duration_ms, status_code,
                    status_message, vendor_slug, service_name, resource_attributes,
                    span_attributes, signal_type) ",
            );
            qb.push_values(chunk, |mut b, row| {
                let s = row.span;
                b.push_bind(attribution.tenant_id.as_str())
                    .push_bind(attribution.user_id.as_deref())
                    .push_bind(attribution.team_id.as_deref())
                    .push_bind(row.profile_id)
                    .push_bind(s.trace_id.as_str())
                    .push_bind(s.span_id.as_str())
                    .push_bind(s.parent_span_id.as_deref())
                    .push_bind(s.name.as_str())
                    .push_bind(s.kind.as_str())
                    .push_bind(s.start_time)
                    .push_bind(s.end_time)
                    .push_bind(s.duration_ms)
                    .push_bind(s.status_code.as_str())
                    .push_bind(s.status_message.as_deref())
                    .push_bind(row.vendor_slug)
                    .push_bind(s.service_name.as_deref())
                    .push_bind(row.resource_json.as_str())
                    .push_bind(row.attributes_json.as_str())
                    .push_bind(SIGNAL_TRACE);
            });
            qb.push(" ON CONFLICT(tenant_id, trace_id, span_id) DO NOTHING");
            receipt.inserted_spans += qb.build().execute(&mut *tx).await?.rows_affected();
        }

        tx.commit().await?;
        tracing::debug!(
            tenant_id = %attribution.tenant_id,
            profiles = receipt.profiles.len(),
            span_rows = rows.len(),
            inserted = receipt.inserted_spans,
            "unit persisted"
        );
        Ok(receipt)
    }
}

#[async_trait]
impl Directory for SqliteStore {
    async fn tenant_of_user(&self, user_id: &str) -> CoreResult<Option<String>> {
        let t: Option<Option<String>> = sqlx::query_scalar("SELECT tenant_id FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(t.flatten())
    }

    async fn tenant_owned_by(&self, user_id: &str) -> CoreResult<Option<String>> {
        let t = sqlx::query_scalar("SELECT id FROM tenants WHERE owner_user_id = ? ORDER BY id LIMIT 1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(t)
    }

    async fn is_team_member(&self, tenant_id: &str, team_id: &str, user_id: &str) -> CoreResult<bool> {
        let hit: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM team_members WHERE tenant_id = ? AND team_id = ? AND user_id = ?",
        )
        .bind(tenant_id)
        .bind(team_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(hit.is_some())
    }

    async fn teams_of_user(&self, tenant_id: &str, user_id: &str) -> CoreResult<Vec<String>> {
        let teams = sqlx::query_scalar(
            "SELECT team_id FROM team_members WHERE tenant_id = ? AND user_id = ? ORDER BY team_id",
        )
        .bind(tenant_id)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(teams)
    }

    async fn metering_customer(&self, tenant_id: &str) -> CoreResult<Option<String>> {
        let c: Option<Option<String>> =
            sqlx::query_scalar("SELECT metering_customer_id FROM tenants WHERE id = ?")
                .bind(tenant_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(c.flatten().filter(|c| !c.is_empty()))
    }
}

// ---- row mapping ----

fn parse_text<T: DeserializeOwned>(column: &str, raw: String) -> CoreResult<T> {
    serde_json::from_value(serde_json::Value::String(raw.clone()))
        .map_err(|e| MeterError::Other(anyhow::anyhow!("bad {column} value '{raw}': {e}")))
}

fn parse_map(column: &str, raw: &str) -> CoreResult<HashMap<String, String>> {
    serde_json::from_str(raw)
        .map_err(|e| MeterError::Other(anyhow::anyhow!("bad {column} json: {e}")))
}

fn profile_from_row(row: &SqliteRow) -> CoreResult<ToolProfile> {
    Ok(ToolProfile {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        vendor_slug: row.try_get("vendor_slug")?,
        display_name: row.try_get("display_name")?,
        category: row.try_get("category")?,
        total_spans: row.try_get("total_spans")?,
        total_traces: row.try_get("total_traces")?,
        total_errors: row.try_get("total_errors")?,
        first_seen_at: row.try_get::<DateTime<Utc>, _>("first_seen_at")?,
        last_seen_at: row.try_get::<DateTime<Utc>, _>("last_seen_at")?,
    })
}

fn span_from_row(row: &SqliteRow) -> CoreResult<Span> {
    let draft = SpanDraft {
        trace_id: row.try_get("trace_id")?,
        span_id: row.try_get("span_id")?,
        parent_span_id: row.try_get("parent_span_id")?,
        name: row.try_get("name")?,
        kind: parse_text("kind", row.try_get("kind")?)?,
        start_time: row.try_get("start_time")?,
        end_time: row.try_get("end_time")?,
        duration_ms: row.try_get("duration_ms")?,
        status_code: parse_text("status_code", row.try_get("status_code")?)?,
        status_message: row.try_get("status_message")?,
        service_name: row.try_get("service_name")?,
        resource_attributes: parse_map("resource_attributes", row.try_get("resource_attributes")?)?,
        attributes: parse_map("span_attributes", row.try_get("span_attributes")?)?,
    };
    Ok(Span {
        tenant_id: row.try_get("tenant_id")?,
        user_id: row.try_get("user_id")?,
        team_id: row.try_get("team_id")?,
        tool_profile_id: row.try_get("tool_profile_id")?,
        vendor_slug: row.try_get("vendor_slug")?,
        signal_type: row.try_get("signal_type")?,
        draft,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::PersistUnit;
    use crate::telemetry::{StatusCode, Vendor, VendorCategory};
    use crate::test_util::{attribution, draft};

    fn cursor() -> Vendor {
        Vendor {
            slug: "cursor".into(),
            display_name: "Cursor".into(),
            category: VendorCategory::Ide,
        }
    }

    #[tokio::test]
    async fn first_persist_creates_profile_then_counters_add() {
        let store = SqliteStore::in_memory().await.unwrap();
        let mut unit = PersistUnit::new(attribution("t_1", "u_1"));
        let mut failed = draft("aa01", "01");
        failed.status_code = StatusCode::Error;
        unit.push(cursor(), vec![failed, draft("aa01", "02")]);

        let first = store.persist(&unit).await.unwrap();
        assert_eq!(first.inserted_spans, 2);
        assert!(first.profiles[0].created);

        let mut again = PersistUnit::new(attribution("t_1", "u_1"));
        again.push(cursor(), vec![draft("bb02", "03")]);
        let second = store.persist(&again).await.unwrap();
        assert!(!second.profiles[0].created);
        assert_eq!(second.profiles[0].profile_id, first.profiles[0].profile_id);

        let p = store.tool_profile("t_1", "cursor").await.unwrap().unwrap();
        assert_eq!((p.total_spans, p.total_traces, p.total_errors), (3, 2, 1));
        assert_eq!(p.display_name, "Cursor");
        assert_eq!(p.category, "ide");
        assert!(p.last_seen_at >= p.first_seen_at);
    }

    #[tokio::test]
    async fn redelivered_spans_are_not_duplicated() {
        let store = SqliteStore::in_memory().await.unwrap();
        let mut unit = PersistUnit::new(attribution("t_1", "u_1"));
        unit.push(cursor(), vec![draft("aa01", "01")]);
        store.persist(&unit).await.unwrap();
        let again = store.persist(&unit).await.unwrap();
        assert_eq!(again.inserted_spans, 0);
        assert_eq!(store.count_spans("t_1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn tenants_are_isolated() {
        let store = SqliteStore::in_memory().await.unwrap();
        for tenant in ["t_1", "t_2"] {
            let mut unit = PersistUnit::new(attribution(tenant, "u"));
            unit.push(cursor(), vec![draft("aa01", "01")]);
            let r = store.persist(&unit).await.unwrap();
            assert!(r.profiles[0].created);
            assert_eq!(r.inserted_spans, 1);
        }
        assert_eq!(store.tool_profiles("t_2").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn bulk_insert_spans_multiple_chunks() {
        let store = SqliteStore::in_memory().await.unwrap();
        let spans: Vec<_> = (0..SPAN_CHUNK + 7)
            .map(|i| draft("cc03", &format!("{i:016x}")))
            .collect();
        let mut unit = PersistUnit::new(attribution("t_1", "u_1"));
        unit.push(cursor(), spans);
        let r = store.persist(&unit).await.unwrap();
        assert_eq!(r.inserted_spans, (SPAN_CHUNK + 7) as u64);
        let p = store.tool_profile("t_1", "cursor").await.unwrap().unwrap();
        assert_eq!(p.total_traces, 1);
    }

    #[tokio::test]
    async fn span_round_trips_through_row_mapping() {
        let store = SqliteStore::in_memory().await.unwrap();
        let mut d = draft("dd04", "01");
        d.attributes.insert("gen_ai.request.model".into(), "gpt-4o".into());
        d.parent_span_id = Some("00".into());
        let mut unit = PersistUnit::new(attribution("t_1", "u_1"));
        unit.push(cursor(), vec![d.clone()]);
        store.persist(&unit).await.unwrap();

        let spans = store.spans_for_trace("t_1", "dd04").await.unwrap();
        assert_eq!(spans.len(), 1);
        let got = &spans[0];
        assert_eq!(got.vendor_slug, "cursor");
        assert_eq!(got.signal_type, "trace");
        assert_eq!(got.user_id.as_deref(), Some("u_1"));
        assert_eq!(got.draft.kind, d.kind);
        assert_eq!(got.draft.start_time, d.start_time);
        assert_eq!(got.draft.attributes, d.attributes);
        assert_eq!(got.draft.parent_span_id.as_deref(), Some("00"));
    }

    #[tokio::test]
    async fn directory_lookups() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.put_tenant("t_1", Some("owner"), Some("cus_1")).await.unwrap();
        store.put_tenant("t_2", None, None).await.unwrap();
        store.put_user("member", Some("t_1")).await.unwrap();
        store.put_user("owner", None).await.unwrap();
        store.add_team_member("t_1", "team_a", "member").await.unwrap();

        assert_eq!(store.tenant_of_user("member").await.unwrap().as_deref(), Some("t_1"));
        assert_eq!(store.tenant_of_user("owner").await.unwrap(), None);
        assert_eq!(store.tenant_owned_by("owner").await.unwrap().as_deref(), Some("t_1"));
        assert!(store.is_team_member("t_1", "team_a", "member").await.unwrap());
        assert!(!store.is_team_member("t_2", "team_a", "member").await.unwrap());
        assert_eq!(store.teams_of_user("t_1", "member").await.unwrap(), vec!["team_a"]);
        assert_eq!(store.metering_customer("t_1").await.unwrap().as_deref(), Some("cus_1"));
        assert_eq!(store.metering_customer("t_2").await.unwrap(), None);
    }
}
