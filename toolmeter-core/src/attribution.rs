//! Tenant, user and team attribution.
//!
//! Every persisted span must carry a billable tenant. The resolver finds a
//! user id in telemetry (or request context), maps it to a tenant through
//! the [`Directory`] and then picks a team on a best-effort basis.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::{CoreResult, MeterError};
use crate::telemetry::{TEAM_ID_KEYS, TraceBatch, USER_ID_KEYS, flatten_attributes};

/// Resolved identity attached to every span of one batch or exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Attribution {
    pub tenant_id: String,
    pub user_id: Option<String>,
    pub team_id: Option<String>,
}

/// Identity asserted by the caller outside the telemetry payload
/// (e.g. request headers). Used only when telemetry carries none.
#[derive(Debug, Clone, Default)]
pub struct RequestIdentity {
    pub user_id: Option<String>,
    pub team_id: Option<String>,
}

/// Tenant/user directory collaborator.
#[async_trait]
pub trait Directory: Send + Sync {
    /// Tenant-membership column on the user record.
    async fn tenant_of_user(&self, user_id: &str) -> CoreResult<Option<String>>;
    /// Tenant the user owns.
    async fn tenant_owned_by(&self, user_id: &str) -> CoreResult<Option<String>>;
    async fn is_team_member(&self, tenant_id: &str, team_id: &str, user_id: &str) -> CoreResult<bool>;
    async fn teams_of_user(&self, tenant_id: &str, user_id: &str) -> CoreResult<Vec<String>>;
    /// Per-tenant metering sink key (billing customer), if configured.
    async fn metering_customer(&self, tenant_id: &str) -> CoreResult<Option<String>>;
}

fn first_alias(attrs: &HashMap<String, String>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| attrs.get(*k))
        .map(|v| v.trim())
        .find(|v| !v.is_empty())
        .map(str::to_string)
}

pub fn extract_user_id(attrs: &HashMap<String, String>) -> Option<String> {
    first_alias(attrs, USER_ID_KEYS)
}

pub fn extract_team_id(attrs: &HashMap<String, String>) -> Option<String> {
    first_alias(attrs, TEAM_ID_KEYS)
}

/// First user id and first team id asserted anywhere in the batch.
/// Each resource is checked before its own spans.
pub fn find_identity(batch: &TraceBatch) -> (Option<String>, Option<String>) {
    let mut user = None;
    let mut team = None;
    for group in &batch.resource_spans {
        let resource = flatten_attributes(group.attributes());
        user = user.or_else(|| extract_user_id(&resource));
        team = team.or_else(|| extract_team_id(&resource));
        if user.is_some() && team.is_some() {
            break;
        }
        for span in group.spans() {
            let attrs = flatten_attributes(&span.attributes);
            user = user.or_else(|| extract_user_id(&attrs));
            team = team.or_else(|| extract_team_id(&attrs));
            if user.is_some() && team.is_some() {
                return (user, team);
            }
        }
    }
    (user, team)
}

pub struct AttributionResolver {
    directory: Arc<dyn Directory>,
}

impl AttributionResolver {
    pub fn new(directory: Arc<dyn Directory>) -> Self {
        Self { directory }
    }

    pub fn directory(&self) -> &Arc<dyn Directory> {
        &self.directory
    }

    /// Resolve the whole batch, or fail with `Unattributable`.
    pub async fn resolve_batch(
        &self,
        batch: &TraceBatch,
        identity: &RequestIdentity,
    ) -> CoreResult<Attribution> {
        let (user, team) = find_identity(batch);
        let user = user
            .or_else(|| identity.user_id.clone().filter(|u| !u.trim().is_empty()))
            .ok_or_else(|| {
                MeterError::Unattributable("no user id in any resource or span".into())
            })?;
        let team = team.or_else(|| identity.team_id.clone());
        self.resolve_user(&user, team.as_deref()).await
    }

    pub async fn resolve_user(
        &self,
        user_id: &str,
        asserted_team: Option<&str>,
    ) -> CoreResult<Attribution> {
        let user_id = user_id.trim();
        let tenant_id = self.resolve_tenant(user_id).await?.ok_or_else(|| {
            MeterError::Unattributable(format!("no tenant for user '{user_id}'"))
        })?;
        let team_id = self.resolve_team(&tenant_id, user_id, asserted_team).await?;
        Ok(Attribution {
            tenant_id,
            user_id: Some(user_id.to_string()),
            team_id,
        })
    }

    async fn resolve_tenant(&self, user_id: &str) -> CoreResult<Option<String>> {
        if let Some(t) = self.directory.tenant_of_user(user_id).await? {
            return Ok(Some(t));
        }
        self.directory.tenant_owned_by(user_id).await
    }

    /// Asserted team if the user really belongs to it, else the user's only
    /// team in the tenant, else none.
    pub async fn resolve_team(
        &self,
        tenant_id: &str,
        user_id: &str,
        asserted: Option<&str>,
    ) -> CoreResult<Option<String>> {
        if let Some(team) = asserted.map(str::trim).filter(|t| !t.is_empty()) {
            if self.directory.is_team_member(tenant_id, team, user_id).await? {
                return Ok(Some(team.to_string()));
            }
            tracing::debug!(tenant_id, user_id, team, "asserted team rejected: not a member");
        }
        let mut teams = self.directory.teams_of_user(tenant_id, user_id).await?;
        Ok(if teams.len() == 1 { teams.pop() } else { None })
    }
}
