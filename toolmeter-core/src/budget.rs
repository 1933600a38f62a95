//! Budget gate for proxy virtual keys.
//!
//! Decides allow/deny and the remaining figure to report. It never mutates
//! the key; spend accounting and periodic counter rollover belong to the
//! key store.

use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoreResult, MeterError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetReset {
    #[default]
    None,
    Daily,
    Weekly,
    Monthly,
}

impl BudgetReset {
    /// Next rollover instant strictly after `from`, at UTC midnight.
    /// Weekly resets land on Mondays, monthly on the 1st.
    pub fn next_reset_after(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let midnight = |d: chrono::NaiveDate| {
            d.and_hms_opt(0, 0, 0).map(|n| Utc.from_utc_datetime(&n))
        };
        let today = from.date_naive();
        match self {
            Self::None => None,
            Self::Daily => midnight(today.succ_opt()?),
            Self::Weekly => {
                let days = 7 - i64::from(today.weekday().num_days_from_monday());
                midnight(today + Duration::days(days))
            }
            Self::Monthly => {
                let (y, m) = if today.month() == 12 {
                    (today.year() + 1, 1)
                } else {
                    (today.year(), today.month() + 1)
                };
                midnight(chrono::NaiveDate::from_ymd_opt(y, m, 1)?)
            }
        }
    }
}

/// Tenant-issued proxy credential. Owned by the key store; read-only here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VirtualKey {
    pub id: String,
    pub tenant_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub team_id: Option<String>,
    #[serde(default)]
    pub budget_usd: Option<f64>,
    #[serde(default)]
    pub spend_usd: f64,
    #[serde(default)]
    pub budget_reset: BudgetReset,
    #[serde(default)]
    pub spend_reset_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub allowed_models: Option<Vec<String>>,
}

impl VirtualKey {
    pub fn unlimited(id: &str, tenant_id: &str) -> Self {
        Self {
            id: id.to_string(),
            tenant_id: tenant_id.to_string(),
            user_id: None,
            team_id: None,
            budget_usd: None,
            spend_usd: 0.0,
            budget_reset: BudgetReset::None,
            spend_reset_at: None,
            disabled: false,
            allowed_models: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetState {
    Disabled,
    Unlimited,
    WithinBudget,
    OverBudget,
    ResetDue,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BudgetDecision {
    pub state: BudgetState,
    /// `None` when the key has no budget.
    pub remaining_usd: Option<f64>,
}

impl BudgetDecision {
    pub fn allowed(&self) -> bool {
        !matches!(self.state, BudgetState::Disabled | BudgetState::OverBudget)
    }
}

/// Why a key was turned away. Lets clients tell "try another key" from
/// "try another model".
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum RejectReason {
    KeyDisabled,
    BudgetExceeded { remaining_usd: f64 },
    ModelNotAllowed { model: String },
}

impl RejectReason {
    pub fn code(&self) -> &'static str {
        match self {
            Self::KeyDisabled => "key_disabled",
            Self::BudgetExceeded { .. } => "budget_exceeded",
            Self::ModelNotAllowed { .. } => "model_not_allowed",
        }
    }
}

pub struct BudgetGate;

impl BudgetGate {
    pub fn evaluate(key: &VirtualKey, now: DateTime<Utc>) -> BudgetDecision {
        if key.disabled {
            return BudgetDecision {
                state: BudgetState::Disabled,
                remaining_usd: Some(0.0),
            };
        }
        let Some(budget) = key.budget_usd else {
            return BudgetDecision {
                state: BudgetState::Unlimited,
                remaining_usd: None,
            };
        };
        if key.budget_reset != BudgetReset::None
            && key.spend_reset_at.is_some_and(|at| now > at)
        {
            return BudgetDecision {
                state: BudgetState::ResetDue,
                remaining_usd: Some(budget),
            };
        }
        if key.spend_usd >= budget {
            BudgetDecision {
                state: BudgetState::OverBudget,
                remaining_usd: Some(0.0),
            }
        } else {
            BudgetDecision {
                state: BudgetState::WithinBudget,
                remaining_usd: Some(budget - key.spend_usd),
            }
        }
    }

    /// Budget check, then model allow-list. Both run before any upstream call.
    pub fn authorize(key: &VirtualKey, model: &str, now: DateTime<Utc>) -> CoreResult<BudgetDecision> {
        let decision = Self::evaluate(key, now);
        match decision.state {
            BudgetState::Disabled => return Err(MeterError::Rejected(RejectReason::KeyDisabled)),
            BudgetState::OverBudget => {
                return Err(MeterError::Rejected(RejectReason::BudgetExceeded {
                    remaining_usd: 0.0,
                }));
            }
            _ => {}
        }
        if let Some(allowed) = &key.allowed_models
            && !allowed.iter().any(|m| m == model)
        {
            return Err(MeterError::Rejected(RejectReason::ModelNotAllowed {
                model: model.to_string(),
            }));
        }
        Ok(decision)
    }
}
