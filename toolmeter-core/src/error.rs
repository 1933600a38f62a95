use thiserror::Error;

use crate::budget::RejectReason;

/// Core error type for toolmeter.
/// Internally, modules can use `anyhow::Result<T>` for convenience,
/// but public boundaries should expose `CoreResult<T>` with this error.
#[derive(Debug, Error)]
pub enum MeterError {
    #[error("validation failed: {0}")]
    Validation(String),

    /// No user or tenant could be resolved for a batch; nothing was written.
    #[error("unattributable telemetry: {0}")]
    Unattributable(String),

    /// Virtual key rejected before any upstream call.
    #[error("request rejected: {}", .0.code())]
    Rejected(RejectReason),

    #[error("rate limited by provider {provider}")]
    RateLimited {
        provider: String,
        retry_after: Option<u64>,
    },

    #[error("provider unavailable: {provider}")]
    ProviderUnavailable { provider: String },

    #[error("upstream error from {provider}: {code} {message}")]
    ProviderError {
        provider: String,
        code: String,
        message: String,
    },

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("metering error: {0}")]
    Metering(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl MeterError {
    /// Status a front end should surface for this error.
    pub fn http_status(&self) -> http::StatusCode {
        use http::StatusCode;
        match self {
            Self::Validation(_) | Self::Unattributable(_) => StatusCode::BAD_REQUEST,
            Self::Rejected(RejectReason::BudgetExceeded { .. }) => StatusCode::PAYMENT_REQUIRED,
            Self::Rejected(_) => StatusCode::FORBIDDEN,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::ProviderUnavailable { .. } => StatusCode::BAD_GATEWAY,
            Self::ProviderError { code, .. } => code
                .parse::<u16>()
                .ok()
                .and_then(|c| StatusCode::from_u16(c).ok())
                .filter(|s| s.is_client_error() || s.is_server_error())
                .unwrap_or(StatusCode::BAD_GATEWAY),
            Self::Storage(_) | Self::Metering(_) | Self::Io(_) | Self::Other(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Upstream status and message, when this error came from the provider.
    pub fn upstream_detail(&self) -> Option<(Option<u16>, String)> {
        match self {
            Self::RateLimited { provider, .. } => {
                Some((Some(429), format!("rate limited by {provider}")))
            }
            Self::ProviderUnavailable { provider } => {
                Some((None, format!("provider unavailable: {provider}")))
            }
            Self::ProviderError { code, message, .. } => {
                Some((code.parse::<u16>().ok(), message.clone()))
            }
            _ => None,
        }
    }
}

pub type CoreResult<T> = std::result::Result<T, MeterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejected_maps_by_reason() {
        let err = MeterError::Rejected(RejectReason::KeyDisabled);
        assert_eq!(err.http_status(), http::StatusCode::FORBIDDEN);
        assert_eq!(err.to_string(), "request rejected: key_disabled");

        let err = MeterError::Rejected(RejectReason::BudgetExceeded { remaining_usd: 0.0 });
        assert_eq!(err.http_status(), http::StatusCode::PAYMENT_REQUIRED);
    }

    #[test]
    fn provider_error_keeps_upstream_status() {
        let err = MeterError::ProviderError {
            provider: "openai".into(),
            code: "404".into(),
            message: "model not found".into(),
        };
        assert_eq!(err.http_status(), http::StatusCode::NOT_FOUND);
        assert_eq!(
            err.upstream_detail(),
            Some((Some(404), "model not found".to_string()))
        );

        let odd = MeterError::ProviderError {
            provider: "openai".into(),
            code: "200".into(),
            message: "json decode error".into(),
        };
        assert_eq!(odd.http_status(), http::StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn unattributable_is_client_error() {
        let err = MeterError::Unattributable("no user id".into());
        assert_eq!(err.http_status(), http::StatusCode::BAD_REQUEST);
        assert!(err.upstream_detail().is_none());
    }
}
