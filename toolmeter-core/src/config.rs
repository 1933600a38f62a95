use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fs, path::Path};

use crate::error::{CoreResult, MeterError};
use crate::provider::NULL_PROVIDER;

/// One OpenAI-compatible upstream.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ProviderCfg {
    /// Base URL up to and including the API version, e.g. `https://api.openai.com/v1`.
    pub base_url: String,
    /// Name of the environment variable that contains the API key.
    pub api_key_env: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct HttpCfg {
    /// TCP connect timeout in milliseconds (default 5000ms)
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Total request timeout in milliseconds (default 60000ms)
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Optional per-host idle connection pool cap (None = reqwest default)
    #[serde(default)]
    pub pool_max_idle_per_host: Option<usize>,
}

impl Default for HttpCfg {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            pool_max_idle_per_host: None,
        }
    }
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}
fn default_request_timeout_ms() -> u64 {
    60_000
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct RoutingRule {
    /// Regex applied to the model name, e.g. ^gpt-.*
    pub model: String,
    /// Provider to route to when this rule matches
    pub provider: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct RoutingCfg {
    pub default: String,
    #[serde(default)]
    pub rules: Vec<RoutingRule>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct StorageCfg {
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for StorageCfg {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            max_connections: default_max_connections(),
        }
    }
}

fn default_database_url() -> String {
    "sqlite://toolmeter.db".into()
}
fn default_max_connections() -> u32 {
    5
}

/// Billing sink. No endpoint means metering is disabled.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
pub struct MeteringCfg {
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub api_key_env: Option<String>,
}

/// Truncation caps, in characters, for synthesized span attributes.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct LimitsCfg {
    #[serde(default = "default_prompt_chars")]
    pub prompt_chars: usize,
    #[serde(default = "default_tool_args_chars")]
    pub tool_args_chars: usize,
    #[serde(default = "default_tool_output_chars")]
    pub tool_output_chars: usize,
}

impl Default for LimitsCfg {
    fn default() -> Self {
        Self {
            prompt_chars: default_prompt_chars(),
            tool_args_chars: default_tool_args_chars(),
            tool_output_chars: default_tool_output_chars(),
        }
    }
}

fn default_prompt_chars() -> usize {
    50_000
}
fn default_tool_args_chars() -> usize {
    20_000
}
fn default_tool_output_chars() -> usize {
    100_000
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Config {
    /// Upstreams by name; the name is what routing rules refer to.
    pub providers: BTreeMap<String, ProviderCfg>,
    pub routing: RoutingCfg,
    /// HTTP client configuration (timeouts, pooling). Missing → defaults.
    #[serde(default)]
    pub http: HttpCfg,
    #[serde(default)]
    pub storage: StorageCfg,
    #[serde(default)]
    pub metering: MeteringCfg,
    #[serde(default)]
    pub limits: LimitsCfg,
}

impl Config {
    /// Load a Config from a file path (JSON or TOML by extension). If the
    /// extension is missing or unrecognized, try JSON first, then TOML.
    pub fn from_path<P: AsRef<Path>>(path: P) -> CoreResult<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path)?;
        let s = std::str::from_utf8(&bytes).map_err(|e| MeterError::Other(e.into()))?;
        let cfg: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => {
                serde_json::from_str::<Self>(s).map_err(|e| MeterError::Other(e.into()))?
            }
            Some("toml") => toml::from_str::<Self>(s).map_err(|e| MeterError::Other(e.into()))?,
            _ => serde_json::from_str::<Self>(s)
                .map_err(|e| MeterError::Other(e.into()))
                .or_else(|_| toml::from_str::<Self>(s).map_err(|e| MeterError::Other(e.into())))?,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    /// No upstreams: everything routes to the built-in null provider.
    pub fn offline() -> Self {
        Self {
            providers: BTreeMap::new(),
            routing: RoutingCfg {
                default: NULL_PROVIDER.into(),
                rules: Vec::new(),
            },
            http: HttpCfg::default(),
            storage: StorageCfg::default(),
            metering: MeteringCfg::default(),
            limits: LimitsCfg::default(),
        }
    }

    /// Routing must point at configured providers (or the null provider).
    pub fn validate(&self) -> CoreResult<()> {
        let known = |p: &str| p == NULL_PROVIDER || self.providers.contains_key(p);
        if !known(&self.routing.default) {
            return Err(MeterError::Validation(format!(
                "routing.default '{}' is not a configured provider",
                self.routing.default
            )));
        }
        if let Some(rule) = self.routing.rules.iter().find(|r| !known(&r.provider)) {
            return Err(MeterError::Validation(format!(
                "routing rule '{}' targets unknown provider '{}'",
                rule.model, rule.provider
            )));
        }
        Ok(())
    }
}
