use std::{collections::HashMap, sync::Arc};

use secrecy::SecretString;

use crate::config::Config;
use crate::error::CoreResult;
use crate::http_client::HttpClient;
use crate::provider::{ChatProvider, NULL_PROVIDER, NullProvider};
use crate::providers::openai::OpenAiCompatible;

/// Registry of concrete provider instances by name.
/// Names correspond to `providers.<name>` config keys, plus the built-in `null`.
pub struct ProviderRegistry {
    chat: HashMap<String, Arc<dyn ChatProvider>>,
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        let mut chat: HashMap<String, Arc<dyn ChatProvider>> = HashMap::new();
        chat.insert(NULL_PROVIDER.into(), Arc::new(NullProvider));
        Self { chat }
    }
}

impl ProviderRegistry {
    /// Build from configuration, reading API keys from the process environment.
    pub fn from_config(cfg: &Config) -> CoreResult<Self> {
        Self::from_config_with(cfg, |var| std::env::var(var).ok())
    }

    /// Build from configuration with an explicit key lookup. Providers whose
    /// key is missing are skipped with a warning rather than failing startup.
    pub fn from_config_with<F>(cfg: &Config, lookup: F) -> CoreResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let http = HttpClient::from_cfg(&cfg.http)?;
        let mut reg = Self::default();
        for (name, p) in &cfg.providers {
            let Some(key) = lookup(&p.api_key_env).filter(|k| !k.is_empty()) else {
                tracing::warn!(provider = %name, env = %p.api_key_env, "api key not set; provider disabled");
                continue;
            };
            let provider =
                OpenAiCompatible::new(name, http.clone(), SecretString::from(key), &p.base_url);
            reg.insert(Arc::new(provider));
        }
        Ok(reg)
    }

    /// Register (or replace) a provider under its own name.
    pub fn insert(&mut self, provider: Arc<dyn ChatProvider>) {
        self.chat.insert(provider.name().to_string(), provider);
    }

    /// Get a chat provider by name (e.g., "openai", "null").
    pub fn chat(&self, name: &str) -> Option<Arc<dyn ChatProvider>> {
        self.chat.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.chat.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
