use std::sync::Arc;

use regex::Regex;

use crate::config::{Config, RoutingRule};
use crate::error::{CoreResult, MeterError};
use crate::provider::ChatProvider;
use crate::provider_factory::ProviderRegistry;

#[derive(Debug)]
struct CompiledRule {
    regex: Regex,
    provider: String,
}

/// Resolves a model string to a provider name, then fetches the provider
/// from the registry.
#[derive(Debug)]
pub struct RoutingResolver {
    rules: Vec<CompiledRule>,
    default_provider: String,
}

impl RoutingResolver {
    /// Compiles every rule up front; a bad pattern fails startup.
    pub fn new(cfg: &Config) -> CoreResult<Self> {
        let mut rules = Vec::new();
        for RoutingRule { model, provider } in &cfg.routing.rules {
            let regex = Regex::new(model).map_err(|e| {
                MeterError::Validation(format!("invalid routing regex '{model}': {e}"))
            })?;
            rules.push(CompiledRule {
                regex,
                provider: provider.clone(),
            });
        }
        Ok(Self {
            rules,
            default_provider: cfg.routing.default.clone(),
        })
    }

    fn pick_provider_name<'a>(&'a self, model: &str) -> &'a str {
        self.rules
            .iter()
            .find(|r| r.regex.is_match(model))
            .map(|r| r.provider.as_str())
            .unwrap_or(&self.default_provider)
    }

    /// Explicit provider id wins; otherwise the first matching rule, then
    /// the default.
    pub fn select_chat(
        &self,
        reg: &ProviderRegistry,
        explicit: Option<&str>,
        model: &str,
    ) -> CoreResult<Arc<dyn ChatProvider>> {
        let name = explicit.unwrap_or_else(|| self.pick_provider_name(model));
        reg.chat(name).ok_or_else(|| {
            MeterError::Validation(format!("provider '{name}' is not registered"))
        })
    }
}
