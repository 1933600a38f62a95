//! Vendor canonicalization.
//!
//! Raw telemetry names the same tool in many ways (`Cursor`, `cursor-agent`,
//! `gen_ai.system=openai`, ...). [`canonicalize_vendor`] maps a flattened
//! attribute set onto one stable [`Vendor`] by walking [`VENDOR_RULES`] in
//! order; the first matching rule wins. Rule order is part of the contract:
//! runtime rules sit above IDE rules so a worker-hosted IDE proxy is counted
//! as the runtime that emitted it.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::keys::{
    KEY_CLOUD_PLATFORM, KEY_CLOUD_PROVIDER, KEY_FAAS_NAME, KEY_GEN_AI_PROVIDER, KEY_GEN_AI_SYSTEM,
    KEY_MCP_SERVER, KEY_SERVICE_NAME,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VendorCategory {
    Llm,
    Runtime,
    ToolServer,
    Ide,
    Sandbox,
    Unknown,
}

impl VendorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Llm => "llm",
            Self::Runtime => "runtime",
            Self::ToolServer => "tool-server",
            Self::Ide => "ide",
            Self::Sandbox => "sandbox",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Vendor {
    pub slug: String,
    pub display_name: String,
    pub category: VendorCategory,
}

impl Vendor {
    pub fn unknown(display_name: &str) -> Self {
        Self {
            slug: "unknown".into(),
            display_name: display_name.into(),
            category: VendorCategory::Unknown,
        }
    }
}

/// Predicate over a flattened attribute map. Comparisons are case-insensitive.
#[derive(Debug, Clone, Copy)]
pub enum Matcher {
    Equals(&'static str, &'static str),
    Contains(&'static str, &'static str),
    Present(&'static str),
    AnyOf(&'static [Matcher]),
    AllOf(&'static [Matcher]),
}

impl Matcher {
    pub fn matches(&self, attrs: &HashMap<String, String>) -> bool {
        match *self {
            Self::Equals(key, want) => attrs
                .get(key)
                .is_some_and(|v| v.trim().eq_ignore_ascii_case(want)),
            Self::Contains(key, needle) => attrs
                .get(key)
                .is_some_and(|v| v.to_ascii_lowercase().contains(needle)),
            Self::Present(key) => attrs.get(key).is_some_and(|v| !v.trim().is_empty()),
            Self::AnyOf(all) => all.iter().any(|m| m.matches(attrs)),
            Self::AllOf(all) => all.iter().all(|m| m.matches(attrs)),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct VendorRule {
    pub matcher: Matcher,
    pub slug: &'static str,
    pub display_name: &'static str,
    pub category: VendorCategory,
}

impl VendorRule {
    fn vendor(&self) -> Vendor {
        Vendor {
            slug: self.slug.into(),
            display_name: self.display_name.into(),
            category: self.category,
        }
    }
}

const fn rule(
    matcher: Matcher,
    slug: &'static str,
    display_name: &'static str,
    category: VendorCategory,
) -> VendorRule {
    VendorRule {
        matcher,
        slug,
        display_name,
        category,
    }
}

use Matcher::{AllOf, AnyOf, Contains, Equals, Present};
use VendorCategory::{Ide, Llm, Runtime, Sandbox, ToolServer};

/// Ordered rule set. First match wins.
pub static VENDOR_RULES: &[VendorRule] = &[
    // Cloud runtimes first: an IDE proxy hosted on a worker is the worker.
    rule(
        AnyOf(&[
            Equals(KEY_CLOUD_PLATFORM, "cloudflare_workers"),
            AllOf(&[Equals(KEY_CLOUD_PROVIDER, "cloudflare"), Present(KEY_FAAS_NAME)]),
        ]),
        "cloudflare-workers",
        "Cloudflare Workers",
        Runtime,
    ),
    rule(
        AnyOf(&[Equals(KEY_CLOUD_PLATFORM, "aws_lambda"), Contains(KEY_SERVICE_NAME, "lambda")]),
        "aws-lambda",
        "AWS Lambda",
        Runtime,
    ),
    rule(Equals(KEY_CLOUD_PROVIDER, "vercel"), "vercel", "Vercel", Runtime),
    // Sandboxes.
    rule(Contains(KEY_SERVICE_NAME, "e2b"), "e2b", "E2B", Sandbox),
    rule(Contains(KEY_SERVICE_NAME, "daytona"), "daytona", "Daytona", Sandbox),
    // Tool servers.
    rule(
        AnyOf(&[Present(KEY_MCP_SERVER), Contains(KEY_SERVICE_NAME, "mcp")]),
        "mcp-server",
        "MCP Server",
        ToolServer,
    ),
    // IDEs and coding agents.
    rule(Contains(KEY_SERVICE_NAME, "claude-code"), "claude-code", "Claude Code", Ide),
    rule(Contains(KEY_SERVICE_NAME, "cursor"), "cursor", "Cursor", Ide),
    rule(Contains(KEY_SERVICE_NAME, "copilot"), "github-copilot", "GitHub Copilot", Ide),
    rule(Contains(KEY_SERVICE_NAME, "windsurf"), "windsurf", "Windsurf", Ide),
    rule(Contains(KEY_SERVICE_NAME, "codex"), "openai-codex", "OpenAI Codex", Ide),
    // Model providers, by GenAI semantic-convention system name.
    rule(
        AnyOf(&[Equals(KEY_GEN_AI_SYSTEM, "openai"), Equals(KEY_GEN_AI_PROVIDER, "openai")]),
        "openai",
        "OpenAI",
        Llm,
    ),
    rule(
        AnyOf(&[Equals(KEY_GEN_AI_SYSTEM, "anthropic"), Equals(KEY_GEN_AI_PROVIDER, "anthropic")]),
        "anthropic",
        "Anthropic",
        Llm,
    ),
    rule(
        AnyOf(&[Equals(KEY_GEN_AI_SYSTEM, "openrouter"), Equals(KEY_GEN_AI_PROVIDER, "openrouter")]),
        "openrouter",
        "OpenRouter",
        Llm,
    ),
    rule(
        AnyOf(&[
            Equals(KEY_GEN_AI_SYSTEM, "gcp.gemini"),
            Equals(KEY_GEN_AI_SYSTEM, "gemini"),
            Equals(KEY_GEN_AI_PROVIDER, "gcp.gemini"),
        ]),
        "google-gemini",
        "Google Gemini",
        Llm,
    ),
    rule(
        AnyOf(&[Equals(KEY_GEN_AI_SYSTEM, "aws.bedrock"), Equals(KEY_GEN_AI_PROVIDER, "aws.bedrock")]),
        "aws-bedrock",
        "AWS Bedrock",
        Llm,
    ),
];

/// Map attributes to a stable vendor using [`VENDOR_RULES`], falling back to
/// a slug of `service.name`.
pub fn canonicalize_vendor(attrs: &HashMap<String, String>) -> Vendor {
    canonicalize_with(VENDOR_RULES, attrs)
}

pub fn canonicalize_with(rules: &[VendorRule], attrs: &HashMap<String, String>) -> Vendor {
    if let Some(hit) = rules.iter().find(|r| r.matcher.matches(attrs)) {
        return hit.vendor();
    }

    let service = attrs
        .get(KEY_SERVICE_NAME)
        .map(|s| s.trim())
        .filter(|s| !s.is_empty());
    match service {
        Some(raw) => {
            let slug = slugify(raw);
            if slug.is_empty() {
                Vendor::unknown(raw)
            } else {
                Vendor {
                    slug,
                    display_name: raw.to_string(),
                    category: VendorCategory::Unknown,
                }
            }
        }
        None => Vendor::unknown("unknown"),
    }
}

/// Lowercase, collapse every non-alphanumeric run into one `-`, trim `-`.
pub fn slugify(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut pending_dash = false;
    for ch in s.chars().flat_map(char::to_lowercase) {
        if ch.is_ascii_alphanumeric() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.push(ch);
        } else {
            pending_dash = true;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn empty_attributes_are_unknown() {
        let v = canonicalize_vendor(&HashMap::new());
        assert_eq!(v.slug, "unknown");
        assert_eq!(v.display_name, "unknown");
        assert_eq!(v.category, VendorCategory::Unknown);
    }

    #[test]
    fn fallback_slugifies_service_name() {
        let v = canonicalize_vendor(&attrs(&[("service.name", "My Custom Service")]));
        assert_eq!(v.slug, "my-custom-service");
        assert_eq!(v.display_name, "My Custom Service");
        assert_eq!(v.category, VendorCategory::Unknown);
    }

    #[test]
    fn unsluggable_service_name_keeps_raw_display() {
        let v = canonicalize_vendor(&attrs(&[("service.name", "!!!")]));
        assert_eq!(v.slug, "unknown");
        assert_eq!(v.display_name, "!!!");
    }

    #[test]
    fn runtime_rule_beats_ide_rule() {
        let v = canonicalize_vendor(&attrs(&[
            ("service.name", "cursor-proxy"),
            ("cloud.platform", "cloudflare_workers"),
        ]));
        assert_eq!(v.slug, "cloudflare-workers");
        assert_eq!(v.category, VendorCategory::Runtime);

        let v = canonicalize_vendor(&attrs(&[("service.name", "cursor-proxy")]));
        assert_eq!(v.slug, "cursor");
        assert_eq!(v.category, VendorCategory::Ide);
    }

    #[test]
    fn gen_ai_system_maps_to_llm() {
        let v = canonicalize_vendor(&attrs(&[
            ("service.name", "toolmeter-proxy"),
            ("gen_ai.system", "OpenAI"),
        ]));
        assert_eq!(v.slug, "openai");
        assert_eq!(v.category, VendorCategory::Llm);
    }

    #[test]
    fn mcp_server_is_tool_server() {
        let v = canonicalize_vendor(&attrs(&[("mcp.server.name", "github")]));
        assert_eq!(v.category, VendorCategory::ToolServer);
    }

    #[test]
    fn custom_rule_order_is_respected() {
        let rules = [
            rule(Present("a"), "first", "First", Llm),
            rule(Present("a"), "second", "Second", Ide),
        ];
        let v = canonicalize_with(&rules, &attrs(&[("a", "1")]));
        assert_eq!(v.slug, "first");
    }

    #[test]
    fn slugify_collapses_runs() {
        assert_eq!(slugify("  Foo__Bar--Baz  "), "foo-bar-baz");
        assert_eq!(slugify("ÄI Tool 2"), "i-tool-2");
        assert_eq!(slugify("---"), "");
    }
}
