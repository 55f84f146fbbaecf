//! Data model: `Group`, `ApiKey` and their shared enums (spec §3).

use std::collections::HashMap;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

pub type GroupId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderFamily {
    Openai,
    Gemini,
    Anthropic,
    AzureOpenai,
}

impl ProviderFamily {
    /// Infers a family from a model name via case-insensitive substring match,
    /// in the order the router's candidate-enumeration rule requires.
    pub fn infer_from_model(model: &str) -> Option<Self> {
        let lower = model.to_lowercase();
        if ["gpt", "o1", "davinci", "turbo"]
            .iter()
            .any(|needle| lower.contains(needle))
        {
            return Some(ProviderFamily::Openai);
        }
        if lower.contains("claude") {
            return Some(ProviderFamily::Anthropic);
        }
        if lower.contains("gemini") {
            return Some(ProviderFamily::Gemini);
        }
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RotationStrategy {
    #[default]
    RoundRobin,
    Random,
    LeastUsed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyValidity {
    Unknown,
    Valid,
    Invalid,
}

/// Request-parameter overrides a group applies before dispatch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestParamOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub id: GroupId,
    pub name: String,
    pub provider_family: ProviderFamily,
    pub base_url: String,
    pub enabled: bool,
    pub timeout_seconds: u64,
    pub max_retries: u32,
    pub rotation_strategy: RotationStrategy,
    pub api_keys: Vec<String>,
    /// Models this group explicitly advertises; empty means "any model of its family".
    #[serde(default)]
    pub models: Vec<String>,
    /// alias -> canonical model name, rewritten before dispatch.
    #[serde(default)]
    pub model_aliases: HashMap<String, String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub request_params: RequestParamOverrides,
    /// Whether this group's stream/non-stream dispatch returns the
    /// provider's native wire shape instead of canonical OpenAI shape.
    #[serde(default)]
    pub native_response: bool,
    /// requests-per-minute limit; `None` = unlimited.
    #[serde(default)]
    pub rpm_limit: Option<u32>,
}

impl Group {
    pub fn accepts_model(&self, model: &str) -> bool {
        self.models.iter().any(|m| m == model) || self.model_aliases.contains_key(model)
    }

    pub fn resolve_alias(&self, model: &str) -> &str {
        self.model_aliases
            .get(model)
            .map(String::as_str)
            .unwrap_or(model)
    }
}

#[derive(Debug, Clone)]
pub struct ApiKeyHealth {
    pub active: bool,
    pub usage_count: u64,
    pub error_count: u32,
    pub last_used_at: Option<SystemTime>,
    pub last_error: Option<String>,
    pub last_error_at: Option<SystemTime>,
    pub validity: KeyValidity,
    pub last_validated_at: Option<SystemTime>,
}

impl Default for ApiKeyHealth {
    fn default() -> Self {
        Self {
            active: true,
            usage_count: 0,
            error_count: 0,
            last_used_at: None,
            last_error: None,
            last_error_at: None,
            validity: KeyValidity::Unknown,
            last_validated_at: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApiKey {
    pub group_id: GroupId,
    pub order: usize,
    pub secret: String,
    pub health: ApiKeyHealth,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infers_family_case_insensitively_in_priority_order() {
        assert_eq!(
            ProviderFamily::infer_from_model("GPT-4o-mini"),
            Some(ProviderFamily::Openai)
        );
        assert_eq!(
            ProviderFamily::infer_from_model("claude-3-opus"),
            Some(ProviderFamily::Anthropic)
        );
        assert_eq!(
            ProviderFamily::infer_from_model("gemini-1.5-pro"),
            Some(ProviderFamily::Gemini)
        );
        assert_eq!(ProviderFamily::infer_from_model("llama-3"), None);
    }

    #[test]
    fn group_resolves_alias_before_dispatch() {
        let mut group = sample_group();
        group
            .model_aliases
            .insert("fast".to_string(), "gpt-4o-mini".to_string());
        assert_eq!(group.resolve_alias("fast"), "gpt-4o-mini");
        assert_eq!(group.resolve_alias("gpt-4o-mini"), "gpt-4o-mini");
    }

    fn sample_group() -> Group {
        Group {
            id: "g1".to_string(),
            name: "g1".to_string(),
            provider_family: ProviderFamily::Openai,
            base_url: "https://api.openai.com".to_string(),
            enabled: true,
            timeout_seconds: 30,
            max_retries: 0,
            rotation_strategy: RotationStrategy::RoundRobin,
            api_keys: vec!["sk-aaa".to_string()],
            models: Vec::new(),
            model_aliases: HashMap::new(),
            headers: HashMap::new(),
            request_params: RequestParamOverrides::default(),
            native_response: false,
            rpm_limit: None,
        }
    }
}
