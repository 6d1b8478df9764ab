use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::error::LlmError;

const PROVIDERS_JSON: &str = include_str!("providers.json");

/// Environment variable naming the provider used when none is given explicitly.
pub const PROVIDER_ENV: &str = "AI_PROVIDER";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRegistry {
    pub providers: Vec<ProviderDef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderDef {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    pub api_format: ApiFormat,
    pub base_url: String,
    pub auth: AuthConfig,
    pub default_model: String,
    /// Credential lookups, most specific first.
    #[serde(default)]
    pub api_key_env: Vec<String>,
    #[serde(default)]
    pub model_env: Vec<String>,
    #[serde(default)]
    pub base_url_env: Vec<String>,
    #[serde(default)]
    pub extra_headers: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiFormat {
    Openai,
    Gemini,
    Anthropic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(rename = "type")]
    pub auth_type: AuthType,
    #[serde(default)]
    pub param_name: Option<String>,
    /// Custom header name for the API key (defaults to "Authorization" with "Bearer " prefix for bearer type)
    #[serde(default)]
    pub header_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    Bearer,
    QueryParam,
    /// Raw header: sends the key as-is in the header specified by `header_name`
    Header,
}

/// Credential and endpoint for one provider after explicit options and environment are merged.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedEndpoint {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
}

impl ProviderRegistry {
    pub fn load() -> Result<Self, LlmError> {
        serde_json::from_str(PROVIDERS_JSON)
            .map_err(|e| LlmError::configuration("registry", format!("providers.json is invalid: {}", e)))
    }

    pub fn get_provider(&self, id: &str) -> Option<&ProviderDef> {
        let normalized = id.trim().to_lowercase();
        self.providers.iter().find(|p| {
            p.id == normalized
                || p.name.to_lowercase() == normalized
                || p.aliases.iter().any(|a| *a == normalized)
        })
    }
}

impl ProviderDef {
    /// Resolves credential, model and base URL: explicit value, then the env lookups in order,
    /// then the registry default. A missing credential is a configuration error.
    pub fn resolve<F>(
        &self,
        api_key: Option<&str>,
        model: Option<&str>,
        lookup: F,
    ) -> Result<ResolvedEndpoint, LlmError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let first_set = |names: &[String]| {
            names
                .iter()
                .filter_map(|name| lookup(name))
                .map(|v| v.trim().to_string())
                .find(|v| !v.is_empty())
        };

        let api_key = api_key
            .map(str::to_string)
            .filter(|k| !k.trim().is_empty())
            .or_else(|| first_set(&self.api_key_env))
            .ok_or_else(|| {
                LlmError::configuration(
                    &self.id,
                    format!("set one of {} to an API key", self.api_key_env.join(", ")),
                )
            })?;

        let model = model
            .map(str::to_string)
            .filter(|m| !m.trim().is_empty())
            .or_else(|| first_set(&self.model_env))
            .unwrap_or_else(|| self.default_model.clone());

        let base_url = first_set(&self.base_url_env).unwrap_or_else(|| self.base_url.clone());

        Ok(ResolvedEndpoint {
            api_key,
            model,
            base_url,
        })
    }
}
