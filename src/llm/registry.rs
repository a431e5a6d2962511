//! Model registry for managing available LLM providers

use super::{AnthropicClient, LlmClient};
use std::collections::HashMap;
use std::sync::Arc;

/// `(model id, Anthropic API model name)` pairs offered when an API key
/// or gateway is configured
const ANTHROPIC_MODELS: &[(&str, &str)] = &[
    ("claude-sonnet", "claude-sonnet-4-5-20250929"),
    ("claude-haiku", "claude-haiku-4-5-20251001"),
];

/// Configuration for LLM providers
#[derive(Debug, Clone, Default)]
pub struct LlmConfig {
    pub anthropic_api_key: Option<String>,
    /// Gateway URL that terminates provider auth
    pub gateway: Option<String>,
    /// Default model ID
    pub default_model: Option<String>,
}

impl LlmConfig {
    pub fn from_env() -> Self {
        Self {
            anthropic_api_key: std::env::var("ANTHROPIC_API_KEY").ok(),
            gateway: std::env::var("LLM_GATEWAY").ok(),
            default_model: std::env::var("DEFAULT_MODEL").ok(),
        }
    }
}

/// Registry of available LLM models
pub struct ModelRegistry {
    clients: HashMap<String, Arc<dyn LlmClient>>,
    default_model: String,
}

impl ModelRegistry {
    pub fn new(config: &LlmConfig) -> Self {
        let mut clients: HashMap<String, Arc<dyn LlmClient>> = HashMap::new();

        // In gateway mode the gateway owns authentication
        let api_key = if config.gateway.is_some() {
            Some("implicit".to_string())
        } else {
            config.anthropic_api_key.clone().filter(|k| !k.is_empty())
        };

        if let Some(key) = api_key {
            for (model_id, api_model) in ANTHROPIC_MODELS {
                clients.insert(
                    (*model_id).to_string(),
                    Arc::new(AnthropicClient::new(
                        key.clone(),
                        *model_id,
                        *api_model,
                        config.gateway.as_deref(),
                    )),
                );
            }
        }

        let default_model = config
            .default_model
            .clone()
            .or_else(|| {
                clients
                    .contains_key("claude-sonnet")
                    .then(|| "claude-sonnet".to_string())
                    .or_else(|| clients.keys().next().cloned())
            })
            .unwrap_or_else(|| "claude-sonnet".to_string());

        Self {
            clients,
            default_model,
        }
    }

    /// Get a model by ID, falling back to the default
    pub fn get(&self, model_id: &str) -> Option<Arc<dyn LlmClient>> {
        self.clients
            .get(model_id)
            .or_else(|| self.clients.get(&self.default_model))
            .cloned()
    }

    pub fn default_model_id(&self) -> &str {
        &self.default_model
    }

    pub fn has_models(&self) -> bool {
        !self.clients.is_empty()
    }

    pub fn available_models(&self) -> Vec<String> {
        let mut models: Vec<_> = self.clients.keys().cloned().collect();
        models.sort();
        models
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_without_key() {
        let registry = ModelRegistry::new(&LlmConfig::default());
        assert!(!registry.has_models());
        assert!(registry.get("claude-sonnet").is_none());
    }

    #[test]
    fn test_gateway_mode_registers_models() {
        let registry = ModelRegistry::new(&LlmConfig {
            gateway: Some("http://gateway.internal".to_string()),
            ..Default::default()
        });
        assert!(registry.has_models());
        assert_eq!(registry.default_model_id(), "claude-sonnet");
        // Unknown ids fall back to the default model
        assert!(registry.get("no-such-model").is_some());
    }
}
