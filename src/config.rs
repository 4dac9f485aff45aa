use std::collections::HashMap;
use std::env;
use std::path::Path;

use serde::Deserialize;

use crate::error::DuhError;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub enabled: bool,
    pub api_key: Option<String>,
    pub api_key_env: Option<String>,
    pub base_url: Option<String>,
    pub default_model: Option<String>,
    pub models: Vec<String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_key: None,
            api_key_env: None,
            base_url: None,
            default_model: None,
            models: Vec::new(),
        }
    }
}

impl ProviderConfig {
    /// Resolves the live API key: an inline `api_key` wins, otherwise the
    /// environment variable named by `api_key_env` is read. `None` if
    /// neither is set or the named variable is absent.
    pub fn resolve_api_key(&self) -> Option<String> {
        self.api_key.clone().or_else(|| self.api_key_env.as_deref().and_then(|name| env::var(name).ok()))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    pub panel: Vec<String>,
    pub proposer_strategy: String,
    pub challenge_types: Vec<String>,
    pub min_challengers: usize,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            panel: Vec::new(),
            proposer_strategy: "round_robin".to_string(),
            challenge_types: vec![
                "flaw".to_string(),
                "alternative".to_string(),
                "risk".to_string(),
                "devils_advocate".to_string(),
            ],
            min_challengers: 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CostConfig {
    pub warn_threshold: f64,
    pub hard_limit: f64,
}

impl Default for CostConfig {
    fn default() -> Self {
        Self {
            warn_threshold: 1.00,
            hard_limit: 10.00,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub enabled: bool,
    pub max_rounds: u32,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_rounds: crate::tools::DEFAULT_MAX_TOOL_ROUNDS,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VotingConfig {
    pub enabled: bool,
    pub aggregation: String,
}

impl Default for VotingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            aggregation: "majority".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DecomposeConfig {
    pub max_subtasks: usize,
    pub parallel: bool,
}

impl Default for DecomposeConfig {
    fn default() -> Self {
        Self {
            max_subtasks: crate::decompose::DEFAULT_MAX_SUBTASKS,
            parallel: true,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TaxonomyConfig {
    pub enabled: bool,
    pub model_ref: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    pub max_rounds: u32,
    pub protocol: String,
    pub decompose: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            max_rounds: 3,
            protocol: "consensus".to_string(),
            decompose: false,
        }
    }
}

/// Top-level configuration, assembled once at process startup: a
/// `duh.toml` file (if present) supplies non-secret settings, and
/// per-provider secrets resolve from the environment via `api_key_env`.
/// Never reloaded mid-session.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DuhConfig {
    pub general: GeneralConfig,
    pub cost: CostConfig,
    pub providers: HashMap<String, ProviderConfig>,
    pub consensus: ConsensusConfig,
    pub tools: ToolsConfig,
    pub voting: VotingConfig,
    pub decompose: DecomposeConfig,
    pub taxonomy: TaxonomyConfig,
}

impl DuhConfig {
    /// Default provider table when no `duh.toml` supplies one: the three
    /// vendors the adapter pack knows how to speak to, keyed to their
    /// conventional environment variables.
    fn default_providers() -> HashMap<String, ProviderConfig> {
        let mut providers = HashMap::new();
        providers.insert(
            "anthropic".to_string(),
            ProviderConfig {
                api_key_env: Some("ANTHROPIC_API_KEY".to_string()),
                ..ProviderConfig::default()
            },
        );
        providers.insert(
            "openai".to_string(),
            ProviderConfig {
                api_key_env: Some("OPENAI_API_KEY".to_string()),
                ..ProviderConfig::default()
            },
        );
        providers.insert(
            "google".to_string(),
            ProviderConfig {
                api_key_env: Some("GOOGLE_API_KEY".to_string()),
                ..ProviderConfig::default()
            },
        );
        providers
    }

    /// Loads `.env` (if present), then an optional `duh.toml` at `path`,
    /// falling back to defaults when the file is absent. Malformed TOML
    /// is a `Config` error; a missing file is not.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, DuhError> {
        if let Err(err) = dotenvy::dotenv() {
            if !err.not_found() {
                tracing::warn!(error = %err, "failed to load .env file");
            }
        }

        let path = path.as_ref();
        let mut config = if path.exists() {
            let body = std::fs::read_to_string(path).map_err(|e| DuhError::Config(format!("reading {}: {e}", path.display())))?;
            toml::from_str::<DuhConfig>(&body).map_err(|e| DuhError::Config(format!("parsing {}: {e}", path.display())))?
        } else {
            DuhConfig::default()
        };

        if config.providers.is_empty() {
            config.providers = Self::default_providers();
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = DuhConfig::load("/nonexistent/duh.toml").unwrap();
        assert_eq!(config.general.max_rounds, 3);
        assert_eq!(config.consensus.min_challengers, 2);
        assert!(config.providers.contains_key("anthropic"));
    }

    #[test]
    fn inline_api_key_wins_over_env() {
        let provider = ProviderConfig {
            api_key: Some("inline".to_string()),
            api_key_env: Some("DUH_TEST_NONEXISTENT_VAR".to_string()),
            ..ProviderConfig::default()
        };
        assert_eq!(provider.resolve_api_key().as_deref(), Some("inline"));
    }

    #[test]
    fn toml_overrides_defaults() {
        let dir = std::env::temp_dir().join(format!("duh-config-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("duh.toml");
        std::fs::write(&path, "[general]\nmax_rounds = 5\n[cost]\nhard_limit = 2.5\n").unwrap();
        let config = DuhConfig::load(&path).unwrap();
        assert_eq!(config.general.max_rounds, 5);
        assert_eq!(config.cost.hard_limit, 2.5);
        std::fs::remove_file(&path).ok();
    }
}
