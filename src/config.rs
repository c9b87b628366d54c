//! Process-wide configuration.
//!
//! The LLM provider is a process-wide singleton that users can reconfigure
//! at runtime. All mutation is concentrated in exactly two transitions,
//! `switch_to_ollama` and `update_cloud_config`; each bumps a generation
//! counter so cached clients rebuild lazily and the context-window budget is
//! recomputed.

use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::FabulaError;

/// Wire format of a cloud provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CloudFormat {
    Anthropic,
    #[default]
    #[serde(other)]
    Openai,
}

/// LLM provider configuration; the tagged variants mirror the concrete
/// clients (selection happens at configuration time, not per call).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "provider", rename_all = "snake_case")]
pub enum LlmProviderConfig {
    /// Local Ollama server.
    Ollama {
        #[serde(default = "default_ollama_url")]
        base_url: String,
        #[serde(default = "default_ollama_model")]
        model: String,
        /// Context window in tokens, passed through to the server.
        #[serde(default = "default_num_ctx")]
        num_ctx: u32,
    },
    /// Cloud endpoint, OpenAI-compatible or Anthropic wire format.
    Cloud {
        base_url: String,
        api_key: String,
        model: String,
        #[serde(default)]
        format: CloudFormat,
        #[serde(default = "default_max_tokens")]
        max_tokens: u32,
    },
}

fn default_ollama_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_ollama_model() -> String {
    "qwen2.5:14b".to_string()
}

fn default_num_ctx() -> u32 {
    8192
}

fn default_max_tokens() -> u32 {
    8192
}

impl Default for LlmProviderConfig {
    fn default() -> Self {
        LlmProviderConfig::Ollama {
            base_url: default_ollama_url(),
            model: default_ollama_model(),
            num_ctx: default_num_ctx(),
        }
    }
}

impl LlmProviderConfig {
    pub fn is_cloud(&self) -> bool {
        matches!(self, LlmProviderConfig::Cloud { .. })
    }

    pub fn model_name(&self) -> &str {
        match self {
            LlmProviderConfig::Ollama { model, .. } => model,
            LlmProviderConfig::Cloud { model, .. } => model,
        }
    }

    /// Context-summary character budget for this provider tier.
    pub fn context_summary_chars(&self) -> usize {
        if self.is_cloud() {
            18_000
        } else {
            6_000
        }
    }

    /// Approximate character budget for one extraction prompt (system +
    /// context + chapter text). Cloud models get a fixed generous window;
    /// local models derive it from `num_ctx` at ~1.5 chars per CJK token.
    pub fn prompt_char_budget(&self) -> usize {
        match self {
            LlmProviderConfig::Ollama { num_ctx, .. } => (*num_ctx as usize).saturating_mul(3) / 2,
            LlmProviderConfig::Cloud { .. } => 120_000,
        }
    }
}

/// Solver tunables surfaced in the settings file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolverSettings {
    /// Weight of the storyline-axis energy term. Kept low so the
    /// constraint terms dominate.
    #[serde(default = "default_narrative_weight")]
    pub narrative_weight: f64,
    /// Per-region optimizer budget in milliseconds.
    #[serde(default = "default_solver_budget_ms")]
    pub time_budget_ms: u64,
}

fn default_narrative_weight() -> f64 {
    0.4
}

fn default_solver_budget_ms() -> u64 {
    3_000
}

impl Default for SolverSettings {
    fn default() -> Self {
        SolverSettings {
            narrative_weight: default_narrative_weight(),
            time_budget_ms: default_solver_budget_ms(),
        }
    }
}

/// On-disk settings: `{data_dir}/settings.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub llm: LlmProviderConfig,
    #[serde(default)]
    pub solver: SolverSettings,
    /// Max concurrent cloud LLM calls across all tasks.
    #[serde(default = "default_cloud_concurrency")]
    pub cloud_concurrency: usize,
    /// Embedding endpoint; empty disables the semantic index.
    #[serde(default)]
    pub embedding_base_url: String,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
}

fn default_cloud_concurrency() -> usize {
    3
}

fn default_embedding_model() -> String {
    "nomic-embed-text".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            llm: LlmProviderConfig::default(),
            solver: SolverSettings::default(),
            cloud_concurrency: default_cloud_concurrency(),
            embedding_base_url: String::new(),
            embedding_model: default_embedding_model(),
        }
    }
}

/// Resolve the data directory: `FABULA_DATA_DIR` env var, else the platform
/// data dir, else `./fabula-data`.
pub fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("FABULA_DATA_DIR") {
        return PathBuf::from(dir);
    }
    dirs::data_dir()
        .map(|d| d.join("fabula"))
        .unwrap_or_else(|| PathBuf::from("fabula-data"))
}

/// Load settings with priority: `{data_dir}/settings.toml` file, else default.
pub fn load_settings(data_path: &Path) -> Settings {
    let config_path = data_path.join("settings.toml");
    if config_path.exists() {
        match std::fs::read_to_string(&config_path) {
            Ok(contents) => match toml::from_str::<Settings>(&contents) {
                Ok(settings) => {
                    info!("Loaded settings from {}", config_path.display());
                    return settings;
                }
                Err(e) => {
                    warn!(
                        "Failed to parse {}: {}. Using defaults.",
                        config_path.display(),
                        e
                    );
                }
            },
            Err(e) => {
                warn!(
                    "Failed to read {}: {}. Using defaults.",
                    config_path.display(),
                    e
                );
            }
        }
    }
    Settings::default()
}

/// Shared, mutable LLM configuration.
///
/// Readers call [`snapshot`](LlmConfig::snapshot); the generation counter
/// lets client caches detect staleness without holding the lock.
#[derive(Debug)]
pub struct LlmConfig {
    inner: RwLock<(u64, LlmProviderConfig)>,
}

impl LlmConfig {
    pub fn new(provider: LlmProviderConfig) -> Self {
        LlmConfig {
            inner: RwLock::new((0, provider)),
        }
    }

    /// Current (generation, provider) pair.
    pub fn snapshot(&self) -> (u64, LlmProviderConfig) {
        let guard = self
            .inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.clone()
    }

    pub fn generation(&self) -> u64 {
        self.snapshot().0
    }

    pub fn provider(&self) -> LlmProviderConfig {
        self.snapshot().1
    }

    /// Transition to a local Ollama provider.
    pub fn switch_to_ollama(&self, base_url: String, model: String, num_ctx: u32) {
        let mut guard = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.0 += 1;
        guard.1 = LlmProviderConfig::Ollama {
            base_url,
            model,
            num_ctx,
        };
        info!(model = %guard.1.model_name(), "Switched LLM provider to ollama");
    }

    /// Transition to a cloud provider.
    pub fn update_cloud_config(
        &self,
        base_url: String,
        api_key: String,
        model: String,
        format: CloudFormat,
        max_tokens: u32,
    ) -> Result<(), FabulaError> {
        if base_url.is_empty() || api_key.is_empty() || model.is_empty() {
            return Err(FabulaError::Config(
                "cloud config requires base_url, api_key and model".to_string(),
            ));
        }
        let mut guard = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.0 += 1;
        guard.1 = LlmProviderConfig::Cloud {
            base_url,
            api_key,
            model,
            format,
            max_tokens,
        };
        info!(model = %guard.1.model_name(), "Updated cloud LLM config");
        Ok(())
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        LlmConfig::new(LlmProviderConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions_bump_generation() {
        let config = LlmConfig::default();
        assert_eq!(config.generation(), 0);

        config.switch_to_ollama("http://localhost:11434".into(), "qwen2.5:7b".into(), 4096);
        assert_eq!(config.generation(), 1);

        config
            .update_cloud_config(
                "https://api.example.com".into(),
                "sk-test".into(),
                "some-model".into(),
                CloudFormat::Openai,
                8192,
            )
            .unwrap();
        assert_eq!(config.generation(), 2);
        assert!(config.provider().is_cloud());
    }

    #[test]
    fn test_cloud_config_rejects_missing_fields() {
        let config = LlmConfig::default();
        let err = config.update_cloud_config(
            String::new(),
            "key".into(),
            "model".into(),
            CloudFormat::Anthropic,
            4096,
        );
        assert!(err.is_err());
        assert_eq!(config.generation(), 0);
    }

    #[test]
    fn test_context_budgets_by_tier() {
        let local = LlmProviderConfig::default();
        assert_eq!(local.context_summary_chars(), 6_000);
        let cloud = LlmProviderConfig::Cloud {
            base_url: "https://api.example.com".into(),
            api_key: "k".into(),
            model: "m".into(),
            format: CloudFormat::Openai,
            max_tokens: 8192,
        };
        assert_eq!(cloud.context_summary_chars(), 18_000);
    }

    #[test]
    fn test_settings_parse_roundtrip() {
        let toml_src = r#"
            cloud_concurrency = 5

            [llm]
            provider = "ollama"
            model = "qwen2.5:32b"

            [solver]
            narrative_weight = 0.6
        "#;
        let settings: Settings = toml::from_str(toml_src).unwrap();
        assert_eq!(settings.cloud_concurrency, 5);
        assert_eq!(settings.llm.model_name(), "qwen2.5:32b");
        assert!((settings.solver.narrative_weight - 0.6).abs() < 1e-9);
    }
}
