//! Engine configuration.
//!
//! Resolution, lowest to highest precedence:
//!   1. built-in defaults
//!   2. `config.toml` (`~/.config/mindmap/config.toml` unless a path is given)
//!   3. `MINDMAP_*` environment variables

use crate::summarize::DEFAULT_MAX_NODES;
use crate::{MindmapError, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

pub const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_millis(60_000);
pub const DEFAULT_RETRY_COUNT: u32 = 2;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(2_000);
pub const DEFAULT_EVENT_CAPACITY: usize = 64;

const DEFAULT_PROVIDER: &str = "openai";
const DEFAULT_MODEL: &str = "gpt-4.1";

/// Providers served locally that need no API key
const KEYLESS_PROVIDERS: &[&str] = &["ollama", "lmstudio"];

/// Which model the generator calls and how to reach it
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSettings {
    pub provider: String,
    pub model: String,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            provider: DEFAULT_PROVIDER.to_string(),
            model: DEFAULT_MODEL.to_string(),
            api_key: None,
            base_url: None,
        }
    }
}

impl ModelSettings {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            api_key: None,
            base_url: None,
        }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn requires_api_key(&self) -> bool {
        !KEYLESS_PROVIDERS.contains(&self.provider.to_lowercase().as_str())
    }

    /// Fail with `Configuration` when no usable model is configured.
    pub fn validate(&self) -> Result<()> {
        if self.provider.trim().is_empty() || self.model.trim().is_empty() {
            return Err(MindmapError::Configuration(
                "no model provider/model configured".to_string(),
            ));
        }
        let has_key = self
            .api_key
            .as_deref()
            .map(|k| !k.trim().is_empty())
            .unwrap_or(false);
        if self.requires_api_key() && !has_key {
            return Err(MindmapError::Configuration(format!(
                "no API key configured for provider '{}'",
                self.provider
            )));
        }
        Ok(())
    }
}

/// Configuration for the mindmap engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Time between scheduled update cycles
    pub update_interval: Duration,

    /// Extra generation attempts after the first failure
    pub retry_count: u32,

    /// Pause between generation attempts
    pub retry_delay: Duration,

    /// Node budget before the oldest nodes are collapsed
    pub max_nodes: usize,

    /// Buffered events per subscriber
    pub event_capacity: usize,

    /// Root for session records and transcripts (CLI backends)
    pub data_dir: PathBuf,

    pub model: ModelSettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            update_interval: DEFAULT_UPDATE_INTERVAL,
            retry_count: DEFAULT_RETRY_COUNT,
            retry_delay: DEFAULT_RETRY_DELAY,
            max_nodes: DEFAULT_MAX_NODES,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            data_dir: default_data_dir(),
            model: ModelSettings::default(),
        }
    }
}

/// Partial config.toml
#[derive(Debug, Default, Deserialize)]
struct ConfigToml {
    update_interval_ms: Option<u64>,
    retry_count: Option<u32>,
    retry_delay_ms: Option<u64>,
    max_nodes: Option<usize>,
    event_capacity: Option<usize>,
    data_dir: Option<PathBuf>,
    model: Option<ModelToml>,
}

#[derive(Debug, Default, Deserialize)]
struct ModelToml {
    provider: Option<String>,
    model: Option<String>,
    api_key: Option<String>,
    base_url: Option<String>,
}

impl EngineConfig {
    pub fn with_update_interval(mut self, interval: Duration) -> Self {
        self.update_interval = interval;
        self
    }

    pub fn with_retry(mut self, count: u32, delay: Duration) -> Self {
        self.retry_count = count;
        self.retry_delay = delay;
        self
    }

    pub fn with_max_nodes(mut self, max_nodes: usize) -> Self {
        self.max_nodes = max_nodes;
        self
    }

    pub fn with_data_dir(mut self, dir: PathBuf) -> Self {
        self.data_dir = dir;
        self
    }

    pub fn with_model(mut self, model: ModelSettings) -> Self {
        self.model = model;
        self
    }

    /// Load defaults, then the TOML file (if present), then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default();

        let path = path.map(Path::to_path_buf).or_else(default_config_path);
        if let Some(path) = path.filter(|p| p.exists()) {
            let content = std::fs::read_to_string(&path)?;
            config.apply_toml(&content)?;
            info!("Loaded config from {}", path.display());
        }

        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn apply_toml(&mut self, content: &str) -> Result<()> {
        let parsed: ConfigToml = toml::from_str(content)
            .map_err(|e| MindmapError::Configuration(format!("invalid config.toml: {}", e)))?;

        if let Some(ms) = parsed.update_interval_ms {
            self.update_interval = Duration::from_millis(ms);
        }
        if let Some(count) = parsed.retry_count {
            self.retry_count = count;
        }
        if let Some(ms) = parsed.retry_delay_ms {
            self.retry_delay = Duration::from_millis(ms);
        }
        if let Some(max) = parsed.max_nodes {
            self.max_nodes = max;
        }
        if let Some(cap) = parsed.event_capacity {
            self.event_capacity = cap.max(1);
        }
        if let Some(dir) = parsed.data_dir {
            self.data_dir = dir;
        }
        if let Some(model) = parsed.model {
            if let Some(provider) = model.provider {
                self.model.provider = provider;
            }
            if let Some(name) = model.model {
                self.model.model = name;
            }
            if model.api_key.is_some() {
                self.model.api_key = model.api_key;
            }
            if model.base_url.is_some() {
                self.model.base_url = model.base_url;
            }
        }
        Ok(())
    }

    /// Apply `MINDMAP_*` overrides read through `lookup`.
    fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let number = |key: &str| -> Option<u64> {
            let raw = lookup(key)?;
            match raw.trim().parse::<u64>() {
                Ok(n) => Some(n),
                Err(_) => {
                    debug!("Ignoring non-numeric {}={}", key, raw);
                    None
                }
            }
        };

        if let Some(ms) = number("MINDMAP_UPDATE_INTERVAL_MS") {
            self.update_interval = Duration::from_millis(ms);
        }
        if let Some(count) = number("MINDMAP_RETRY_COUNT") {
            match u32::try_from(count) {
                Ok(count) => self.retry_count = count,
                Err(_) => debug!("Ignoring out-of-range MINDMAP_RETRY_COUNT={}", count),
            }
        }
        if let Some(ms) = number("MINDMAP_RETRY_DELAY_MS") {
            self.retry_delay = Duration::from_millis(ms);
        }
        if let Some(max) = number("MINDMAP_MAX_NODES") {
            match usize::try_from(max) {
                Ok(max) => self.max_nodes = max,
                Err(_) => debug!("Ignoring out-of-range MINDMAP_MAX_NODES={}", max),
            }
        }
        if let Some(dir) = lookup("MINDMAP_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(provider) = lookup("MINDMAP_PROVIDER") {
            self.model.provider = provider;
        }
        if let Some(model) = lookup("MINDMAP_MODEL") {
            self.model.model = model;
        }
        if let Some(url) = lookup("MINDMAP_BASE_URL") {
            self.model.base_url = Some(url);
        }

        let provider_key = match self.model.provider.to_lowercase().as_str() {
            "openai" => lookup("OPENAI_API_KEY"),
            "gemini" | "google" => lookup("GEMINI_API_KEY"),
            _ => None,
        };
        if let Some(key) = lookup("MINDMAP_API_KEY").or(provider_key) {
            self.model.api_key = Some(key);
        }
    }
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("mindmap").join("config.toml"))
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("mindmap"))
        .unwrap_or_else(|| PathBuf::from(".mindmap"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.update_interval, Duration::from_millis(60_000));
        assert_eq!(config.retry_count, 2);
        assert_eq!(config.retry_delay, Duration::from_millis(2_000));
        assert_eq!(config.max_nodes, 200);
    }

    #[test]
    fn test_toml_then_env_precedence() {
        let mut config = EngineConfig::default();
        config
            .apply_toml(
                r#"
                update_interval_ms = 30000
                max_nodes = 50

                [model]
                provider = "gemini"
                model = "gemini-2.5-flash"
                api_key = "from-file"
                "#,
            )
            .unwrap();

        let env: HashMap<&str, &str> = HashMap::from([
            ("MINDMAP_MAX_NODES", "75"),
            ("MINDMAP_RETRY_DELAY_MS", "oops"),
            ("GEMINI_API_KEY", "from-env"),
        ]);
        config.apply_env(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.update_interval, Duration::from_millis(30_000));
        assert_eq!(config.max_nodes, 75);
        assert_eq!(config.retry_delay, DEFAULT_RETRY_DELAY);
        assert_eq!(config.model.provider, "gemini");
        assert_eq!(config.model.api_key.as_deref(), Some("from-env"));
    }

    #[test]
    fn test_out_of_range_env_numbers_are_ignored() {
        let mut config = EngineConfig::default();
        let env: HashMap<&str, String> = HashMap::from([
            ("MINDMAP_RETRY_COUNT", (u64::from(u32::MAX) + 1).to_string()),
            ("MINDMAP_MAX_NODES", "99999999999999999999".to_string()),
        ]);
        config.apply_env(|k| env.get(k).cloned());

        assert_eq!(config.retry_count, DEFAULT_RETRY_COUNT);
        assert_eq!(config.max_nodes, DEFAULT_MAX_NODES);

        let env: HashMap<&str, String> =
            HashMap::from([("MINDMAP_RETRY_COUNT", u32::MAX.to_string())]);
        config.apply_env(|k| env.get(k).cloned());
        assert_eq!(config.retry_count, u32::MAX);
    }

    #[test]
    fn test_invalid_toml_is_configuration_error() {
        let mut config = EngineConfig::default();
        let err = config.apply_toml("max_nodes = \"many\"").unwrap_err();
        assert!(matches!(err, MindmapError::Configuration(_)));
    }

    #[test]
    fn test_model_validation() {
        assert!(ModelSettings::default().validate().is_err());
        assert!(ModelSettings::default().with_api_key("sk-test").validate().is_ok());
        assert!(ModelSettings::new("ollama", "llama3").validate().is_ok());
        assert!(ModelSettings::new("openai", "").with_api_key("k").validate().is_err());
        assert!(ModelSettings::new("openai", "gpt-4.1").with_api_key("  ").validate().is_err());
    }
}
