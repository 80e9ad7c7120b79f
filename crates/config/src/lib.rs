//! Configuration loading, validation, and management for Parley.
//!
//! Loads configuration from `~/.parley/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// The root configuration structure.
///
/// Maps directly to `~/.parley/config.toml`.
#[derive(Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// API key for the chat-completions endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Base URL of an OpenAI-compatible endpoint
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Name reported by the provider in logs
    #[serde(default = "default_provider_name")]
    pub provider_name: String,

    /// Model used for planning and synthesis
    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Max tokens per LLM response
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Pipeline behaviour
    #[serde(default)]
    pub engine: EngineConfig,

    /// Persona and prompt templates
    #[serde(default)]
    pub persona: PersonaConfig,
}

fn default_api_url() -> String {
    "https://api.openai.com/v1".into()
}
fn default_provider_name() -> String {
    "openai".into()
}
fn default_model() -> String {
    "gpt-4o-mini".into()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    2048
}
fn default_true() -> bool {
    true
}

/// Redact a secret for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("api_key", &redact(&self.api_key))
            .field("api_url", &self.api_url)
            .field("provider_name", &self.provider_name)
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("engine", &self.engine)
            .field("persona", &self.persona)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Tool rounds per turn. 0 = pure conversational mode.
    #[serde(default = "default_max_rounds")]
    pub max_rounds: u32,

    #[serde(default = "default_true")]
    pub reflection_enabled: bool,

    #[serde(default = "default_true")]
    pub streaming_enabled: bool,

    /// Per-call timeout inside a dispatch batch
    #[serde(default = "default_tool_timeout")]
    pub tool_timeout_secs: u64,

    /// Per-observer delivery timeout
    #[serde(default = "default_observer_timeout")]
    pub observer_timeout_secs: u64,

    /// How many recent messages the link pre-scan inspects
    #[serde(default = "default_scan_depth")]
    pub heuristic_scan_depth: usize,

    /// Capabilities the planner may use
    #[serde(default = "default_enabled_capabilities")]
    pub enabled_capabilities: Vec<String>,

    /// Capability that receives detected video links
    #[serde(default = "default_video_capability")]
    pub video_capability: String,

    /// Keyword rules used when the planning model is unavailable, in priority order
    #[serde(default = "default_fallback_rules")]
    pub fallback: Vec<FallbackRule>,
}

fn default_max_rounds() -> u32 {
    3
}
fn default_tool_timeout() -> u64 {
    60
}
fn default_observer_timeout() -> u64 {
    10
}
fn default_scan_depth() -> usize {
    6
}
fn default_video_capability() -> String {
    "summarize_video".into()
}
fn default_enabled_capabilities() -> Vec<String> {
    vec![
        "web_search".into(),
        "set_reminder".into(),
        default_video_capability(),
    ]
}
fn default_fallback_rules() -> Vec<FallbackRule> {
    vec![
        FallbackRule {
            capability: "set_reminder".into(),
            keywords: vec!["remind me".into(), "reminder".into()],
        },
        FallbackRule {
            capability: "web_search".into(),
            keywords: vec![
                "search".into(),
                "look up".into(),
                "latest".into(),
                "news".into(),
                "today".into(),
            ],
        },
    ]
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_rounds: default_max_rounds(),
            reflection_enabled: true,
            streaming_enabled: true,
            tool_timeout_secs: default_tool_timeout(),
            observer_timeout_secs: default_observer_timeout(),
            heuristic_scan_depth: default_scan_depth(),
            enabled_capabilities: default_enabled_capabilities(),
            video_capability: default_video_capability(),
            fallback: default_fallback_rules(),
        }
    }
}

/// Keyword rule for the planning fallback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackRule {
    pub capability: String,
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonaConfig {
    /// Persona used when the inbound message does not name one
    #[serde(default = "default_persona")]
    pub default_persona: String,

    /// Instructions used for personas without an entry in `instructions`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_instructions: Option<String>,

    /// Persona name → system instructions
    #[serde(default)]
    pub instructions: HashMap<String, String>,

    /// Named prompt templates (`planning`, ...) with `{placeholder}` syntax
    #[serde(default)]
    pub templates: HashMap<String, String>,
}

fn default_persona() -> String {
    "default".into()
}

impl Default for PersonaConfig {
    fn default() -> Self {
        Self {
            default_persona: default_persona(),
            default_instructions: None,
            instructions: HashMap::new(),
            templates: HashMap::new(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the default path (~/.parley/config.toml).
    ///
    /// Environment overrides:
    /// - `PARLEY_API_KEY`, then `OPENAI_API_KEY` (when no key is configured)
    /// - `PARLEY_API_URL`
    /// - `PARLEY_MODEL`
    /// - `PARLEY_MAX_ROUNDS`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides through `lookup` (injectable for tests).
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if self.api_key.is_none() {
            self.api_key = lookup("PARLEY_API_KEY").or_else(|| lookup("OPENAI_API_KEY"));
        }
        if let Some(url) = lookup("PARLEY_API_URL") {
            self.api_url = url;
        }
        if let Some(model) = lookup("PARLEY_MODEL") {
            self.model = model;
        }
        if let Some(raw) = lookup("PARLEY_MAX_ROUNDS") {
            match raw.parse() {
                Ok(rounds) => self.engine.max_rounds = rounds,
                Err(_) => tracing::warn!(value = %raw, "Ignoring invalid PARLEY_MAX_ROUNDS"),
            }
        }
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".parley")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(ConfigError::ValidationError(
                "temperature must be between 0.0 and 2.0".into(),
            ));
        }
        if self.engine.tool_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "engine.tool_timeout_secs must be > 0".into(),
            ));
        }
        if self.engine.observer_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "engine.observer_timeout_secs must be > 0".into(),
            ));
        }
        if self.persona.default_persona.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "persona.default_persona must not be empty".into(),
            ));
        }
        if let Some(rule) = self
            .engine
            .fallback
            .iter()
            .find(|r| r.keywords.iter().any(|k| k.trim().is_empty()))
        {
            return Err(ConfigError::ValidationError(format!(
                "engine.fallback rule for '{}' has an empty keyword",
                rule.capability
            )));
        }
        Ok(())
    }

    /// Check if an API key is available (from config or environment).
    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    /// Render the default config as TOML (for `parley init`).
    pub fn default_toml() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_url: default_api_url(),
            provider_name: default_provider_name(),
            model: default_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            engine: EngineConfig::default(),
            persona: PersonaConfig::default(),
        }
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.engine.max_rounds, 3);
        assert!(config.engine.reflection_enabled);
        assert_eq!(config.engine.video_capability, "summarize_video");
    }

    #[test]
    fn config_roundtrip_toml() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: AppConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.model, config.model);
        assert_eq!(parsed.engine.fallback, config.engine.fallback);
    }

    #[test]
    fn invalid_temperature_rejected() {
        let config = AppConfig {
            temperature: 5.0,
            ..AppConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_tool_timeout_rejected() {
        let mut config = AppConfig::default();
        config.engine.tool_timeout_secs = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(msg)) if msg.contains("tool_timeout_secs")
        ));
    }

    #[test]
    fn missing_config_file_returns_defaults() {
        let config = AppConfig::load_from(Path::new("/nonexistent/config.toml")).unwrap();
        assert_eq!(config.provider_name, "openai");
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
model = "local-model"

[engine]
max_rounds = 0
streaming_enabled = false

[[engine.fallback]]
capability = "web_search"
keywords = ["find"]

[persona]
default_persona = "tutor"

[persona.instructions]
tutor = "Explain step by step."

[persona.templates]
planning = "Round {round}; tools: {capabilities}"
"#,
        )
        .unwrap();

        let config = AppConfig::load_from(&path).unwrap();
        assert_eq!(config.model, "local-model");
        assert_eq!(config.engine.max_rounds, 0);
        assert!(!config.engine.streaming_enabled);
        assert!(config.engine.reflection_enabled);
        assert_eq!(config.engine.fallback.len(), 1);
        assert_eq!(config.persona.default_persona, "tutor");
        assert!(config.persona.templates.contains_key("planning"));
    }

    #[test]
    fn unparseable_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "engine = [this is not toml").unwrap();
        assert!(matches!(
            AppConfig::load_from(&path),
            Err(ConfigError::ParseError { .. })
        ));
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = AppConfig::default();
        config.apply_env(|key| match key {
            "OPENAI_API_KEY" => Some("sk-test".into()),
            "PARLEY_MODEL" => Some("other-model".into()),
            "PARLEY_MAX_ROUNDS" => Some("5".into()),
            _ => None,
        });
        assert_eq!(config.api_key.as_deref(), Some("sk-test"));
        assert_eq!(config.model, "other-model");
        assert_eq!(config.engine.max_rounds, 5);
    }

    #[test]
    fn invalid_env_rounds_are_ignored() {
        let mut config = AppConfig::default();
        config.apply_env(|key| (key == "PARLEY_MAX_ROUNDS").then(|| "many".to_string()));
        assert_eq!(config.engine.max_rounds, 3);
    }

    #[test]
    fn debug_redacts_api_key() {
        let config = AppConfig {
            api_key: Some("sk-very-secret".into()),
            ..AppConfig::default()
        };
        let debug = format!("{config:?}");
        assert!(!debug.contains("sk-very-secret"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn default_toml_generation() {
        let toml_str = AppConfig::default_toml();
        assert!(toml_str.contains("gpt-4o-mini"));
        assert!(toml_str.contains("max_rounds"));
    }
}
