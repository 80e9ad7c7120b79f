//! Engine settings resolved from configuration.

use std::collections::BTreeSet;
use std::time::Duration;

use parley_config::{AppConfig, PersonaConfig};
use parley_core::TemplatePrompts;
use parley_core::prompt::DEFAULT_INSTRUCTIONS;

/// Everything the nodes read at run time. Immutable for the life of an engine.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,

    /// Tool rounds per turn. 0 = pure conversational mode.
    pub max_rounds: u32,
    pub reflection_enabled: bool,
    pub streaming_enabled: bool,
    pub tool_timeout: Duration,
    pub observer_timeout: Duration,

    /// Recent messages inspected by the video-link pre-scan
    pub heuristic_scan_depth: usize,
    pub enabled_capabilities: BTreeSet<String>,
    pub video_capability: String,

    /// `(capability, keywords)` in priority order
    pub fallback_keywords: Vec<(String, Vec<String>)>,
    pub default_persona: String,
}

impl EngineSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        let engine = &config.engine;
        Self {
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: Some(config.max_tokens),
            max_rounds: engine.max_rounds,
            reflection_enabled: engine.reflection_enabled,
            streaming_enabled: engine.streaming_enabled,
            tool_timeout: Duration::from_secs(engine.tool_timeout_secs),
            observer_timeout: Duration::from_secs(engine.observer_timeout_secs),
            heuristic_scan_depth: engine.heuristic_scan_depth,
            enabled_capabilities: engine.enabled_capabilities.iter().cloned().collect(),
            video_capability: engine.video_capability.clone(),
            fallback_keywords: engine
                .fallback
                .iter()
                .map(|rule| (rule.capability.clone(), rule.keywords.clone()))
                .collect(),
            default_persona: config.persona.default_persona.clone(),
        }
    }

    pub fn is_enabled(&self, capability: &str) -> bool {
        self.enabled_capabilities.contains(capability)
    }

    pub fn with_max_rounds(mut self, max_rounds: u32) -> Self {
        self.max_rounds = max_rounds;
        self
    }

    pub fn with_reflection(mut self, enabled: bool) -> Self {
        self.reflection_enabled = enabled;
        self
    }

    pub fn with_streaming(mut self, enabled: bool) -> Self {
        self.streaming_enabled = enabled;
        self
    }

    pub fn with_tool_timeout(mut self, timeout: Duration) -> Self {
        self.tool_timeout = timeout;
        self
    }

    /// Replace the enabled-capability set.
    pub fn with_capabilities<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.enabled_capabilities = names.into_iter().map(Into::into).collect();
        self
    }

    /// Hard ceiling on router steps for one turn.
    pub fn step_ceiling(&self) -> u32 {
        self.max_rounds.saturating_mul(4).saturating_add(4)
    }
}

/// In-memory prompts from the `[persona]` config section.
pub fn prompts_from_config(persona: &PersonaConfig) -> TemplatePrompts {
    let default = persona
        .default_instructions
        .as_deref()
        .unwrap_or(DEFAULT_INSTRUCTIONS);
    let prompts = persona
        .instructions
        .iter()
        .fold(TemplatePrompts::new(default), |prompts, (name, text)| {
            prompts.with_persona(name, text)
        });
    persona
        .templates
        .iter()
        .fold(prompts, |prompts, (name, template)| {
            prompts.with_template(name, template)
        })
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_config_defaults() {
        let settings = EngineSettings::default();
        assert_eq!(settings.max_rounds, 3);
        assert_eq!(settings.tool_timeout, Duration::from_secs(60));
        assert_eq!(settings.heuristic_scan_depth, 6);
        assert!(settings.is_enabled("summarize_video"));
        assert_eq!(settings.default_persona, "default");
        assert_eq!(settings.step_ceiling(), 16);
    }

    #[test]
    fn from_config_copies_engine_section() {
        let mut config = AppConfig::default();
        config.engine.max_rounds = 0;
        config.engine.enabled_capabilities = vec!["web_search".into()];
        config.persona.default_persona = "tutor".into();

        let settings = EngineSettings::from_config(&config);
        assert_eq!(settings.max_rounds, 0);
        assert!(settings.is_enabled("web_search"));
        assert!(!settings.is_enabled("summarize_video"));
        assert_eq!(settings.default_persona, "tutor");
        assert_eq!(settings.step_ceiling(), 4);
    }

    #[test]
    fn prompts_follow_persona_section() {
        use parley_core::PromptProvider;

        let mut persona = PersonaConfig::default();
        persona
            .instructions
            .insert("tutor".into(), "Explain step by step.".into());
        persona
            .templates
            .insert("planning".into(), "Round {round}: {capabilities}".into());

        let prompts = prompts_from_config(&persona);
        assert_eq!(
            prompts.system_instructions("tutor", "").unwrap(),
            "Explain step by step."
        );
        assert_eq!(
            prompts.system_instructions("unknown", "").unwrap(),
            DEFAULT_INSTRUCTIONS
        );
        assert!(prompts.has_template("planning"));
    }
}
