//! `parley config`: configuration inspection.

use anyhow::Context;
use parley_config::AppConfig;

/// Effective config as TOML, API key replaced.
pub fn render_redacted(config: &AppConfig) -> anyhow::Result<String> {
    let mut redacted = config.clone();
    if redacted.api_key.is_some() {
        redacted.api_key = Some("***".into());
    }
    toml::to_string_pretty(&redacted).context("rendering config")
}

pub fn show() -> anyhow::Result<()> {
    let config = AppConfig::load().context("Failed to load config")?;
    println!("{}", render_redacted(&config)?);
    Ok(())
}

pub fn validate() -> anyhow::Result<()> {
    let config = AppConfig::load().context("Config is invalid")?;
    println!("Config OK");
    if !config.has_api_key() {
        println!("  warning: no API key set (PARLEY_API_KEY or OPENAI_API_KEY)");
    }
    println!("  Provider:     {} ({})", config.provider_name, config.api_url);
    println!("  Model:        {}", config.model);
    println!("  Max rounds:   {}", config.engine.max_rounds);
    println!("  Reflection:   {}", config.engine.reflection_enabled);
    println!("  Streaming:    {}", config.engine.streaming_enabled);
    println!(
        "  Capabilities: {}",
        config.engine.enabled_capabilities.join(", ")
    );
    Ok(())
}

pub fn path() {
    println!("{}", AppConfig::config_dir().join("config.toml").display());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn show_never_prints_the_key() {
        let mut config = AppConfig::default();
        config.api_key = Some("sk-secret".into());
        let rendered = render_redacted(&config).unwrap();
        assert!(!rendered.contains("sk-secret"));
        assert!(rendered.contains("max_rounds"));
    }
}
