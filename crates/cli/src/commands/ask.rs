//! `parley ask`: run one turn and print the answer.

use std::sync::Arc;

use anyhow::Context;
use parley_agent::{EngineSettings, TurnEngine, prompts_from_config};
use parley_config::AppConfig;
use parley_core::Message;
use parley_providers::OpenAiCompatProvider;
use tracing::debug;

use crate::console::ConsoleObserver;

pub async fn run(message: String, persona: Option<String>, no_stream: bool) -> anyhow::Result<()> {
    let config = AppConfig::load().context("Failed to load config")?;
    debug!(config = ?config, "Loaded config");
    let provider = OpenAiCompatProvider::from_config(&config).with_context(|| {
        format!(
            "Provider not ready. Set PARLEY_API_KEY or edit {}",
            AppConfig::config_dir().join("config.toml").display()
        )
    })?;

    let mut settings = EngineSettings::from_config(&config);
    if no_stream {
        settings = settings.with_streaming(false);
    }

    // No capabilities are bundled with the binary; planning answers directly.
    let engine = TurnEngine::builder(Arc::new(provider))
        .prompts(Arc::new(prompts_from_config(&config.persona)))
        .settings(settings)
        .build();
    let console = Arc::new(ConsoleObserver::new());
    engine.notifier().register(console.clone());

    let mut user = Message::user(message);
    if let Some(persona) = persona {
        user = user.with_metadata("persona", serde_json::json!(persona));
    }

    let outcome = engine.run_turn(vec![user]).await;

    if !console.streamed() {
        println!("{}", outcome.final_answer);
    }
    if !outcome.side_effects.is_empty() {
        println!("{}", serde_json::to_string_pretty(&outcome.side_effects)?);
    }
    Ok(())
}
