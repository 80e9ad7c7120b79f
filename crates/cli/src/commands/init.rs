//! `parley init`: first-time setup.

use anyhow::Context;
use parley_config::AppConfig;

pub fn run() -> anyhow::Result<()> {
    let config_dir = AppConfig::config_dir();
    let config_path = config_dir.join("config.toml");

    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir)
            .with_context(|| format!("creating {}", config_dir.display()))?;
        println!("Created config directory: {}", config_dir.display());
    }

    if config_path.exists() {
        println!("Config already exists at: {}", config_path.display());
        println!("Edit it manually or delete it and re-run `parley init`.");
        return Ok(());
    }

    std::fs::write(&config_path, AppConfig::default_toml())
        .with_context(|| format!("writing {}", config_path.display()))?;
    println!("Created {}", config_path.display());
    println!();
    println!("Next steps:");
    println!("  1. Set PARLEY_API_KEY (or OPENAI_API_KEY), or add api_key to the file");
    println!("  2. Run: parley ask -m \"hello\"");
    Ok(())
}
