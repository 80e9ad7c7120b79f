//! Parley CLI, the main entry point.
//!
//! Commands:
//! - `init`    Write the default config
//! - `config`  Show, validate or locate the config
//! - `ask`     Run one turn against the configured provider

use clap::{Parser, Subcommand};

mod commands;
mod console;

#[derive(Parser)]
#[command(
    name = "parley",
    about = "Parley: a bounded-round conversational agent engine",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Write the default configuration file
    Init,

    /// Inspect the configuration
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },

    /// Ask one question and print the answer
    Ask {
        /// The user message
        #[arg(short, long)]
        message: String,

        /// Persona for this turn
        #[arg(short, long)]
        persona: Option<String>,

        /// Wait for the whole answer instead of streaming it
        #[arg(long)]
        no_stream: bool,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective config with the API key redacted
    Show,
    /// Validate the config file and environment
    Validate,
    /// Print the config file path
    Path,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Init => commands::init::run()?,
        Commands::Config { action } => match action.unwrap_or(ConfigAction::Show) {
            ConfigAction::Show => commands::config_cmd::show()?,
            ConfigAction::Validate => commands::config_cmd::validate()?,
            ConfigAction::Path => commands::config_cmd::path(),
        },
        Commands::Ask {
            message,
            persona,
            no_stream,
        } => commands::ask::run(message, persona, no_stream).await?,
    }

    Ok(())
}
