//! Orbitone CLI
//!
//! Command-line driver for the Orbitone entity audio engine.

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use orbitone::cli::commands::{self, DemoOptions};
use orbitone::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    info!("Orbitone v{}", env!("CARGO_PKG_VERSION"));

    let config = commands::load_config(cli.config.as_deref()).context("loading engine config")?;

    match cli.command {
        Some(Commands::Demo {
            seconds,
            tempo,
            key,
            preset,
            user_agent,
            full,
        }) => {
            let options = DemoOptions {
                seconds,
                tempo,
                key,
                preset: preset
                    .parse()
                    .with_context(|| format!("unknown preset '{}'", preset))?,
                user_agent,
                full,
            };
            commands::demo(config, &options).await?;
        }
        Some(Commands::Presets) => commands::presets()?,
        Some(Commands::Config) => commands::show_config(&config)?,
        None => {
            println!("Orbitone v{}", env!("CARGO_PKG_VERSION"));
            println!("Use --help for available commands");
        }
    }
    Ok(())
}
