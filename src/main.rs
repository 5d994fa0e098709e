//! gatehouse — ingress/egress networking and dispatch core for a
//! low-latency order-matching gateway.
//!
//! Run `gatehouse --help` for usage.

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod bench;
mod cli;
mod color;
mod monitor;
mod run;

use cli::{Cli, Commands};
use gatehouse::config;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("warn".parse()?))
        .init();

    let cli = Cli::parse();

    if let Commands::Init = cli.command {
        let example = config::GatewayConfig::default_example();
        print!("{}", toml::to_string_pretty(&example)?);
        return Ok(());
    }

    if !cli.config.exists() {
        let example = config::GatewayConfig::default_example();
        std::fs::write(&cli.config, toml::to_string_pretty(&example)?)?;
        eprintln!("Created '{}' with default settings.", cli.config.display());
    }
    let config = config::GatewayConfig::load(&cli.config)?;

    match cli.command {
        Commands::Init => unreachable!("handled above"),
        Commands::Run => run::run(&config)?,
        Commands::Monitor { interval } => monitor::run(&config.stats.log_path, interval)?,
        Commands::Bench { duration, output } => bench::run(&config, duration, output)?,
    }

    Ok(())
}
