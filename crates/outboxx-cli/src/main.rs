use std::path::Path;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

mod cli;
mod runner;

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Run { start_lsn } => runner::run(&cli.config, start_lsn.as_deref()).await,
        Commands::Check => check(&cli.config),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %format_args!("{:#}", e), "fatal error");
            ExitCode::FAILURE
        }
    }
}

fn check(path: &Path) -> anyhow::Result<()> {
    let config = outboxx_config::Config::load(path)
        .with_context(|| format!("invalid configuration at {}", path.display()))?;
    config.source.password()?;

    println!(
        "configuration OK: {} stream(s), slot '{}', publication '{}', brokers {}",
        config.streams.len(),
        config.source.slot,
        config.source.publication,
        config.sink.bootstrap_servers()
    );
    Ok(())
}
