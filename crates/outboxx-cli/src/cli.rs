use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "outboxx")]
#[command(about = "Stream PostgreSQL row changes to Kafka")]
#[command(version)]
pub struct Cli {
    /// Path to the pipeline configuration file
    #[arg(short, long, global = true, default_value = "outboxx.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the CDC pipeline
    Run {
        /// Resume from this WAL position ("HI/LO" hex) instead of the
        /// slot's confirmed position
        #[arg(long)]
        start_lsn: Option<String>,
    },

    /// Validate the configuration (including the password environment
    /// variable) and exit
    Check,
}
