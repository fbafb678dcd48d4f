use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "bucket-trim")]
#[command(version = "0.1.0")]
#[command(about = "Zone-wide bucket change counters for sync log trimming", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Directory holding default.toml and per-environment overrides
    #[arg(short, long, default_value = "config", env = "BUCKET_TRIM_CONFIG_DIR")]
    pub config_dir: PathBuf,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run several gateways in-process and collect their hottest buckets
    Simulate {
        /// Number of gateways sharing the control object
        #[arg(short, long, default_value = "3")]
        gateways: usize,
        /// File with one bucket key per line (stdin when omitted)
        #[arg(short, long)]
        input: Option<PathBuf>,
        /// Number of buckets to request from each gateway
        #[arg(short, long, default_value = "16")]
        top: u16,
        /// Disconnect every gateway's watch once before collecting
        #[arg(long)]
        disconnect: bool,
        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the effective configuration
    Config,
}
