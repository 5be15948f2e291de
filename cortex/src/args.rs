use std::{net::SocketAddr, path::PathBuf};

use clap::Parser;

/// The Cortex gateway.
#[derive(Debug, Parser)]
#[command(name = "cortex", version, about)]
pub struct Args {
    /// Path to the cortex.toml configuration file.
    #[arg(short, long, env = "CORTEX_CONFIG", default_value = "cortex.toml")]
    pub config: PathBuf,

    /// Address to listen on; overrides the configured port.
    #[arg(short, long, env = "CORTEX_LISTEN")]
    pub listen: Option<SocketAddr>,

    /// Log filter, e.g. "info" or "executor=debug,llm=debug".
    #[arg(long, env = "CORTEX_LOG", default_value = "info")]
    pub log: String,
}
