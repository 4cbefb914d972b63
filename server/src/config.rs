//! # Configuration
//!
//! Command-line flags with environment fallbacks.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[command(name = "interview-relay")]
#[command(version, about = "Real-time collaboration relay for interview sessions")]
pub struct RelayConfig {
    /// Address to listen on.
    #[arg(long, env = "RELAY_ADDR", default_value = "0.0.0.0:3001")]
    pub addr: SocketAddr,

    /// Directory where proctoring screenshots are stored.
    #[arg(long, env = "RELAY_SCREENSHOT_DIR", default_value = "screenshots")]
    pub screenshot_dir: PathBuf,

    /// Close connections that send nothing for this many seconds (0 disables).
    #[arg(long, env = "RELAY_IDLE_TIMEOUT_SECS", default_value_t = 0)]
    pub idle_timeout_secs: u64,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "RELAY_LOG_JSON")]
    pub log_json: bool,
}

impl RelayConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}
