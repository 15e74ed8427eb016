use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::config::LogFormat;

#[derive(Parser, Debug)]
#[command(
    name = "remote-gateway",
    version,
    about = "Browser gateway for a locally running agent session"
)]
pub struct Cli {
    /// Path to the configuration file
    #[arg(
        short,
        long,
        global = true,
        env = "REMOTE_GATEWAY_CONFIG",
        default_value = "config.yaml"
    )]
    pub config: PathBuf,

    #[command(flatten)]
    pub overrides: Overrides,

    #[command(subcommand)]
    pub command: Command,
}

/// Settings that override the configuration file.
#[derive(Args, Debug)]
pub struct Overrides {
    /// Workspace root exposed by the file bridge
    #[arg(long, global = true, env = "REMOTE_GATEWAY_WORKSPACE")]
    pub workspace_root: Option<PathBuf>,

    /// File bridge listen address
    #[arg(long, global = true, env = "REMOTE_GATEWAY_BRIDGE_LISTEN")]
    pub bridge_listen: Option<String>,

    /// TCP forwarder listen address
    #[arg(long, global = true, env = "REMOTE_GATEWAY_FORWARD_LISTEN")]
    pub forward_listen: Option<String>,

    /// TCP forwarder upstream address
    #[arg(long, global = true, env = "REMOTE_GATEWAY_FORWARD_UPSTREAM")]
    pub forward_upstream: Option<String>,

    /// HTTP gateway listen address
    #[arg(long, global = true, env = "REMOTE_GATEWAY_GATEWAY_LISTEN")]
    pub gateway_listen: Option<String>,

    /// HTTP gateway upstream origin, e.g. http://127.0.0.1:9090
    #[arg(long, global = true, env = "REMOTE_GATEWAY_GATEWAY_UPSTREAM")]
    pub gateway_upstream: Option<String>,

    /// Log level filter (RUST_LOG takes precedence)
    #[arg(long, global = true, env = "REMOTE_GATEWAY_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Log output format
    #[arg(long, global = true, env = "REMOTE_GATEWAY_LOG_FORMAT", value_enum)]
    pub log_format: Option<LogFormat>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the file bridge, TCP forwarder and HTTP gateway in one process
    Serve,
    /// Run only the TCP forwarder
    Forward,
    /// Run only the HTTP gateway
    Gateway,
    /// Run only the WebSocket file bridge
    Bridge,
    /// Keep a command running, restarting it whenever it stops
    Supervise {
        /// Seconds to wait between an exit and the next start
        #[arg(long, env = "REMOTE_GATEWAY_RESTART_DELAY")]
        restart_delay: Option<u64>,

        /// Command to supervise. Defaults to this binary's `forward`
        /// subcommand with the same configuration file.
        #[arg(last = true)]
        command: Vec<String>,
    },
}
