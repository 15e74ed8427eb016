use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::warn;

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub bridge: BridgeSection,
    #[serde(default)]
    pub forward: ForwardSection,
    #[serde(default)]
    pub gateway: GatewaySection,
    #[serde(default)]
    pub supervisor: SupervisorSection,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
pub struct WorkspaceConfig {
    /// Directory the file bridge is confined to.
    #[serde(default = "default_workspace_root")]
    pub root: PathBuf,
    #[serde(default = "default_max_read_bytes")]
    pub max_read_bytes: u64,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root: default_workspace_root(),
            max_read_bytes: default_max_read_bytes(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct BridgeSection {
    #[serde(default = "default_bridge_listen")]
    pub listen_addr: String,
}

impl Default for BridgeSection {
    fn default() -> Self {
        Self {
            listen_addr: default_bridge_listen(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ForwardSection {
    #[serde(default = "default_forward_listen")]
    pub listen_addr: String,
    #[serde(default = "default_forward_upstream")]
    pub upstream_addr: String,
}

impl Default for ForwardSection {
    fn default() -> Self {
        Self {
            listen_addr: default_forward_listen(),
            upstream_addr: default_forward_upstream(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct GatewaySection {
    #[serde(default = "default_gateway_listen")]
    pub listen_addr: String,
    #[serde(default = "default_gateway_upstream")]
    pub upstream_origin: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    /// Largest response body held in memory for rewriting.
    #[serde(default = "default_max_rewrite_bytes")]
    pub max_rewrite_bytes: usize,
    /// Directory with locally served pages. Static routes are off when unset.
    #[serde(default)]
    pub static_dir: Option<PathBuf>,
    #[serde(default = "default_static_routes")]
    pub static_routes: Vec<StaticRouteConfig>,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            listen_addr: default_gateway_listen(),
            upstream_origin: default_gateway_upstream(),
            connect_timeout_secs: default_connect_timeout(),
            max_body_bytes: default_max_body_bytes(),
            max_rewrite_bytes: default_max_rewrite_bytes(),
            static_dir: None,
            static_routes: default_static_routes(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StaticRouteConfig {
    pub path: String,
    pub file: PathBuf,
}

#[derive(Debug, Deserialize)]
pub struct SupervisorSection {
    /// Program to keep alive. Defaults to this binary's `forward` subcommand.
    #[serde(default)]
    pub program: Option<PathBuf>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_restart_delay")]
    pub restart_delay_secs: u64,
    #[serde(default = "default_lock_file")]
    pub lock_file: PathBuf,
    /// Port whose stale listeners are cleared before every start. When the
    /// default target runs, this defaults to the forwarder's listen port.
    #[serde(default)]
    pub guard_port: Option<u16>,
    /// Exact process name a stale listener must have to be killed.
    /// Defaults to the file name of the supervised program.
    #[serde(default)]
    pub process_name: Option<String>,
    #[serde(default)]
    pub health: Option<HealthSection>,
    #[serde(default)]
    pub upstream_watch: Option<UpstreamWatchSection>,
}

impl Default for SupervisorSection {
    fn default() -> Self {
        Self {
            program: None,
            args: Vec::new(),
            restart_delay_secs: default_restart_delay(),
            lock_file: default_lock_file(),
            guard_port: None,
            process_name: None,
            health: None,
            upstream_watch: None,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct HealthSection {
    /// TCP address checked while the child runs.
    pub addr: String,
    #[serde(default = "default_health_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_max_failures")]
    pub max_consecutive_failures: u32,
}

/// Restart the child when the process serving an upstream port changes,
/// e.g. after the agent itself was restarted.
#[derive(Debug, Deserialize)]
pub struct UpstreamWatchSection {
    pub port: u16,
    #[serde(default = "default_health_interval")]
    pub interval_secs: u64,
    /// Identical observations required before a new owner is trusted.
    #[serde(default = "default_stable_checks")]
    pub stable_checks: u32,
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

// ---------------------------------------------------------------------------
// Default-value functions used by serde
// ---------------------------------------------------------------------------

fn default_workspace_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_max_read_bytes() -> u64 {
    file_bridge::DEFAULT_MAX_READ_BYTES
}

fn default_bridge_listen() -> String {
    "0.0.0.0:8888".to_string()
}

fn default_forward_listen() -> String {
    "0.0.0.0:8889".to_string()
}

fn default_forward_upstream() -> String {
    "127.0.0.1:9090".to_string()
}

fn default_gateway_listen() -> String {
    "0.0.0.0:8890".to_string()
}

fn default_gateway_upstream() -> String {
    "http://127.0.0.1:9090".to_string()
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_max_rewrite_bytes() -> usize {
    8 * 1024 * 1024
}

fn default_static_routes() -> Vec<StaticRouteConfig> {
    vec![StaticRouteConfig {
        path: "/mobile".to_string(),
        file: PathBuf::from("mobile.html"),
    }]
}

fn default_restart_delay() -> u64 {
    5
}

fn default_lock_file() -> PathBuf {
    std::env::temp_dir().join("remote-gateway-supervisor.lock")
}

fn default_health_interval() -> u64 {
    10
}

fn default_max_failures() -> u32 {
    3
}

fn default_stable_checks() -> u32 {
    3
}

fn default_log_level() -> String {
    "info".to_string()
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load configuration from a YAML file.
///
/// A missing file is not an error: defaults are returned and a warning is
/// emitted, so the gateway starts on its standard ports without any setup.
pub fn load(path: &Path) -> anyhow::Result<Config> {
    if !path.exists() {
        warn!(
            path = %path.display(),
            "configuration file not found; using defaults"
        );
        return Ok(Config::default());
    }

    let contents = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read config file {}: {e}", path.display()))?;

    let config: Config = serde_yml::from_str(&contents)
        .map_err(|e| anyhow::anyhow!("failed to parse config file {}: {e}", path.display()))?;

    Ok(config)
}
