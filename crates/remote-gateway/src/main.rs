mod cli;
mod config;
mod supervisor;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::broadcast;
use tracing::info;

use file_bridge::{Bridge, BridgeConfig, Workspace};
use http_gateway::{Gateway, GatewayConfig, MobileViewportRule, RewriteRule, StaticRoute};
use instance_guard::{InstanceLock, PortGuardConfig};
use tcp_forward::{ForwardConfig, Forwarder};

use crate::cli::{Cli, Command, Overrides};
use crate::config::{Config, LogFormat};
use crate::supervisor::{HealthCheckConfig, Supervisor, SupervisorConfig, UpstreamWatchConfig};

/// Upper bound on a single health check.
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut cfg = config::load(&cli.config)?;
    apply_overrides(&mut cfg, &cli.overrides);

    init_tracing(&cfg);

    info!(
        config_file = %cli.config.display(),
        command = ?cli.command,
        "remote-gateway starting"
    );

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    spawn_signal_listener(shutdown_tx.clone());

    match cli.command {
        Command::Serve => serve(&cfg, &shutdown_tx).await,
        Command::Forward => {
            let forwarder = build_forwarder(&cfg)?
                .bind()
                .await
                .with_context(|| format!("failed to bind forwarder on {}", cfg.forward.listen_addr))?;
            let mut shutdown_rx = shutdown_tx.subscribe();
            tokio::select! {
                _ = forwarder.run() => {}
                _ = shutdown_rx.recv() => info!("forwarder shutting down"),
            }
            Ok(())
        }
        Command::Gateway => {
            let gateway = build_gateway(&cfg)?
                .bind()
                .await
                .with_context(|| format!("failed to bind gateway on {}", cfg.gateway.listen_addr))?;
            let mut shutdown_rx = shutdown_tx.subscribe();
            tokio::select! {
                r = gateway.run() => r?,
                _ = shutdown_rx.recv() => info!("gateway shutting down"),
            }
            Ok(())
        }
        Command::Bridge => {
            let bridge = build_bridge(&cfg)?
                .bind()
                .await
                .with_context(|| format!("failed to bind file bridge on {}", cfg.bridge.listen_addr))?;
            let mut shutdown_rx = shutdown_tx.subscribe();
            tokio::select! {
                _ = bridge.run() => {}
                _ = shutdown_rx.recv() => info!("file bridge shutting down"),
            }
            Ok(())
        }
        Command::Supervise {
            restart_delay,
            command,
        } => {
            if let Some(secs) = restart_delay {
                cfg.supervisor.restart_delay_secs = secs;
            }
            supervise(&cli.config, &cfg, command, &shutdown_tx).await
        }
    }
}

fn apply_overrides(cfg: &mut Config, overrides: &Overrides) {
    if let Some(ref root) = overrides.workspace_root {
        cfg.workspace.root = root.clone();
    }
    if let Some(ref addr) = overrides.bridge_listen {
        cfg.bridge.listen_addr = addr.clone();
    }
    if let Some(ref addr) = overrides.forward_listen {
        cfg.forward.listen_addr = addr.clone();
    }
    if let Some(ref addr) = overrides.forward_upstream {
        cfg.forward.upstream_addr = addr.clone();
    }
    if let Some(ref addr) = overrides.gateway_listen {
        cfg.gateway.listen_addr = addr.clone();
    }
    if let Some(ref origin) = overrides.gateway_upstream {
        cfg.gateway.upstream_origin = origin.clone();
    }
    if let Some(ref level) = overrides.log_level {
        cfg.logging.level = level.clone();
    }
    if let Some(format) = overrides.log_format {
        cfg.logging.format = format;
    }
}

fn init_tracing(cfg: &Config) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cfg.logging.level));

    match cfg.logging.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init(),
        LogFormat::Pretty => tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(env_filter)
            .with_target(true)
            .init(),
    }
}

/// Broadcast shutdown on SIGINT or SIGTERM.
fn spawn_signal_listener(shutdown_tx: broadcast::Sender<()>) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to register SIGTERM handler");

            tokio::select! {
                _ = ctrl_c => {
                    info!("received SIGINT (ctrl-c)");
                }
                _ = sigterm.recv() => {
                    info!("received SIGTERM");
                }
            }
        }

        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            info!("received SIGINT (ctrl-c)");
        }

        let _ = shutdown_tx.send(());
    });
}

fn parse_addr(value: &str, what: &str) -> Result<SocketAddr> {
    value
        .parse()
        .with_context(|| format!("invalid {what} address: {value}"))
}

fn build_forwarder(cfg: &Config) -> Result<Forwarder> {
    Ok(Forwarder::new(ForwardConfig {
        listen_addr: parse_addr(&cfg.forward.listen_addr, "forwarder listen")?,
        upstream_addr: cfg.forward.upstream_addr.clone(),
    }))
}

fn build_bridge(cfg: &Config) -> Result<Bridge> {
    let workspace = Workspace::new(&cfg.workspace.root, cfg.workspace.max_read_bytes)
        .with_context(|| {
            format!(
                "workspace root {} is not accessible",
                cfg.workspace.root.display()
            )
        })?;
    Ok(Bridge::new(BridgeConfig {
        listen_addr: parse_addr(&cfg.bridge.listen_addr, "file bridge listen")?,
        workspace,
    }))
}

fn build_gateway(cfg: &Config) -> Result<Gateway> {
    let section = &cfg.gateway;
    let rules: Vec<Arc<dyn RewriteRule>> = vec![Arc::new(MobileViewportRule::new())];

    let gateway = Gateway::new(GatewayConfig {
        listen_addr: parse_addr(&section.listen_addr, "gateway listen")?,
        upstream_origin: section.upstream_origin.clone(),
        connect_timeout: Duration::from_secs(section.connect_timeout_secs),
        max_body_bytes: section.max_body_bytes,
        max_rewrite_bytes: section.max_rewrite_bytes,
        static_dir: section.static_dir.clone(),
        static_routes: section
            .static_routes
            .iter()
            .map(|r| StaticRoute {
                path: r.path.clone(),
                file: r.file.clone(),
            })
            .collect(),
        rules,
    })
    .context("failed to initialize http gateway")?;
    Ok(gateway)
}

/// Run the file bridge, forwarder and HTTP gateway side by side. All three
/// are bound before any of them starts serving so a port conflict aborts
/// startup cleanly.
async fn serve(cfg: &Config, shutdown_tx: &broadcast::Sender<()>) -> Result<()> {
    let bridge = build_bridge(cfg)?
        .bind()
        .await
        .with_context(|| format!("failed to bind file bridge on {}", cfg.bridge.listen_addr))?;
    let forwarder = build_forwarder(cfg)?
        .bind()
        .await
        .with_context(|| format!("failed to bind forwarder on {}", cfg.forward.listen_addr))?;
    let gateway = build_gateway(cfg)?
        .bind()
        .await
        .with_context(|| format!("failed to bind gateway on {}", cfg.gateway.listen_addr))?;

    let mut shutdown_rx = shutdown_tx.subscribe();
    tokio::select! {
        _ = bridge.run() => {}
        _ = forwarder.run() => {}
        r = gateway.run() => r.context("http gateway stopped")?,
        _ = shutdown_rx.recv() => info!("shutdown signal received"),
    }

    info!("remote-gateway shutting down");
    Ok(())
}

/// Keep the configured command (by default this binary's own forwarder)
/// running until shutdown.
async fn supervise(
    config_path: &Path,
    cfg: &Config,
    command: Vec<String>,
    shutdown_tx: &broadcast::Sender<()>,
) -> Result<()> {
    let section = &cfg.supervisor;
    let _lock = InstanceLock::acquire(&section.lock_file)
        .context("refusing to start a second supervisor")?;

    let Target {
        program,
        args,
        guard,
    } = resolve_target(config_path, cfg, command)?;

    let health = match &section.health {
        Some(h) => Some(HealthCheckConfig {
            addr: parse_addr(&h.addr, "health check")?,
            interval: Duration::from_secs(h.interval_secs.max(1)),
            max_consecutive_failures: h.max_consecutive_failures.max(1),
            check_timeout: HEALTH_CHECK_TIMEOUT,
        }),
        None => None,
    };

    let upstream_watch = section.upstream_watch.as_ref().map(|w| UpstreamWatchConfig {
        port: w.port,
        interval: Duration::from_secs(w.interval_secs.max(1)),
        stable_checks: w.stable_checks.max(1),
    });

    let supervisor_config = SupervisorConfig {
        program,
        args,
        restart_delay: Duration::from_secs(section.restart_delay_secs),
        guard,
        health,
        upstream_watch,
    };

    info!(
        program = %supervisor_config.program.display(),
        args = ?supervisor_config.args,
        guard_port = ?supervisor_config.guard.as_ref().map(|g| g.port),
        restart_delay_secs = section.restart_delay_secs,
        lock_file = %section.lock_file.display(),
        "supervisor starting"
    );

    let mut supervisor = Supervisor::new(supervisor_config, shutdown_tx.subscribe());
    supervisor.supervise().await?;

    info!("supervisor stopped");
    Ok(())
}

/// The command to supervise and the port its stale instances are cleared
/// from.
struct Target {
    program: PathBuf,
    args: Vec<String>,
    guard: Option<PortGuardConfig>,
}

/// Pick the supervised command: the trailing CLI command, else the
/// configured program, else this binary's own forwarder. The default
/// forwarder target is guarded on its listen port even when no
/// `guard_port` is configured.
fn resolve_target(config_path: &Path, cfg: &Config, command: Vec<String>) -> Result<Target> {
    let section = &cfg.supervisor;
    let mut guard_port = section.guard_port;

    let (program, args) = match command.split_first() {
        Some((program, args)) => (PathBuf::from(program), args.to_vec()),
        None => match &section.program {
            Some(program) => (program.clone(), section.args.clone()),
            None => {
                let exe = std::env::current_exe()
                    .context("failed to locate the remote-gateway executable")?;
                let args = vec![
                    "--config".to_string(),
                    config_path.display().to_string(),
                    "forward".to_string(),
                ];
                if guard_port.is_none() {
                    let listen = parse_addr(&cfg.forward.listen_addr, "forwarder listen")?;
                    guard_port = Some(listen.port());
                }
                (exe, args)
            }
        },
    };

    let guard = guard_port.map(|port| PortGuardConfig {
        port,
        process_name: section.process_name.clone().unwrap_or_else(|| {
            program
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        }),
    });

    Ok(Target {
        program,
        args,
        guard,
    })
}
