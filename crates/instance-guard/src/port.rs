use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::error::GuardError;

use tracing::{debug, info, warn};

/// A process listening on a TCP port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortOwner {
    /// Executable file name. Falls back to the name the inspection tool
    /// printed when the executable cannot be resolved.
    pub name: String,
    pub pid: u32,
    /// Local address the socket is bound to, as printed by the tool.
    pub local_addr: String,
}

/// Which listeners on a port count as a stale instance of our target.
#[derive(Debug, Clone)]
pub struct PortGuardConfig {
    /// Port the target listens on.
    pub port: u16,
    /// Exact process name of the target. Listeners with any other name are
    /// never touched.
    pub process_name: String,
}

/// What [`clear_stale_instances`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClearReport {
    /// Stale instances that were sent SIGKILL.
    pub killed: Vec<PortOwner>,
    /// Listeners on the port that belong to some other program.
    pub foreign: Vec<PortOwner>,
}

/// List the processes listening on `port`.
///
/// Uses `ss` on Linux and `lsof` on macOS. On other platforms an empty list
/// is returned.
pub async fn listeners_on(port: u16) -> Result<Vec<PortOwner>, GuardError> {
    debug!(port, "inspecting listeners");

    if cfg!(target_os = "macos") {
        listeners_macos(port).await
    } else if cfg!(target_os = "linux") {
        listeners_linux(port).await
    } else {
        warn!("listener inspection is not supported on this platform; skipping");
        Ok(Vec::new())
    }
}

/// Force-terminate stale instances of the configured target.
///
/// A listener on the guarded port is only killed when its process name is
/// exactly `process_name` and its pid is not in `spare` (the caller's own
/// live child). Anything else is reported in [`ClearReport::foreign`] and
/// left alone.
pub async fn clear_stale_instances(
    config: &PortGuardConfig,
    spare: &[u32],
) -> Result<ClearReport, GuardError> {
    let owners = listeners_on(config.port).await?;
    let own_pid = std::process::id();
    let mut report = ClearReport::default();

    for owner in owners {
        if owner.pid == own_pid || spare.contains(&owner.pid) {
            continue;
        }
        if owner.name != config.process_name {
            warn!(
                port = config.port,
                pid = owner.pid,
                name = %owner.name,
                kind = "PortOccupied",
                "port occupied by a foreign process; leaving it alone"
            );
            report.foreign.push(owner);
            continue;
        }
        // One process can own several sockets on the same port.
        if report.killed.iter().any(|k| k.pid == owner.pid) {
            continue;
        }

        info!(
            port = config.port,
            pid = owner.pid,
            name = %owner.name,
            "terminating stale instance"
        );
        kill_pid(owner.pid)?;
        report.killed.push(owner);
    }

    Ok(report)
}

#[cfg(unix)]
fn kill_pid(pid: u32) -> Result<(), GuardError> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        Ok(()) => Ok(()),
        // Already gone.
        Err(nix::errno::Errno::ESRCH) => Ok(()),
        Err(source) => Err(GuardError::Signal { pid, source }),
    }
}

#[cfg(not(unix))]
fn kill_pid(pid: u32) -> Result<(), GuardError> {
    warn!(pid, "terminating processes is not supported on this platform");
    Ok(())
}

/// macOS implementation using `lsof`.
async fn listeners_macos(port: u16) -> Result<Vec<PortOwner>, GuardError> {
    let output = tokio::process::Command::new("lsof")
        // `+c 0` prints the whole command name instead of its first 9 bytes.
        .args(["+c", "0", "-i", &format!("TCP:{port}"), "-sTCP:LISTEN", "-n", "-P"])
        .output()
        .await?;

    // lsof exits with status 1 and empty stderr when nothing matches.
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.trim().is_empty() {
            return Ok(Vec::new());
        }
        return Err(GuardError::ParseError {
            reason: format!("lsof exited with {}: {}", output.status, stderr.trim()),
        });
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(parse_lsof_output(&stdout, port))
}

/// Parses `lsof +c 0 -i TCP:PORT -sTCP:LISTEN -n -P` output.
///
/// ```text
/// COMMAND   PID USER   FD   TYPE  DEVICE SIZE/OFF NODE NAME
/// node    12345 user   22u  IPv4 0x1234      0t0  TCP 127.0.0.1:18790 (LISTEN)
/// ```
fn parse_lsof_output(stdout: &str, port: u16) -> Vec<PortOwner> {
    let port_suffix = format!(":{port}");
    let mut owners = Vec::new();

    for line in stdout.lines() {
        if line.starts_with("COMMAND") {
            continue;
        }
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() < 9 {
            continue;
        }

        let name = if tokens.last() == Some(&"(LISTEN)") {
            tokens[tokens.len() - 2]
        } else {
            tokens[tokens.len() - 1]
        };
        if !name.ends_with(&port_suffix) {
            continue;
        }

        let Ok(pid) = tokens[1].parse::<u32>() else {
            continue;
        };
        owners.push(PortOwner {
            name: tokens[0].to_string(),
            pid,
            local_addr: name.to_string(),
        });
    }

    owners
}

/// Linux implementation using `ss`.
async fn listeners_linux(port: u16) -> Result<Vec<PortOwner>, GuardError> {
    let output = tokio::process::Command::new("ss")
        .args(["-tlnpH", &format!("sport = :{port}")])
        .output()
        .await?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(GuardError::ParseError {
            reason: format!("ss exited with {}: {}", output.status, stderr.trim()),
        });
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut owners = parse_ss_output(&stdout, port);
    // `ss` reports `comm`, which the kernel cuts to 15 bytes.
    for owner in &mut owners {
        if let Some(name) = executable_name(owner.pid).await {
            owner.name = name;
        }
    }
    Ok(owners)
}

/// File name of the executable behind `pid`, read from procfs.
async fn executable_name(pid: u32) -> Option<String> {
    let target = tokio::fs::read_link(format!("/proc/{pid}/exe")).await.ok()?;
    exe_file_name(&target)
}

/// File name of a `/proc/<pid>/exe` link target. The kernel appends
/// ` (deleted)` once the binary was replaced on disk.
fn exe_file_name(target: &Path) -> Option<String> {
    let name = target.file_name()?.to_string_lossy();
    let name = name.strip_suffix(" (deleted)").unwrap_or(&name);
    if name.is_empty() {
        return None;
    }
    Some(name.to_string())
}

/// Parses `ss -tlnp` output.
///
/// ```text
/// State  Recv-Q Send-Q  Local Address:Port  Peer Address:Port  Process
/// LISTEN 0      128     127.0.0.1:8889      0.0.0.0:*          users:(("remote-gateway",pid=1234,fd=9))
/// ```
///
/// The process column is only filled in for sockets owned by the current
/// user (or with root privileges); other lines are skipped.
fn parse_ss_output(stdout: &str, port: u16) -> Vec<PortOwner> {
    let port_suffix = format!(":{port}");
    let mut owners = Vec::new();

    for line in stdout.lines() {
        if line.starts_with("State") || line.trim().is_empty() {
            continue;
        }
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() < 6 {
            continue;
        }

        let local = tokens[3];
        if !local.ends_with(&port_suffix) {
            continue;
        }

        let users = tokens[5..].join(" ");
        for (name, pid) in parse_ss_users(&users) {
            owners.push(PortOwner {
                name,
                pid,
                local_addr: local.to_string(),
            });
        }
    }

    owners
}

/// Extract `(name, pid)` pairs from an `ss` users column such as
/// `users:(("nginx",pid=10,fd=6),("nginx",pid=11,fd=6))`.
fn parse_ss_users(column: &str) -> Vec<(String, u32)> {
    let mut result = Vec::new();
    let mut rest = column;

    while let Some(start) = rest.find("((\"").or_else(|| rest.find("(\"")) {
        let after = &rest[start..];
        let Some(name_start) = after.find('"') else {
            break;
        };
        let after_name = &after[name_start + 1..];
        let Some(name_end) = after_name.find('"') else {
            break;
        };
        let name = &after_name[..name_end];
        let tail = &after_name[name_end + 1..];

        let pid = tail
            .find("pid=")
            .map(|p| &tail[p + 4..])
            .and_then(|s| {
                let digits: String = s.chars().take_while(|c| c.is_ascii_digit()).collect();
                digits.parse::<u32>().ok()
            });
        if let Some(pid) = pid {
            result.push((name.to_string(), pid));
        }

        rest = match tail.find(')') {
            Some(end) => &tail[end + 1..],
            None => break,
        };
    }

    result
}

/// Returns `true` if a TCP connection to `addr` succeeds within `timeout`.
pub async fn is_listening(addr: SocketAddr, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, tokio::net::TcpStream::connect(addr)).await,
        Ok(Ok(_))
    )
}
