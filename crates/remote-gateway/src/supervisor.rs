use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::process::Child;
use tokio::sync::{broadcast, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use instance_guard::PortGuardConfig;

/// Grace period between SIGTERM and SIGKILL when stopping the child.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Configuration for the restart loop.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Program to run.
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Fixed settling delay between an exit and the next start.
    pub restart_delay: Duration,
    /// Stale listeners to clear before every start.
    pub guard: Option<PortGuardConfig>,
    pub health: Option<HealthCheckConfig>,
    pub upstream_watch: Option<UpstreamWatchConfig>,
}

/// Periodic TCP liveness check of the running child.
#[derive(Debug, Clone)]
pub struct HealthCheckConfig {
    pub addr: SocketAddr,
    pub interval: Duration,
    /// Consecutive failed checks after which the child is restarted.
    pub max_consecutive_failures: u32,
    /// Upper bound on a single connect attempt.
    pub check_timeout: Duration,
}

/// Restart the child when the processes listening on an upstream port are
/// replaced, e.g. because the agent was restarted underneath it.
#[derive(Debug, Clone)]
pub struct UpstreamWatchConfig {
    pub port: u16,
    pub interval: Duration,
    /// Identical observations of a new owner set required before the
    /// restart. Rides out ports that are still coming up.
    pub stable_checks: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Stopped,
    Starting,
    Running,
}

/// Why the child stopped running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The process exited on its own. `code` is `None` when it was killed
    /// by a signal.
    Exited { code: Option<i32> },
    /// The process could not be spawned at all.
    SpawnFailed,
    /// The health check gave up on it.
    Unhealthy,
    /// The process serving the watched upstream port changed.
    UpstreamChanged,
    /// Waiting on the process failed; it was killed to be safe.
    WaitFailed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitRecord {
    pub at: DateTime<Utc>,
    pub reason: StopReason,
}

/// Everything the supervisor knows about its target, published through a
/// `watch` channel after every transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisionRecord {
    /// Command line as a single display string.
    pub command: String,
    pub state: SupervisorState,
    pub pid: Option<u32>,
    /// Start attempts, including failed spawns.
    pub attempts: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub last_exit: Option<ExitRecord>,
}

/// What ended one run of the child.
enum RunOutcome {
    Exited(ExitStatus),
    WaitFailed(std::io::Error),
    Unhealthy,
    UpstreamChanged,
    Shutdown,
}

/// Follows the set of pids listening on the watched upstream port and
/// decides when a change is settled enough to act on.
#[derive(Debug)]
struct UpstreamTracker {
    required: u32,
    baseline: Option<BTreeSet<u32>>,
    candidate: Option<BTreeSet<u32>>,
    seen: u32,
}

impl UpstreamTracker {
    fn new(required: u32) -> Self {
        Self {
            required: required.max(1),
            baseline: None,
            candidate: None,
            seen: 0,
        }
    }

    /// Feed one observation. Returns `true` when a new owner set has been
    /// seen `required` times in a row.
    fn observe(&mut self, owners: BTreeSet<u32>) -> bool {
        let Some(baseline) = &self.baseline else {
            if !owners.is_empty() {
                self.baseline = Some(owners);
            }
            return false;
        };

        // Gone or shrinking: wait for owners to come back.
        if owners.is_subset(baseline) {
            if !owners.is_empty() {
                self.baseline = Some(owners);
            }
            self.candidate = None;
            self.seen = 0;
            return false;
        }

        if self.candidate.as_ref() == Some(&owners) {
            self.seen += 1;
        } else {
            self.candidate = Some(owners);
            self.seen = 1;
        }
        if self.seen < self.required {
            return false;
        }

        self.baseline = self.candidate.take();
        self.seen = 0;
        true
    }
}

/// Runs a command forever, restarting it after a fixed delay whenever it
/// stops, until the shutdown broadcast fires.
pub struct Supervisor {
    config: SupervisorConfig,
    child: Option<Child>,
    shutdown_rx: broadcast::Receiver<()>,
    record: watch::Sender<SupervisionRecord>,
    upstream: Option<UpstreamTracker>,
}

impl Supervisor {
    /// Create a new supervisor. Nothing is spawned until
    /// [`supervise`](Self::supervise) is called.
    pub fn new(config: SupervisorConfig, shutdown_rx: broadcast::Receiver<()>) -> Self {
        let command = std::iter::once(config.program.display().to_string())
            .chain(config.args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ");
        let (record, _) = watch::channel(SupervisionRecord {
            command,
            state: SupervisorState::Stopped,
            pid: None,
            attempts: 0,
            started_at: None,
            last_exit: None,
        });

        let upstream = config
            .upstream_watch
            .as_ref()
            .map(|w| UpstreamTracker::new(w.stable_checks));

        Self {
            config,
            child: None,
            shutdown_rx,
            record,
            upstream,
        }
    }

    /// Observe the supervision record.
    pub fn subscribe(&self) -> watch::Receiver<SupervisionRecord> {
        self.record.subscribe()
    }

    /// Main loop. Only returns once shutdown has been signalled and the child
    /// has been stopped.
    pub async fn supervise(&mut self) -> Result<()> {
        loop {
            self.clear_stale().await;

            let outcome = match self.start() {
                Ok(()) => self.watch_child().await,
                Err(e) => {
                    error!(error = %format!("{e:#}"), "failed to start supervised command");
                    self.record_stop(StopReason::SpawnFailed);
                    None
                }
            };

            if self.finish_run(outcome).await {
                return Ok(());
            }

            info!(
                delay_ms = self.config.restart_delay.as_millis() as u64,
                "restarting supervised command after delay"
            );
            tokio::select! {
                _ = tokio::time::sleep(self.config.restart_delay) => {}
                _ = self.shutdown_rx.recv() => {
                    info!("shutdown signal received while waiting to restart");
                    self.set_stopped();
                    return Ok(());
                }
            }
        }
    }

    /// Settle the end of one run. Returns `true` when supervision is over.
    async fn finish_run(&mut self, outcome: Option<RunOutcome>) -> bool {
        match outcome {
            Some(RunOutcome::Shutdown) => {
                info!("shutdown signal received; stopping supervised command");
                self.shutdown_child().await;
                self.set_stopped();
                return true;
            }
            Some(RunOutcome::Exited(status)) => {
                self.child = None;
                self.record_stop(StopReason::Exited {
                    code: status.code(),
                });
            }
            Some(RunOutcome::WaitFailed(e)) => {
                error!(error = %e, "failed to wait on supervised command; killing it");
                self.shutdown_child().await;
                self.record_stop(StopReason::WaitFailed);
            }
            Some(RunOutcome::Unhealthy) => {
                self.shutdown_child().await;
                self.record_stop(StopReason::Unhealthy);
            }
            Some(RunOutcome::UpstreamChanged) => {
                self.shutdown_child().await;
                self.record_stop(StopReason::UpstreamChanged);
            }
            None => {}
        }
        false
    }

    /// Kill leftover instances of the target that still hold the guarded
    /// port. Failures are logged and the start proceeds.
    async fn clear_stale(&self) {
        let Some(guard) = &self.config.guard else {
            return;
        };
        match instance_guard::clear_stale_instances(guard, &[]).await {
            Ok(report) if !report.killed.is_empty() => {
                info!(
                    port = guard.port,
                    killed = report.killed.len(),
                    "cleared stale instances"
                );
            }
            Ok(_) => {}
            Err(e) => warn!(port = guard.port, error = %e, "stale instance check failed"),
        }
    }

    fn start(&mut self) -> Result<()> {
        self.record.send_modify(|r| {
            r.state = SupervisorState::Starting;
            r.attempts += 1;
        });

        info!(
            program = %self.config.program.display(),
            args = ?self.config.args,
            "spawning supervised command"
        );

        let mut cmd = tokio::process::Command::new(&self.config.program);
        cmd.args(&self.config.args).kill_on_drop(true);

        // Own process group so shutdown reaches grandchildren as well.
        #[cfg(unix)]
        {
            cmd.process_group(0);
        }

        let child = cmd.spawn().with_context(|| {
            format!(
                "failed to spawn supervised program: {}",
                self.config.program.display()
            )
        })?;

        let pid = child.id();
        let now = Utc::now();
        info!(?pid, started_at = %now.to_rfc3339(), "supervised command started");

        self.record.send_modify(|r| {
            r.state = SupervisorState::Running;
            r.pid = pid;
            r.started_at = Some(now);
        });
        self.child = Some(child);
        Ok(())
    }

    /// Wait for the running child to exit, fail its health check, lose its
    /// upstream, or for shutdown.
    async fn watch_child(&mut self) -> Option<RunOutcome> {
        let health = self.config.health.clone();
        let mut ticker = health.as_ref().map(|h| ticker_every(h.interval));
        let upstream_watch = self.config.upstream_watch.clone();
        let mut upstream_ticker = upstream_watch.as_ref().map(|w| ticker_every(w.interval));
        let mut failures: u32 = 0;

        let child = self.child.as_mut()?;

        loop {
            tokio::select! {
                status = child.wait() => {
                    return Some(match status {
                        Ok(status) => RunOutcome::Exited(status),
                        Err(e) => RunOutcome::WaitFailed(e),
                    });
                }

                _ = next_tick(&mut ticker) => {
                    let Some(h) = health.as_ref() else { continue };
                    if instance_guard::is_listening(h.addr, h.check_timeout).await {
                        if failures > 0 {
                            info!(addr = %h.addr, after = failures, "health restored");
                        }
                        failures = 0;
                    } else {
                        failures += 1;
                        warn!(
                            addr = %h.addr,
                            failures,
                            max = h.max_consecutive_failures,
                            "health check failed"
                        );
                        if failures >= h.max_consecutive_failures {
                            error!(addr = %h.addr, "supervised command unhealthy; restarting");
                            return Some(RunOutcome::Unhealthy);
                        }
                    }
                }

                _ = next_tick(&mut upstream_ticker) => {
                    let (Some(w), Some(tracker)) = (upstream_watch.as_ref(), self.upstream.as_mut()) else {
                        continue;
                    };
                    let owners = match instance_guard::listeners_on(w.port).await {
                        Ok(owners) => owners.into_iter().map(|o| o.pid).collect(),
                        Err(e) => {
                            warn!(port = w.port, error = %e, "upstream owner check failed");
                            continue;
                        }
                    };
                    debug!(port = w.port, ?owners, "upstream owners");
                    if tracker.observe(owners) {
                        warn!(port = w.port, "upstream process changed; restarting supervised command");
                        return Some(RunOutcome::UpstreamChanged);
                    }
                }

                _ = self.shutdown_rx.recv() => {
                    return Some(RunOutcome::Shutdown);
                }
            }
        }
    }

    /// Graceful stop: SIGTERM to the process group, wait up to
    /// [`STOP_GRACE`], then SIGKILL.
    async fn shutdown_child(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        let pid = child.id();
        info!(?pid, "sending SIGTERM to supervised command");

        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, killpg, Signal};
            use nix::unistd::Pid;

            match pid {
                Some(raw) => {
                    let target = Pid::from_raw(raw as i32);
                    if killpg(target, Signal::SIGTERM).is_err() {
                        let _ = kill(target, Signal::SIGTERM);
                    }
                }
                None => {
                    let _ = child.start_kill();
                }
            }
        }

        #[cfg(not(unix))]
        {
            let _ = child.start_kill();
        }

        match tokio::time::timeout(STOP_GRACE, child.wait()).await {
            Ok(Ok(status)) => {
                info!(code = ?status.code(), "supervised command exited after SIGTERM");
            }
            Ok(Err(e)) => {
                error!(%e, "error waiting for supervised command after SIGTERM");
            }
            Err(_) => {
                warn!(
                    grace_secs = STOP_GRACE.as_secs(),
                    "supervised command ignored SIGTERM; sending SIGKILL"
                );
                let _ = child.kill().await;
            }
        }
    }

    fn record_stop(&self, reason: StopReason) {
        let at = Utc::now();
        match reason {
            StopReason::Exited { code } => {
                warn!(?code, at = %at.to_rfc3339(), "supervised command exited")
            }
            StopReason::SpawnFailed => warn!(at = %at.to_rfc3339(), "supervised command did not start"),
            StopReason::Unhealthy => {
                warn!(at = %at.to_rfc3339(), "supervised command stopped by health check")
            }
            StopReason::UpstreamChanged => {
                warn!(at = %at.to_rfc3339(), "supervised command stopped for upstream change")
            }
            StopReason::WaitFailed => {
                warn!(at = %at.to_rfc3339(), "supervised command could not be waited on")
            }
        }
        self.record.send_modify(|r| {
            r.state = SupervisorState::Stopped;
            r.pid = None;
            r.last_exit = Some(ExitRecord { at, reason });
        });
    }

    fn set_stopped(&self) {
        self.record.send_modify(|r| {
            r.state = SupervisorState::Stopped;
            r.pid = None;
        });
    }
}

/// An interval whose first tick is one period away.
fn ticker_every(period: Duration) -> Interval {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(program: &str, args: &[&str], delay_ms: u64) -> SupervisorConfig {
        SupervisorConfig {
            program: PathBuf::from(program),
            args: args.iter().map(|a| a.to_string()).collect(),
            restart_delay: Duration::from_millis(delay_ms),
            guard: None,
            health: None,
            upstream_watch: None,
        }
    }

    fn pids(list: &[u32]) -> BTreeSet<u32> {
        list.iter().copied().collect()
    }

    /// An address nothing listens on.
    async fn dead_addr() -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        addr
    }

    async fn wait_for(
        rx: &mut watch::Receiver<SupervisionRecord>,
        within: Duration,
        pred: impl Fn(&SupervisionRecord) -> bool,
    ) -> SupervisionRecord {
        tokio::time::timeout(within, async {
            loop {
                let current = rx.borrow_and_update().clone();
                if pred(&current) {
                    return current;
                }
                rx.changed().await.unwrap();
            }
        })
        .await
        .expect("condition not reached in time")
    }

    #[tokio::test]
    async fn exiting_target_is_restarted_until_shutdown() {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let mut supervisor = Supervisor::new(config("true", &[], 100), shutdown_rx);
        let mut rx = supervisor.subscribe();
        let task = tokio::spawn(async move { supervisor.supervise().await });

        // Five starts need four delays of 100 ms; allow generous slack.
        let record = wait_for(&mut rx, Duration::from_secs(3), |r| r.attempts >= 5).await;
        assert_eq!(record.command, "true");
        assert!(matches!(
            record.last_exit.map(|e| e.reason),
            Some(StopReason::Exited { code: Some(0) }) | None
        ));

        shutdown_tx.send(()).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
        assert_eq!(rx.borrow().state, SupervisorState::Stopped);
    }

    #[tokio::test]
    async fn crash_exit_code_is_recorded() {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let mut supervisor = Supervisor::new(config("sh", &["-c", "exit 3"], 50), shutdown_rx);
        let mut rx = supervisor.subscribe();
        let task = tokio::spawn(async move { supervisor.supervise().await });

        let record = wait_for(&mut rx, Duration::from_secs(3), |r| r.last_exit.is_some()).await;
        assert_eq!(
            record.last_exit.unwrap().reason,
            StopReason::Exited { code: Some(3) }
        );

        shutdown_tx.send(()).unwrap();
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn spawn_failure_keeps_looping() {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let mut supervisor = Supervisor::new(
            config("/nonexistent/remote-gateway-test-binary", &[], 50),
            shutdown_rx,
        );
        let mut rx = supervisor.subscribe();
        let task = tokio::spawn(async move { supervisor.supervise().await });

        let record = wait_for(&mut rx, Duration::from_secs(3), |r| r.attempts >= 3).await;
        assert_ne!(record.state, SupervisorState::Running);
        assert!(record.started_at.is_none());

        let last = wait_for(&mut rx, Duration::from_secs(1), |r| r.last_exit.is_some()).await;
        assert_eq!(last.last_exit.unwrap().reason, StopReason::SpawnFailed);

        shutdown_tx.send(()).unwrap();
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn unhealthy_child_is_killed_and_restarted() {
        let mut cfg = config("sleep", &["30"], 50);
        cfg.health = Some(HealthCheckConfig {
            addr: dead_addr().await,
            interval: Duration::from_millis(50),
            max_consecutive_failures: 2,
            check_timeout: Duration::from_millis(200),
        });

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let mut supervisor = Supervisor::new(cfg, shutdown_rx);
        let mut rx = supervisor.subscribe();
        let task = tokio::spawn(async move { supervisor.supervise().await });

        let record = wait_for(&mut rx, Duration::from_secs(5), |r| {
            r.last_exit.as_ref().map(|e| e.reason) == Some(StopReason::Unhealthy)
        })
        .await;
        assert!(record.pid.is_none());

        // The restart path follows.
        wait_for(&mut rx, Duration::from_secs(5), |r| {
            r.attempts >= 2 && r.state == SupervisorState::Running
        })
        .await;

        shutdown_tx.send(()).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(7), task)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn healthy_child_is_left_running() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut cfg = config("sleep", &["30"], 50);
        cfg.health = Some(HealthCheckConfig {
            addr: listener.local_addr().unwrap(),
            interval: Duration::from_millis(50),
            max_consecutive_failures: 1,
            check_timeout: Duration::from_millis(500),
        });

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let mut supervisor = Supervisor::new(cfg, shutdown_rx);
        let mut rx = supervisor.subscribe();
        let task = tokio::spawn(async move { supervisor.supervise().await });

        wait_for(&mut rx, Duration::from_secs(2), |r| r.state == SupervisorState::Running).await;
        tokio::time::sleep(Duration::from_millis(400)).await;
        {
            let record = rx.borrow();
            assert_eq!(record.attempts, 1);
            assert_eq!(record.state, SupervisorState::Running);
        }

        shutdown_tx.send(()).unwrap();
        assert!(task.await.unwrap().is_ok());
        assert_eq!(rx.borrow().state, SupervisorState::Stopped);
    }

    #[tokio::test]
    async fn wait_failure_kills_child_and_keeps_supervising() {
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let mut supervisor = Supervisor::new(config("sleep", &["30"], 50), shutdown_rx);
        let rx = supervisor.subscribe();

        supervisor.start().unwrap();
        assert_eq!(rx.borrow().state, SupervisorState::Running);

        let outcome = RunOutcome::WaitFailed(std::io::Error::other("wait interrupted"));
        assert!(!supervisor.finish_run(Some(outcome)).await);

        assert!(supervisor.child.is_none());
        let record = rx.borrow().clone();
        assert_eq!(record.state, SupervisorState::Stopped);
        assert_eq!(record.last_exit.unwrap().reason, StopReason::WaitFailed);
    }

    #[test]
    fn upstream_tracker_needs_a_stable_new_owner() {
        let mut tracker = UpstreamTracker::new(2);

        // First sighting becomes the baseline.
        assert!(!tracker.observe(pids(&[])));
        assert!(!tracker.observe(pids(&[10, 11])));
        assert!(!tracker.observe(pids(&[10, 11])));

        // Owners vanishing during a restart is not a change yet.
        assert!(!tracker.observe(pids(&[])));

        // A new owner must be seen twice in a row.
        assert!(!tracker.observe(pids(&[20])));
        assert!(!tracker.observe(pids(&[20, 21])));
        assert!(tracker.observe(pids(&[20, 21])));

        // The new owner is now the baseline.
        assert!(!tracker.observe(pids(&[20, 21])));
    }

    #[test]
    fn upstream_tracker_ignores_owners_leaving() {
        let mut tracker = UpstreamTracker::new(1);
        assert!(!tracker.observe(pids(&[10, 11])));
        assert!(!tracker.observe(pids(&[10])));
        assert!(tracker.observe(pids(&[10, 12])));
    }
}
