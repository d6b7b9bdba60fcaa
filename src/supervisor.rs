//! Process supervisor for long-running watcher and handler processes.
//!
//! Every roster entry runs as its own OS process in a fresh process group, so
//! a signal reaches the whole tree it spawns. A monitor pass reaps exited
//! children, writes a `process_crash` audit entry with the exit code and the
//! tail of the child's output, and relaunches it if the roster allows.

use serde_json::json;
use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::audit::{AuditLogger, AuditResult};
use crate::config::{ProcessConfig, SupervisorConfig};
use crate::error::SupervisorError;

/// Lines of combined stdout/stderr kept per child
const OUTPUT_TAIL_LINES: usize = 50;

type OutputTail = Arc<Mutex<VecDeque<String>>>;

struct Managed {
    spec: ProcessConfig,
    child: Child,
    pid: Option<u32>,
    output: OutputTail,
}

/// What a monitor pass found for one exited process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrashEvent {
    pub name: String,
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
    /// Pid of the replacement, if one was started
    pub restarted: Option<u32>,
}

pub struct Supervisor {
    roster: Vec<ProcessConfig>,
    running: Vec<Managed>,
    /// Restartable entries whose relaunch failed; retried every pass
    pending: Vec<ProcessConfig>,
    audit: AuditLogger,
    interval: Duration,
    grace: Duration,
}

impl Supervisor {
    pub fn new(config: &SupervisorConfig, audit: AuditLogger) -> Self {
        Self {
            roster: config.processes.clone(),
            running: Vec::new(),
            pending: Vec::new(),
            audit,
            interval: Duration::from_secs(config.check_interval_secs),
            grace: Duration::from_secs(config.shutdown_grace_secs),
        }
    }

    /// Pid of a running roster entry
    pub fn pid(&self, name: &str) -> Option<u32> {
        self.running
            .iter()
            .find(|m| m.spec.name == name)
            .and_then(|m| m.pid)
    }

    pub fn running(&self) -> Vec<String> {
        self.running.iter().map(|m| m.spec.name.clone()).collect()
    }

    /// Launch every roster entry. A failed launch is logged and audited; the
    /// rest still start.
    pub fn start_all(&mut self) -> usize {
        for spec in self.roster.clone() {
            match spawn(&spec) {
                Ok(managed) => self.running.push(managed),
                Err(e) => {
                    error!(process = %spec.name, error = %e, "failed to start process");
                    self.audit.log_best_effort(
                        "process_start",
                        &spec.name,
                        json!({"error": e.to_string(), "command": spec.command}),
                        AuditResult::Failure,
                    );
                    if spec.restart {
                        self.pending.push(spec);
                    }
                }
            }
        }
        self.running.len()
    }

    /// Reap exited children and relaunch restartable ones
    pub async fn monitor_once(&mut self) -> Vec<CrashEvent> {
        let mut events = Vec::new();
        let mut still_running = Vec::with_capacity(self.running.len());

        for mut managed in std::mem::take(&mut self.running) {
            let status = match managed.child.try_wait() {
                Ok(None) => {
                    still_running.push(managed);
                    continue;
                }
                Ok(Some(status)) => status,
                Err(e) => {
                    warn!(process = %managed.spec.name, error = %e, "status check failed");
                    still_running.push(managed);
                    continue;
                }
            };

            // Give the pipe readers a moment to drain what the child wrote last
            tokio::time::sleep(Duration::from_millis(20)).await;
            let output = take_tail(&managed.output);
            let name = managed.spec.name.clone();
            let exit_code = status.code();
            warn!(process = %name, pid = ?managed.pid, ?exit_code, "process exited");

            self.audit.log_best_effort(
                "process_crash",
                &name,
                json!({
                    "pid": managed.pid,
                    "exit_code": exit_code,
                    "output": output,
                    "restart": managed.spec.restart,
                }),
                AuditResult::Failure,
            );

            let restarted = if managed.spec.restart {
                self.relaunch(managed.spec, &mut still_running)
            } else {
                info!(process = %name, "not restarting per roster");
                None
            };
            events.push(CrashEvent {
                name,
                pid: managed.pid,
                exit_code,
                restarted,
            });
        }

        for spec in std::mem::take(&mut self.pending) {
            self.relaunch(spec, &mut still_running);
        }

        self.running = still_running;
        events
    }

    fn relaunch(&mut self, spec: ProcessConfig, running: &mut Vec<Managed>) -> Option<u32> {
        match spawn(&spec) {
            Ok(managed) => {
                info!(process = %spec.name, pid = ?managed.pid, "restarted");
                let pid = managed.pid;
                running.push(managed);
                pid
            }
            Err(e) => {
                error!(process = %spec.name, error = %e, "restart failed, retrying next pass");
                self.pending.push(spec);
                None
            }
        }
    }

    /// Start everything, then monitor until `shutdown` flips to true.
    /// Each pass waits the full interval, including after a restart.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        let started = self.start_all();
        info!(processes = started, interval_secs = self.interval.as_secs(), "supervisor running");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    self.monitor_once().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        self.shutdown().await;
    }

    /// SIGTERM every child, wait up to the grace period, then SIGKILL
    pub async fn shutdown(&mut self) {
        let mut managed = std::mem::take(&mut self.running);
        info!(count = managed.len(), "stopping managed processes");

        for m in &mut managed {
            terminate(m);
        }

        let deadline = tokio::time::Instant::now() + self.grace;
        for m in &mut managed {
            match tokio::time::timeout_at(deadline, m.child.wait()).await {
                Ok(Ok(status)) => info!(process = %m.spec.name, ?status, "stopped"),
                Ok(Err(e)) => warn!(process = %m.spec.name, error = %e, "wait failed"),
                Err(_) => {
                    warn!(process = %m.spec.name, "grace period over, killing");
                    force_kill(m);
                    if let Err(e) = m.child.kill().await {
                        warn!(process = %m.spec.name, error = %e, "kill failed");
                    }
                }
            }
        }
        self.pending.clear();
    }
}

fn spawn(spec: &ProcessConfig) -> Result<Managed, SupervisorError> {
    let (program, args) = spec
        .command
        .split_first()
        .ok_or_else(|| SupervisorError::EmptyCommand {
            name: spec.name.clone(),
        })?;

    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);

    let mut child = command.spawn().map_err(|source| SupervisorError::Spawn {
        name: spec.name.clone(),
        source,
    })?;
    let pid = child.id();
    info!(process = %spec.name, ?pid, "started");

    let output: OutputTail = Arc::new(Mutex::new(VecDeque::new()));
    if let Some(stdout) = child.stdout.take() {
        drain(stdout, Arc::clone(&output));
    }
    if let Some(stderr) = child.stderr.take() {
        drain(stderr, Arc::clone(&output));
    }

    Ok(Managed {
        spec: spec.clone(),
        child,
        pid,
        output,
    })
}

/// Keep the last lines of a child pipe so a full pipe never blocks the child
fn drain<R>(reader: R, tail: OutputTail)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if let Ok(mut buf) = tail.lock() {
                if buf.len() == OUTPUT_TAIL_LINES {
                    buf.pop_front();
                }
                buf.push_back(line);
            }
        }
    });
}

fn take_tail(tail: &OutputTail) -> String {
    tail.lock()
        .map(|mut buf| buf.drain(..).collect::<Vec<_>>().join("\n"))
        .unwrap_or_default()
}

#[cfg(unix)]
fn signal_group(m: &Managed, signal: libc::c_int) {
    let Some(pid) = m.pid.and_then(|p| libc::pid_t::try_from(p).ok()) else {
        return;
    };
    // SAFETY: plain kill(2) on the child's process group
    let rc = unsafe { libc::kill(-pid, signal) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            warn!(process = %m.spec.name, error = %err, "signal failed");
        }
    }
}

#[cfg(unix)]
fn terminate(m: &mut Managed) {
    signal_group(m, libc::SIGTERM);
}

#[cfg(not(unix))]
fn terminate(m: &mut Managed) {
    let _ = m.child.start_kill();
}

#[cfg(unix)]
fn force_kill(m: &mut Managed) {
    signal_group(m, libc::SIGKILL);
}

#[cfg(not(unix))]
fn force_kill(_m: &mut Managed) {}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::lock::process_alive;
    use crate::vault::Vault;
    use tempfile::tempdir;

    fn entry(name: &str, script: &str, restart: bool) -> ProcessConfig {
        ProcessConfig {
            name: name.to_string(),
            command: vec!["sh".into(), "-c".into(), script.into()],
            restart,
        }
    }

    fn supervisor(processes: Vec<ProcessConfig>) -> (tempfile::TempDir, AuditLogger, Supervisor) {
        let dir = tempdir().unwrap();
        let vault = Vault::new(dir.path());
        vault.ensure_layout(&[]).unwrap();
        let audit = AuditLogger::new(&vault, "watchdog");
        let config = SupervisorConfig {
            check_interval_secs: 60,
            shutdown_grace_secs: 1,
            processes,
        };
        let sup = Supervisor::new(&config, audit.clone());
        (dir, audit, sup)
    }

    /// Poll monitor passes until something is reaped
    async fn wait_for_crash(sup: &mut Supervisor) -> Vec<CrashEvent> {
        for _ in 0..100 {
            let events = sup.monitor_once().await;
            if !events.is_empty() {
                return events;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("no crash observed");
    }

    #[tokio::test]
    async fn test_crash_is_audited_and_restarted() {
        let (_dir, audit, mut sup) =
            supervisor(vec![entry("flaky", "echo booting; echo bad >&2; exit 3", true)]);
        assert_eq!(sup.start_all(), 1);
        let first = sup.pid("flaky").unwrap();

        let events = wait_for_crash(&mut sup).await;
        assert_eq!(events[0].exit_code, Some(3));
        assert_eq!(events[0].pid, Some(first));
        let second = events[0].restarted.unwrap();
        assert_ne!(first, second);

        let entries = AuditLogger::read_entries(&audit.today_path()).unwrap();
        let crash = entries.iter().find(|e| e.action_type == "process_crash").unwrap();
        assert_eq!(crash.target, "flaky");
        assert_eq!(crash.parameters["exit_code"], 3);
        assert!(crash.parameters["output"].as_str().unwrap().contains("booting"));
        sup.shutdown().await;
    }

    #[tokio::test]
    async fn test_killed_process_gets_new_pid() {
        let (_dir, audit, mut sup) = supervisor(vec![entry("sleeper", "sleep 30", true)]);
        sup.start_all();
        let pid = sup.pid("sleeper").unwrap();
        assert!(sup.monitor_once().await.is_empty());

        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGKILL);
        }
        let events = wait_for_crash(&mut sup).await;
        let new_pid = sup.pid("sleeper").unwrap();
        assert_ne!(pid, new_pid);
        assert_eq!(events[0].restarted, Some(new_pid));

        let crashes = AuditLogger::read_entries(&audit.today_path())
            .unwrap()
            .into_iter()
            .filter(|e| e.action_type == "process_crash")
            .count();
        assert_eq!(crashes, 1);

        sup.shutdown().await;
        assert!(sup.running().is_empty());
        assert!(!process_alive(new_pid));
    }

    #[tokio::test]
    async fn test_non_restartable_is_dropped() {
        let (_dir, _audit, mut sup) = supervisor(vec![entry("once", "exit 0", false)]);
        sup.start_all();
        let events = wait_for_crash(&mut sup).await;
        assert_eq!(events[0].restarted, None);
        assert!(sup.running().is_empty());
        assert!(sup.monitor_once().await.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_escalates_to_kill() {
        let (_dir, _audit, mut sup) =
            supervisor(vec![entry("stubborn", "trap '' TERM; while true; do sleep 1; done", true)]);
        sup.start_all();
        let pid = sup.pid("stubborn").unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let started = std::time::Instant::now();
        sup.shutdown().await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!process_alive(pid));
    }

    #[tokio::test]
    async fn test_unlaunchable_entry_does_not_block_others() {
        let bad = ProcessConfig {
            name: "missing".into(),
            command: vec!["/nonexistent/binary".into()],
            restart: false,
        };
        let (_dir, audit, mut sup) = supervisor(vec![bad, entry("ok", "sleep 30", true)]);
        assert_eq!(sup.start_all(), 1);
        assert_eq!(sup.running(), vec!["ok".to_string()]);
        let entries = AuditLogger::read_entries(&audit.today_path()).unwrap();
        assert_eq!(entries[0].action_type, "process_start");
        sup.shutdown().await;
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown_signal() {
        let (_dir, _audit, mut sup) = supervisor(vec![entry("sleeper", "sleep 30", true)]);
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            sup.run(rx).await;
            sup
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();
        let sup = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(sup.running().is_empty());
    }
}
