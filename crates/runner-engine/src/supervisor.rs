//! Child supervision: pty spawn and the four per-run event sources.
//!
//! `start` forks the task's entry point under a pseudo-terminal and registers
//! the sources that drive it from there: a line reader on the pty master, a
//! child-exit watch, the local watchdog timeout, and the heartbeat. Each
//! source only sends events; the runner owns all state and reacts to them on
//! its own task.

use std::fmt;
use std::io::{BufRead, BufReader};
use std::time::Duration;

use chrono::Local;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use portable_pty::{
    CommandBuilder, ExitStatus, MasterPty, PtySize, native_pty_system,
};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use taskrun_core::settings::RunnerSettings;

use crate::task::{Task, TaskError};

pub(crate) const SIGKILL_SIGNO: i32 = Signal::SIGKILL as i32;
pub(crate) const EXPIRE_TIME_FORMAT: &str = "%a %b %d %H:%M:%S %Y";

const CHILD_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// One event from a per-run source. The serial ties it to a specific `start`
/// call so a late event from a torn-down run cannot leak into the next one.
#[derive(Debug)]
pub(crate) struct RunEvent {
    pub(crate) serial: u64,
    pub(crate) kind: RunEventKind,
}

#[derive(Debug)]
pub(crate) enum RunEventKind {
    PtyLine(String),
    PtyClosed,
    ChildExited(ExitStatus),
    WatchdogFired,
    HeartbeatTick,
}

/// Handle to one registered event source. Clearing (or dropping) it
/// deregisters the source exactly once; clearing again is a no-op.
pub(crate) struct SourceGuard(Option<AbortHandle>);

impl SourceGuard {
    fn new(handle: AbortHandle) -> Self {
        Self(Some(handle))
    }

    pub(crate) fn clear(&mut self) {
        if let Some(handle) = self.0.take() {
            handle.abort();
        }
    }

    pub(crate) fn is_armed(&self) -> bool {
        self.0.is_some()
    }
}

impl Drop for SourceGuard {
    fn drop(&mut self) {
        self.clear();
    }
}

impl fmt::Debug for SourceGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SourceGuard").field(&self.is_armed()).finish()
    }
}

/// Everything a running child holds: the four source guards plus the pty
/// master keeping the fd alive. Dropping this releases all of it.
pub(crate) struct RunSources {
    pub(crate) pty: SourceGuard,
    pub(crate) child: SourceGuard,
    pub(crate) timeout: SourceGuard,
    pub(crate) heartbeat: SourceGuard,
    _master: std::sync::Mutex<Box<dyn MasterPty + Send>>,
}

impl fmt::Debug for RunSources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunSources")
            .field("pty", &self.pty)
            .field("child", &self.child)
            .field("timeout", &self.timeout)
            .field("heartbeat", &self.heartbeat)
            .finish()
    }
}

/// Deliver SIGKILL to `pid`. Returns whether the kill landed.
pub(crate) fn kill_child(pid: u32) -> bool {
    kill(Pid::from_raw(pid as i32), Signal::SIGKILL).is_ok()
}

/// Spawn the task's entry point under a pty and register its event sources.
///
/// On success `task.pid` is set and `task.sources` holds all four guards; on
/// any failure nothing is registered.
pub(crate) fn start(
    task: &mut Task,
    events: &mpsc::UnboundedSender<RunEvent>,
    serial: u64,
    settings: &RunnerSettings,
) -> Result<(), TaskError> {
    if !task.path.is_dir() {
        return Err(TaskError::Chdir {
            path: task.path.display().to_string(),
        });
    }
    let Some(program) = task.entry_point.first() else {
        return Err(TaskError::Fork);
    };

    let pty_system = native_pty_system();
    let pair = pty_system
        .openpty(PtySize {
            rows: 24,
            cols: 80,
            pixel_width: 480,
            pixel_height: 192,
        })
        .map_err(|_| TaskError::Fork)?;

    let mut cmd = CommandBuilder::new(program);
    cmd.args(&task.entry_point[1..]);
    cmd.cwd(&task.path);
    // The child sees exactly the materialized vector, applied in order so
    // later duplicates win.
    cmd.env_clear();
    for entry in task.env.as_deref().unwrap_or(&[]) {
        if let Some((name, value)) = entry.split_once('=') {
            cmd.env(name, value);
        }
    }

    let mut child = pair.slave.spawn_command(cmd).map_err(|_| TaskError::Fork)?;
    // Drop our slave handle so the master sees EOF once the child is gone.
    drop(pair.slave);

    let pid = child.process_id().ok_or(TaskError::Fork)?;
    task.pid = Some(pid);

    let reader = pair.master.try_clone_reader().map_err(|_| TaskError::Fork)?;
    let tx = events.clone();
    let pty = tokio::task::spawn_blocking(move || {
        for line in BufReader::new(reader).lines() {
            match line {
                Ok(mut line) => {
                    // the pty cooks \n into \r\n; lines() only strips the \n
                    if line.ends_with('\r') {
                        line.pop();
                    }
                    if tx.send(RunEvent { serial, kind: RunEventKind::PtyLine(line) }).is_err() {
                        return;
                    }
                }
                // pty masters report EIO instead of EOF once the slave closes
                Err(_) => break,
            }
        }
        let _ = tx.send(RunEvent { serial, kind: RunEventKind::PtyClosed });
    })
    .abort_handle();

    let tx = events.clone();
    let child_watch = tokio::spawn(async move {
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => tokio::time::sleep(CHILD_POLL_INTERVAL).await,
                Err(_) => break ExitStatus::with_exit_code(1),
            }
        };
        let _ = tx.send(RunEvent { serial, kind: RunEventKind::ChildExited(status) });
    })
    .abort_handle();

    let tx = events.clone();
    let max_time = task.max_time;
    let timeout = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(max_time)).await;
        let _ = tx.send(RunEvent { serial, kind: RunEventKind::WatchdogFired });
    })
    .abort_handle();

    let tx = events.clone();
    let period = Duration::from_secs(settings.heartbeat_interval.max(1));
    let heartbeat = tokio::spawn(async move {
        let mut tick = tokio::time::interval(period);
        // the first tick completes immediately; the heartbeat starts one
        // period in
        tick.tick().await;
        loop {
            tick.tick().await;
            if tx.send(RunEvent { serial, kind: RunEventKind::HeartbeatTick }).is_err() {
                return;
            }
        }
    })
    .abort_handle();

    let expire = Local::now() + chrono::TimeDelta::seconds(task.max_time as i64);
    task.expire_time = expire.format(EXPIRE_TIME_FORMAT).to_string();

    task.sources = Some(RunSources {
        pty: SourceGuard::new(pty),
        child: SourceGuard::new(child_watch),
        timeout: SourceGuard::new(timeout),
        heartbeat: SourceGuard::new(heartbeat),
        _master: std::sync::Mutex::new(pair.master),
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn clearing_a_guard_twice_is_a_no_op() {
        let handle = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        })
        .abort_handle();
        let mut guard = SourceGuard::new(handle);
        assert!(guard.is_armed());
        guard.clear();
        assert!(!guard.is_armed());
        guard.clear();
        assert!(!guard.is_armed());
    }

    #[test]
    fn sigkill_signo_matches_the_wire_value() {
        assert_eq!(SIGKILL_SIGNO, 9);
    }
}
