//! Process layer: every external process the wrapper spawns, by pid
//!
//! Entries are added right after spawn and removed exactly once, either by
//! the wrapper when the outcome is known or by the termination sweep.
//! Removal is idempotent so the two paths can race safely.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const LIVENESS_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessHandle(u64);

#[derive(Debug, Clone)]
pub struct TrackedProcess {
    pub pid: u32,
    pub label: String,
    pub registered_at: DateTime<Utc>,
}

impl TrackedProcess {
    pub fn describe(&self) -> String {
        format!("{} (pid {})", self.label, self.pid)
    }
}

/// Outcome of the two-pass termination sweep
#[derive(Debug, Clone, Default)]
pub struct SweepReport {
    /// Exited within the grace window after SIGTERM
    pub terminated: Vec<TrackedProcess>,
    /// Still alive after the grace window, sent SIGKILL
    pub killed: Vec<TrackedProcess>,
}

impl SweepReport {
    pub fn total(&self) -> usize {
        self.terminated.len() + self.killed.len()
    }
}

#[derive(Debug, Default)]
pub struct ProcessRegistry {
    next_handle: AtomicU64,
    entries: Mutex<BTreeMap<ProcessHandle, TrackedProcess>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, BTreeMap<ProcessHandle, TrackedProcess>> {
        // A poisoned lock still holds a consistent map; keep tracking
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn register(&self, pid: u32, label: &str) -> ProcessHandle {
        let handle = ProcessHandle(self.next_handle.fetch_add(1, Ordering::SeqCst));
        let process = TrackedProcess {
            pid,
            label: label.to_string(),
            registered_at: Utc::now(),
        };
        debug!(pid, label, "Tracking process");
        self.entries().insert(handle, process);
        handle
    }

    /// Returns false when the handle was already removed
    pub fn unregister(&self, handle: ProcessHandle) -> bool {
        match self.entries().remove(&handle) {
            Some(process) => {
                debug!(pid = process.pid, label = %process.label, "Process no longer tracked");
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    pub fn snapshot(&self) -> Vec<(ProcessHandle, TrackedProcess)> {
        self.entries()
            .iter()
            .map(|(handle, process)| (*handle, process.clone()))
            .collect()
    }

    /// SIGTERM every tracked process group, wait up to `grace`, SIGKILL the
    /// survivors and drop the swept entries.
    pub async fn terminate_all(&self, grace: Duration) -> SweepReport {
        let first_pass = self.snapshot();
        if first_pass.is_empty() {
            debug!("No tracked processes to terminate");
            return SweepReport::default();
        }

        info!(count = first_pass.len(), "Sending SIGTERM to tracked processes");
        for (_, process) in &first_pass {
            signal_process_group(process.pid, libc::SIGTERM);
        }

        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if first_pass.iter().all(|(_, p)| !process_alive(p.pid)) {
                break;
            }
            tokio::time::sleep(LIVENESS_POLL).await;
        }

        // Late registrations made during the grace window are swept too
        let second_pass = self.snapshot();
        let mut report = SweepReport::default();
        for (handle, process) in second_pass {
            if process_alive(process.pid) {
                warn!(pid = process.pid, label = %process.label, "Process survived SIGTERM, sending SIGKILL");
                signal_process_group(process.pid, libc::SIGKILL);
                report.killed.push(process);
            } else {
                report.terminated.push(process);
            }
            self.unregister(handle);
        }

        info!(
            terminated = report.terminated.len(),
            killed = report.killed.len(),
            "Process sweep finished"
        );
        report
    }
}

/// Signal the process group led by `pid`, falling back to the pid alone
pub fn signal_process_group(pid: u32, signal: i32) {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return;
    };
    let group = unsafe { libc::kill(-pid, signal) };
    if group != 0 {
        unsafe {
            libc::kill(pid, signal);
        }
    }
}

/// True when `pid` exists and is not a zombie waiting to be reaped
pub fn process_alive(pid: u32) -> bool {
    let Ok(raw) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if unsafe { libc::kill(raw, 0) } != 0 {
        return std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM);
    }
    match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Ok(stat) => !stat_is_zombie(&stat),
        Err(_) => true,
    }
}

fn stat_is_zombie(stat: &str) -> bool {
    // Field 3, after the parenthesised command name
    stat.rsplit_once(')')
        .and_then(|(_, rest)| rest.trim_start().chars().next())
        .map(|state| state == 'Z' || state == 'X')
        .unwrap_or(false)
}
