//! Exit-safety coordinator
//!
//! Two layers react to SIGINT, SIGTERM and SIGHUP:
//!
//! - **Process layer**: every process spawned through the command wrapper is
//!   tracked by pid. On signal each one gets SIGTERM, then SIGKILL once the
//!   grace window runs out.
//! - **Strategy layer**: pipelines register handlers (restart what a backup
//!   stopped, leave a restore's containers down, remove temp dirs). They run
//!   once each, in ascending priority, after the process layer is done.
//!
//! A single flag guards the cleanup pass. A second signal while cleanup is
//! running exits immediately with 128 + signal number.
//!
//! # Usage
//!
//! ```ignore
//! let coordinator = ExitSafety::new();
//! coordinator.install()?;
//! let runner = CommandRunner::new(coordinator.clone(), Duration::from_secs(300));
//! ```

pub mod handlers;
pub mod process_registry;

use anyhow::{Context, Result};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub use handlers::{
    CleanupCallback, DataSafetyHandler, ExitHandler, FnCleanup, GenericCleanupHandler,
    HandlerOutcome, ServiceContinuityHandler, StoppedContainer,
};
pub use process_registry::{
    process_alive, ProcessHandle, ProcessRegistry, SweepReport, TrackedProcess,
};

/// Grace window between SIGTERM and SIGKILL
pub const DEFAULT_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

#[derive(Default)]
struct HandlerRegistry {
    next_id: AtomicU64,
    entries: Mutex<Vec<(HandlerId, Arc<dyn ExitHandler>)>>,
}

impl HandlerRegistry {
    fn entries(&self) -> MutexGuard<'_, Vec<(HandlerId, Arc<dyn ExitHandler>)>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn register(&self, handler: Arc<dyn ExitHandler>) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.entries().push((id, handler));
        id
    }

    fn unregister(&self, id: HandlerId) -> bool {
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|(existing, _)| *existing != id);
        entries.len() != before
    }

    /// Ascending priority, registration order within a priority
    fn ordered(&self) -> Vec<(HandlerId, Arc<dyn ExitHandler>)> {
        let mut handlers = self.entries().clone();
        handlers.sort_by_key(|(id, handler)| (handler.priority(), *id));
        handlers
    }
}

#[derive(Debug, Clone)]
pub struct HandlerReport {
    pub name: String,
    pub priority: i32,
    pub outcome: HandlerOutcome,
}

/// Everything one cleanup pass did
#[derive(Debug, Clone)]
pub struct CleanupReport {
    pub signal: i32,
    pub sweep: SweepReport,
    pub handlers: Vec<HandlerReport>,
}

impl CleanupReport {
    pub fn exit_code(&self) -> i32 {
        exit_code_for(self.signal)
    }

    pub fn lines(&self) -> Vec<String> {
        let mut lines = vec![format!("Interrupted by {}", signal_name(self.signal))];
        for process in &self.sweep.terminated {
            lines.push(format!("  terminated {}", process.describe()));
        }
        for process in &self.sweep.killed {
            lines.push(format!("  force-killed {}", process.describe()));
        }
        for handler in &self.handlers {
            for action in &handler.outcome.actions {
                lines.push(format!("  [{}] {}", handler.name, action));
            }
            for failure in &handler.outcome.failures {
                lines.push(format!("  [{}] FAILED: {}", handler.name, failure));
            }
        }
        lines
    }
}

pub struct ExitSafety {
    processes: ProcessRegistry,
    handlers: HandlerRegistry,
    cleanup_started: AtomicBool,
    cleanup_signal: AtomicI32,
    installed: AtomicBool,
    grace: Duration,
}

impl ExitSafety {
    pub fn new() -> Arc<Self> {
        Self::with_grace(DEFAULT_GRACE)
    }

    pub fn with_grace(grace: Duration) -> Arc<Self> {
        Arc::new(Self {
            processes: ProcessRegistry::new(),
            handlers: HandlerRegistry::default(),
            cleanup_started: AtomicBool::new(false),
            cleanup_signal: AtomicI32::new(0),
            installed: AtomicBool::new(false),
            grace,
        })
    }

    // === Process layer ===

    pub fn register(&self, pid: u32, label: &str) -> ProcessHandle {
        self.processes.register(pid, label)
    }

    pub fn unregister(&self, handle: ProcessHandle) -> bool {
        self.processes.unregister(handle)
    }

    pub fn tracked_processes(&self) -> Vec<TrackedProcess> {
        self.processes
            .snapshot()
            .into_iter()
            .map(|(_, process)| process)
            .collect()
    }

    // === Strategy layer ===

    pub fn register_handler(&self, handler: Arc<dyn ExitHandler>) -> HandlerId {
        debug!(handler = handler.name(), priority = handler.priority(), "Registering exit handler");
        self.handlers.register(handler)
    }

    pub fn unregister_handler(&self, id: HandlerId) -> bool {
        self.handlers.unregister(id)
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.entries().len()
    }

    /// True once a signal-driven cleanup pass has begun
    pub fn cleanup_started(&self) -> bool {
        self.cleanup_started.load(Ordering::SeqCst)
    }

    /// Signal that started the cleanup pass, if one has begun
    pub fn cleanup_signal(&self) -> Option<i32> {
        if !self.cleanup_started() {
            return None;
        }
        match self.cleanup_signal.load(Ordering::SeqCst) {
            0 => None,
            signal => Some(signal),
        }
    }

    fn begin_cleanup(&self, signal: i32) -> bool {
        let first = self
            .cleanup_started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if first {
            self.cleanup_signal.store(signal, Ordering::SeqCst);
        }
        first
    }

    /// Bind the signal handlers. Idempotent; needs a running tokio runtime.
    pub fn install(self: &Arc<Self>) -> Result<()> {
        use tokio::signal::unix::{signal, SignalKind};

        if self.installed.swap(true, Ordering::SeqCst) {
            debug!("Exit-safety handlers already installed");
            return Ok(());
        }

        let streams = (|| -> std::io::Result<_> {
            Ok((
                signal(SignalKind::interrupt())?,
                signal(SignalKind::terminate())?,
                signal(SignalKind::hangup())?,
            ))
        })();
        let (mut sigint, mut sigterm, mut sighup) = match streams {
            Ok(streams) => streams,
            Err(e) => {
                self.installed.store(false, Ordering::SeqCst);
                return Err(e).context("Failed to bind signal handlers");
            }
        };

        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let signo = tokio::select! {
                    _ = sigint.recv() => libc::SIGINT,
                    _ = sigterm.recv() => libc::SIGTERM,
                    _ = sighup.recv() => libc::SIGHUP,
                };

                if !coordinator.begin_cleanup(signo) {
                    eprintln!(
                        "Received {} during cleanup, exiting immediately",
                        signal_name(signo)
                    );
                    std::process::exit(exit_code_for(signo));
                }

                let worker = Arc::clone(&coordinator);
                tokio::spawn(async move {
                    let report = worker.cleanup_pass(signo).await;
                    for line in report.lines() {
                        eprintln!("{}", line);
                    }
                    std::process::exit(report.exit_code());
                });
            }
        });

        info!("Exit-safety signal handlers installed");
        Ok(())
    }

    /// Run the two-layer cleanup as if `signal` had arrived, without exiting.
    /// Returns `None` when another pass already started.
    pub async fn run_cleanup(&self, signal: i32) -> Option<CleanupReport> {
        if !self.begin_cleanup(signal) {
            warn!("Cleanup already in progress, ignoring {}", signal_name(signal));
            return None;
        }
        Some(self.cleanup_pass(signal).await)
    }

    async fn cleanup_pass(&self, signal: i32) -> CleanupReport {
        warn!(signal = signal_name(signal), "Interrupted, running exit-safety cleanup");

        let sweep = self.processes.terminate_all(self.grace).await;

        let mut reports = Vec::new();
        for (_, handler) in self.handlers.ordered() {
            let name = handler.name().to_string();
            let priority = handler.priority();
            info!(handler = %name, priority, "Running exit handler");

            let outcome = match AssertUnwindSafe(handler.cleanup()).catch_unwind().await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(e)) => {
                    error!(handler = %name, "Exit handler failed: {}", e);
                    HandlerOutcome::failed(e.to_string())
                }
                Err(panic) => {
                    let reason = panic_message(panic.as_ref());
                    error!(handler = %name, "Exit handler panicked: {}", reason);
                    HandlerOutcome::failed(format!("panicked: {}", reason))
                }
            };
            reports.push(HandlerReport {
                name,
                priority,
                outcome,
            });
        }

        CleanupReport {
            signal,
            sweep,
            handlers: reports,
        }
    }
}

pub fn exit_code_for(signal: i32) -> i32 {
    128 + signal
}

pub fn signal_name(signal: i32) -> &'static str {
    match signal {
        libc::SIGINT => "SIGINT",
        libc::SIGTERM => "SIGTERM",
        libc::SIGHUP => "SIGHUP",
        libc::SIGKILL => "SIGKILL",
        _ => "signal",
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
