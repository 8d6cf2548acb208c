//! Strategy layer: cleanup participants run after the process sweep
//!
//! Handlers run in ascending priority. Each pipeline instance owns its own
//! handler and deregisters it when it finishes normally.

use anyhow::Result;
use async_trait::async_trait;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{error, info, warn};

use crate::services::docker::ContainerEngine;

pub const SERVICE_CONTINUITY_PRIORITY: i32 = 10;
pub const DATA_SAFETY_PRIORITY: i32 = 20;
pub const GENERIC_CLEANUP_PRIORITY: i32 = 50;

#[async_trait]
pub trait ExitHandler: Send + Sync {
    fn name(&self) -> &str;

    fn priority(&self) -> i32;

    async fn cleanup(&self) -> Result<HandlerOutcome>;
}

/// What a handler did during cleanup, for the interruption report
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandlerOutcome {
    pub actions: Vec<String>,
    pub failures: Vec<String>,
}

impl HandlerOutcome {
    pub fn failed(reason: String) -> Self {
        Self {
            actions: Vec::new(),
            failures: vec![reason],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoppedContainer {
    pub id: String,
    pub name: String,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// === SERVICE CONTINUITY (backup) ===

/// Restarts containers a backup stopped but has not started again
pub struct ServiceContinuityHandler {
    unit: String,
    engine: Arc<dyn ContainerEngine>,
    start_timeout: Duration,
    stopped: Mutex<Vec<StoppedContainer>>,
}

impl ServiceContinuityHandler {
    pub fn new(unit: &str, engine: Arc<dyn ContainerEngine>, start_timeout: Duration) -> Self {
        Self {
            unit: unit.to_string(),
            engine,
            start_timeout,
            stopped: Mutex::new(Vec::new()),
        }
    }

    /// Must be called before the stop call is issued
    pub fn register_container(&self, id: &str, name: &str) {
        let mut stopped = lock(&self.stopped);
        if !stopped.iter().any(|c| c.id == id) {
            stopped.push(StoppedContainer {
                id: id.to_string(),
                name: name.to_string(),
            });
        }
    }

    pub fn unregister_container(&self, id: &str) -> bool {
        let mut stopped = lock(&self.stopped);
        let before = stopped.len();
        stopped.retain(|c| c.id != id);
        stopped.len() != before
    }

    pub fn is_registered(&self, id: &str) -> bool {
        lock(&self.stopped).iter().any(|c| c.id == id)
    }

    /// Registered containers in stop order
    pub fn pending(&self) -> Vec<StoppedContainer> {
        lock(&self.stopped).clone()
    }

    fn take_pending(&self) -> Vec<StoppedContainer> {
        std::mem::take(&mut *lock(&self.stopped))
    }
}

#[async_trait]
impl ExitHandler for ServiceContinuityHandler {
    fn name(&self) -> &str {
        "service-continuity"
    }

    fn priority(&self) -> i32 {
        SERVICE_CONTINUITY_PRIORITY
    }

    async fn cleanup(&self) -> Result<HandlerOutcome> {
        let pending = self.take_pending();
        let mut outcome = HandlerOutcome::default();
        if pending.is_empty() {
            return Ok(outcome);
        }

        info!(unit = %self.unit, count = pending.len(), "Restarting containers stopped for backup");
        for container in pending.iter().rev() {
            match tokio::time::timeout(self.start_timeout, self.engine.start(&container.id)).await {
                Ok(Ok(())) => {
                    info!(unit = %self.unit, container = %container.name, "Container restarted");
                    outcome.actions.push(format!("restarted {}", container.name));
                }
                Ok(Err(e)) => {
                    error!(unit = %self.unit, container = %container.name, "Failed to restart container: {}", e);
                    outcome
                        .failures
                        .push(format!("restart {} failed: {}", container.name, e));
                }
                Err(_) => {
                    error!(unit = %self.unit, container = %container.name, "Restart timed out");
                    outcome.failures.push(format!(
                        "restart {} timed out after {}s",
                        container.name,
                        self.start_timeout.as_secs()
                    ));
                }
            }
        }
        Ok(outcome)
    }
}

// === DATA SAFETY (restore) ===

/// Leaves containers stopped and removes scratch data of an interrupted restore
pub struct DataSafetyHandler {
    unit: String,
    stopped: Mutex<Vec<StoppedContainer>>,
    temp_dirs: Mutex<Vec<PathBuf>>,
}

impl DataSafetyHandler {
    pub fn new(unit: &str) -> Self {
        Self {
            unit: unit.to_string(),
            stopped: Mutex::new(Vec::new()),
            temp_dirs: Mutex::new(Vec::new()),
        }
    }

    pub fn register_stopped(&self, id: &str, name: &str) {
        let mut stopped = lock(&self.stopped);
        if !stopped.iter().any(|c| c.id == id) {
            stopped.push(StoppedContainer {
                id: id.to_string(),
                name: name.to_string(),
            });
        }
    }

    pub fn unregister_stopped(&self, id: &str) -> bool {
        let mut stopped = lock(&self.stopped);
        let before = stopped.len();
        stopped.retain(|c| c.id != id);
        stopped.len() != before
    }

    pub fn stopped(&self) -> Vec<StoppedContainer> {
        lock(&self.stopped).clone()
    }

    pub fn register_temp_dir(&self, path: &Path) {
        let mut dirs = lock(&self.temp_dirs);
        if !dirs.iter().any(|d| d == path) {
            dirs.push(path.to_path_buf());
        }
    }

    pub fn unregister_temp_dir(&self, path: &Path) -> bool {
        let mut dirs = lock(&self.temp_dirs);
        let before = dirs.len();
        dirs.retain(|d| d != path);
        dirs.len() != before
    }

    pub fn temp_dirs(&self) -> Vec<PathBuf> {
        lock(&self.temp_dirs).clone()
    }
}

#[async_trait]
impl ExitHandler for DataSafetyHandler {
    fn name(&self) -> &str {
        "data-safety"
    }

    fn priority(&self) -> i32 {
        DATA_SAFETY_PRIORITY
    }

    async fn cleanup(&self) -> Result<HandlerOutcome> {
        let mut outcome = HandlerOutcome::default();

        let dirs = std::mem::take(&mut *lock(&self.temp_dirs));
        for dir in dirs {
            if !dir.exists() {
                continue;
            }
            match tokio::fs::remove_dir_all(&dir).await {
                Ok(()) => outcome
                    .actions
                    .push(format!("removed temp dir {}", dir.display())),
                Err(e) => {
                    error!(unit = %self.unit, "Failed to remove {}: {}", dir.display(), e);
                    outcome
                        .failures
                        .push(format!("remove {} failed: {}", dir.display(), e));
                }
            }
        }

        let stopped = self.stopped();
        if !stopped.is_empty() {
            let names: Vec<&str> = stopped.iter().map(|c| c.name.as_str()).collect();
            for name in &names {
                outcome.actions.push(format!("left {} stopped", name));
            }
            warn!(
                unit = %self.unit,
                "Restore interrupted; containers left stopped because restored data is unverified"
            );
            warn!(
                "After checking the volumes, restart manually with: docker start {}",
                names.join(" ")
            );
        }

        Ok(outcome)
    }
}

// === GENERIC CLEANUP ===

pub trait CleanupCallback: Send + Sync {
    fn name(&self) -> &str;

    fn run(&self) -> Result<()>;
}

/// Adapts a closure into a named callback
pub struct FnCleanup<F> {
    name: String,
    callback: F,
}

impl<F> FnCleanup<F>
where
    F: Fn() -> Result<()> + Send + Sync,
{
    pub fn new(name: &str, callback: F) -> Self {
        Self {
            name: name.to_string(),
            callback,
        }
    }
}

impl<F> CleanupCallback for FnCleanup<F>
where
    F: Fn() -> Result<()> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self) -> Result<()> {
        (self.callback)()
    }
}

#[derive(Default)]
pub struct GenericCleanupHandler {
    callbacks: Mutex<Vec<Arc<dyn CleanupCallback>>>,
}

impl GenericCleanupHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, callback: Arc<dyn CleanupCallback>) {
        lock(&self.callbacks).push(callback);
    }

    pub fn add_fn<F>(&self, name: &str, callback: F)
    where
        F: Fn() -> Result<()> + Send + Sync + 'static,
    {
        self.add(Arc::new(FnCleanup::new(name, callback)));
    }

    pub fn remove(&self, name: &str) -> bool {
        let mut callbacks = lock(&self.callbacks);
        let before = callbacks.len();
        callbacks.retain(|c| c.name() != name);
        callbacks.len() != before
    }

    pub fn len(&self) -> usize {
        lock(&self.callbacks).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ExitHandler for GenericCleanupHandler {
    fn name(&self) -> &str {
        "generic-cleanup"
    }

    fn priority(&self) -> i32 {
        GENERIC_CLEANUP_PRIORITY
    }

    async fn cleanup(&self) -> Result<HandlerOutcome> {
        let callbacks = lock(&self.callbacks).clone();
        let mut outcome = HandlerOutcome::default();

        for callback in callbacks {
            match std::panic::catch_unwind(AssertUnwindSafe(|| callback.run())) {
                Ok(Ok(())) => outcome.actions.push(format!("ran {}", callback.name())),
                Ok(Err(e)) => {
                    warn!(callback = callback.name(), "Cleanup callback failed: {}", e);
                    outcome
                        .failures
                        .push(format!("{} failed: {}", callback.name(), e));
                }
                Err(_) => {
                    error!(callback = callback.name(), "Cleanup callback panicked");
                    outcome.failures.push(format!("{} panicked", callback.name()));
                }
            }
        }
        Ok(outcome)
    }
}
