//! In-flight run tracking per backup unit
//!
//! A unit has at most one backup or restore running at a time. Independent
//! units run concurrently; the tracker is the only thing they share besides
//! the exit-safety coordinator.
//!
//! # Usage
//!
//! ```ignore
//! tracker.try_start("demo", "backup 20260301T023000-ab12cd34").await?;
//! // run the pipeline...
//! tracker.finish("demo").await;
//! ```

use chrono::{DateTime, Utc};
use executor::errors::{PreconditionError, VaultError};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, instrument};

#[derive(Debug, Clone, Serialize)]
pub struct ActiveRun {
    pub unit: String,
    pub operation: String,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunStatus {
    pub busy_units: HashMap<String, ActiveRun>,
    pub total_active: usize,
}

#[derive(Clone, Default)]
pub struct RunTracker {
    active_runs: Arc<RwLock<HashMap<String, ActiveRun>>>, // unit -> run
}

impl RunTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `unit`; fails when another run already holds it
    #[instrument(skip(self), fields(unit = %unit, operation = %operation))]
    pub async fn try_start(&self, unit: &str, operation: &str) -> Result<(), VaultError> {
        let mut active = self.active_runs.write().await;

        if let Some(current) = active.get(unit) {
            let minutes = Utc::now()
                .signed_duration_since(current.started_at)
                .num_minutes();
            return Err(PreconditionError::UnitBusy {
                unit: unit.to_string(),
                current_operation: format!("{} (started {}m ago)", current.operation, minutes),
            }
            .into());
        }

        active.insert(
            unit.to_string(),
            ActiveRun {
                unit: unit.to_string(),
                operation: operation.to_string(),
                started_at: Utc::now(),
            },
        );
        info!("Started '{}' on {}", operation, unit);
        Ok(())
    }

    #[instrument(skip(self), fields(unit = %unit))]
    pub async fn finish(&self, unit: &str) {
        let mut active = self.active_runs.write().await;
        if let Some(run) = active.remove(unit) {
            let duration = Utc::now().signed_duration_since(run.started_at);
            info!(
                "Finished '{}' on {} (took {}s)",
                run.operation,
                unit,
                duration.num_seconds()
            );
        }
    }

    pub async fn is_busy(&self, unit: &str) -> bool {
        self.active_runs.read().await.contains_key(unit)
    }

    pub async fn status(&self) -> RunStatus {
        let active = self.active_runs.read().await;
        RunStatus {
            busy_units: active.clone(),
            total_active: active.len(),
        }
    }
}
