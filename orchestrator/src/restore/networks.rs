//! Network recreation with name-conflict resolution

use anyhow::Result;
use async_trait::async_trait;
use executor::services::docker::{ContainerEngine, BUILTIN_NETWORKS};
use executor::types::NetworkSpec;
use serde::{Deserialize, Serialize};
use std::io::{BufRead, Write};
use tracing::{info, warn};

/// What to do when a network from the backup already exists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictPolicy {
    Skip,
    Rename,
    Overwrite,
    #[default]
    Ask,
}

impl ConflictPolicy {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "skip" => Some(ConflictPolicy::Skip),
            "rename" => Some(ConflictPolicy::Rename),
            "overwrite" => Some(ConflictPolicy::Overwrite),
            "ask" => Some(ConflictPolicy::Ask),
            _ => None,
        }
    }

    /// `Ask` cannot prompt anyone in non-interactive mode and becomes `Skip`
    pub fn effective(self, non_interactive: bool) -> Self {
        match self {
            ConflictPolicy::Ask if non_interactive => ConflictPolicy::Skip,
            other => other,
        }
    }
}

/// A concrete decision for one conflicting network
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictResolution {
    Skip,
    Rename,
    Overwrite,
}

#[async_trait]
pub trait ConflictPrompt: Send + Sync {
    async fn resolve(&self, network: &str) -> ConflictResolution;
}

/// Asks on the terminal; anything unrecognised means skip
pub struct StdinPrompt;

#[async_trait]
impl ConflictPrompt for StdinPrompt {
    async fn resolve(&self, network: &str) -> ConflictResolution {
        let question = format!(
            "Network '{}' already exists. [s]kip, [r]ename, [o]verwrite? ",
            network
        );
        let answer = tokio::task::spawn_blocking(move || {
            let mut stdout = std::io::stdout();
            let _ = stdout.write_all(question.as_bytes());
            let _ = stdout.flush();
            let mut line = String::new();
            let _ = std::io::stdin().lock().read_line(&mut line);
            line
        })
        .await
        .unwrap_or_default();

        match answer.trim().to_ascii_lowercase().as_str() {
            "r" | "rename" => ConflictResolution::Rename,
            "o" | "overwrite" => ConflictResolution::Overwrite,
            _ => ConflictResolution::Skip,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NetworkRestoreReport {
    pub created: Vec<String>,
    pub skipped: Vec<String>,
    /// (original name, new name)
    pub renamed: Vec<(String, String)>,
    pub overwritten: Vec<String>,
    pub failures: Vec<String>,
}

/// Recreate `specs`, resolving existing names according to `policy`
pub async fn restore_networks(
    engine: &dyn ContainerEngine,
    specs: &[NetworkSpec],
    policy: ConflictPolicy,
    prompt: &dyn ConflictPrompt,
) -> Result<NetworkRestoreReport> {
    let mut report = NetworkRestoreReport::default();

    for spec in specs {
        if BUILTIN_NETWORKS.contains(&spec.name.as_str()) {
            continue;
        }

        if !engine.network_exists(&spec.name).await? {
            match engine.create_network(spec).await {
                Ok(()) => report.created.push(spec.name.clone()),
                Err(e) => report
                    .failures
                    .push(format!("create {}: {}", spec.name, e)),
            }
            continue;
        }

        let resolution = match policy {
            ConflictPolicy::Skip => ConflictResolution::Skip,
            ConflictPolicy::Rename => ConflictResolution::Rename,
            ConflictPolicy::Overwrite => ConflictResolution::Overwrite,
            ConflictPolicy::Ask => prompt.resolve(&spec.name).await,
        };

        match resolution {
            ConflictResolution::Skip => {
                info!(network = %spec.name, "Network exists, keeping current definition");
                report.skipped.push(spec.name.clone());
            }
            ConflictResolution::Rename => {
                let new_name = free_name(engine, &spec.name).await?;
                // The original subnet is taken by the existing network
                let renamed = NetworkSpec {
                    name: new_name.clone(),
                    subnets: Vec::new(),
                    gateways: Vec::new(),
                    ..spec.clone()
                };
                match engine.create_network(&renamed).await {
                    Ok(()) => report.renamed.push((spec.name.clone(), new_name)),
                    Err(e) => report
                        .failures
                        .push(format!("create {}: {}", new_name, e)),
                }
            }
            ConflictResolution::Overwrite => {
                warn!(network = %spec.name, "Replacing existing network");
                let result = async {
                    engine.remove_network(&spec.name).await?;
                    engine.create_network(spec).await
                }
                .await;
                match result {
                    Ok(()) => report.overwritten.push(spec.name.clone()),
                    Err(e) => report
                        .failures
                        .push(format!("overwrite {}: {}", spec.name, e)),
                }
            }
        }
    }

    Ok(report)
}

async fn free_name(engine: &dyn ContainerEngine, base: &str) -> Result<String> {
    let mut candidate = format!("{}-restored", base);
    let mut attempt = 2;
    while engine.network_exists(&candidate).await? {
        candidate = format!("{}-restored-{}", base, attempt);
        attempt += 1;
    }
    Ok(candidate)
}
