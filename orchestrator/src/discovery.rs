//! Groups containers, volumes and networks into backup units
//!
//! Containers carrying a compose project label form one stack unit per
//! project; every other container is a standalone unit of its own. Units are
//! rebuilt on every pass and never persisted.

use anyhow::Result;
use executor::services::docker::{ContainerEngine, BUILTIN_NETWORKS};
use executor::types::{
    BackupUnit, ContainerInfo, ContainerRef, UnitKind, VolumeInfo, VolumeRef,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use tracing::{debug, info, instrument};

use crate::constants::labels;

/// List everything the engine knows about and group it into units
#[instrument(skip(engine))]
pub async fn discover(engine: &dyn ContainerEngine, exclude_units: &[String]) -> Result<Vec<BackupUnit>> {
    let containers = engine.list_containers().await?;
    let volumes = engine.list_volumes().await?;
    let units = group_units(&containers, &volumes, exclude_units);
    info!(
        "Discovered {} units from {} containers and {} volumes",
        units.len(),
        containers.len(),
        volumes.len()
    );
    Ok(units)
}

#[derive(Default)]
struct UnitBuilder {
    kind: Option<UnitKind>,
    containers: Vec<ContainerRef>,
    volumes: BTreeSet<String>,
    networks: BTreeSet<String>,
    compose_files: BTreeSet<PathBuf>,
    working_dir: Option<PathBuf>,
}

/// Pure grouping step of `discover`
pub fn group_units(
    containers: &[ContainerInfo],
    volumes: &[VolumeInfo],
    exclude_units: &[String],
) -> Vec<BackupUnit> {
    let volume_index: HashMap<&str, &VolumeInfo> =
        volumes.iter().map(|v| (v.name.as_str(), v)).collect();
    let mut builders: BTreeMap<String, UnitBuilder> = BTreeMap::new();

    for container in containers {
        if container.label(labels::EXCLUDE) == Some("true") {
            debug!(container = %container.name, "Skipping excluded container");
            continue;
        }

        let (unit_name, kind) = match container.label(labels::COMPOSE_PROJECT) {
            Some(project) if !project.is_empty() => (project.to_string(), UnitKind::Stack),
            _ => (container.name.clone(), UnitKind::Standalone),
        };
        let builder = builders.entry(unit_name).or_default();
        builder.kind = Some(kind);
        builder.containers.push(ContainerRef {
            id: container.id.clone(),
            name: container.name.clone(),
            has_healthcheck: container.has_healthcheck,
            running: container.running,
        });
        builder
            .volumes
            .extend(container.volume_names().map(str::to_string));
        builder.networks.extend(
            container
                .networks
                .iter()
                .filter(|n| !BUILTIN_NETWORKS.contains(&n.as_str()))
                .cloned(),
        );

        if let Some(files) = container.label(labels::COMPOSE_CONFIG_FILES) {
            builder.compose_files.extend(
                files
                    .split(',')
                    .map(str::trim)
                    .filter(|f| !f.is_empty())
                    .map(PathBuf::from),
            );
        }
        if builder.working_dir.is_none() {
            builder.working_dir = container.label(labels::COMPOSE_WORKING_DIR).map(PathBuf::from);
        }
    }

    // Compose volumes with no container attached right now still belong to their stack
    for volume in volumes {
        if let Some(project) = volume.labels.get(labels::COMPOSE_PROJECT) {
            if let Some(builder) = builders.get_mut(project) {
                builder.volumes.insert(volume.name.clone());
            }
        }
    }

    builders
        .into_iter()
        .filter(|(name, _)| {
            let excluded = exclude_units.iter().any(|e| e == name);
            if excluded {
                debug!(unit = %name, "Skipping excluded unit");
            }
            !excluded
        })
        .map(|(name, mut builder)| {
            builder.containers.sort_by(|a, b| a.name.cmp(&b.name));
            let volumes = builder
                .volumes
                .into_iter()
                .map(|volume| match volume_index.get(volume.as_str()) {
                    Some(info) => VolumeRef {
                        name: volume,
                        driver: info.driver.clone(),
                        mountpoint: info.mountpoint.clone(),
                    },
                    None => VolumeRef {
                        name: volume,
                        driver: "local".to_string(),
                        mountpoint: None,
                    },
                })
                .collect();

            BackupUnit {
                name,
                kind: builder.kind.unwrap_or(UnitKind::Standalone),
                containers: builder.containers,
                volumes,
                networks: builder.networks.into_iter().collect(),
                compose_files: builder.compose_files.into_iter().collect(),
                working_dir: builder.working_dir,
            }
        })
        .collect()
}
