//! Restore sessions reconstructed from snapshot metadata
//!
//! Nothing here is stored: a session is whatever set of records shares a
//! `(unit, backup_id)` pair in the repository right now.

use chrono::{DateTime, Utc};
use executor::types::{BackupFormat, BackupScope, SnapshotRecord, SnapshotType};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

/// How a volume record has to be restored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VolumeRestoreMethod {
    /// tar stream dumped from the snapshot into a helper container
    Legacy,
    /// Files restored from a snapshot of the volume mountpoint
    Modern,
}

/// No marker means the record predates format tags; `stream` is what the
/// streamed fallback writes today. Anything else is a direct-path snapshot.
pub fn detect_format(record: &SnapshotRecord) -> VolumeRestoreMethod {
    match record.tags.backup_format.as_deref() {
        None => VolumeRestoreMethod::Legacy,
        Some(marker) if marker == BackupFormat::Stream.as_tag() => VolumeRestoreMethod::Legacy,
        Some(_) => VolumeRestoreMethod::Modern,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RestoreSession {
    pub unit: String,
    pub backup_id: String,
    pub timestamp: DateTime<Utc>,
    pub hostname: String,
    pub scope: Option<BackupScope>,
    pub recipe: Option<SnapshotRecord>,
    pub docker_config: Option<SnapshotRecord>,
    pub networks: Option<SnapshotRecord>,
    /// Sorted by volume name
    pub volumes: Vec<SnapshotRecord>,
}

impl RestoreSession {
    fn new(first: &SnapshotRecord) -> Self {
        Self {
            unit: first.tags.unit.clone(),
            backup_id: first.tags.backup_id.clone(),
            timestamp: first.tags.timestamp,
            hostname: first.hostname.clone(),
            scope: first.tags.backup_scope,
            recipe: None,
            docker_config: None,
            networks: None,
            volumes: Vec::new(),
        }
    }

    fn add(&mut self, record: SnapshotRecord) {
        self.timestamp = self.timestamp.min(record.tags.timestamp);
        if self.scope.is_none() {
            self.scope = record.tags.backup_scope;
        }
        let slot = match record.tags.kind {
            SnapshotType::Volume => {
                self.volumes.push(record);
                return;
            }
            SnapshotType::Recipe => &mut self.recipe,
            SnapshotType::DockerConfig => &mut self.docker_config,
            SnapshotType::Networks => &mut self.networks,
        };
        // A retried upload can leave two records of one kind; keep the newest
        let newer = slot
            .as_ref()
            .map_or(true, |existing| record.time > existing.time);
        if newer {
            *slot = Some(record);
        }
    }

    pub fn record_count(&self) -> usize {
        self.volumes.len()
            + [&self.recipe, &self.docker_config, &self.networks]
                .iter()
                .filter(|r| r.is_some())
                .count()
    }

    pub fn volume_names(&self) -> Vec<&str> {
        self.volumes
            .iter()
            .filter_map(|r| r.tags.volume.as_deref())
            .collect()
    }

    pub fn find_volume(&self, name: &str) -> Option<&SnapshotRecord> {
        self.volumes
            .iter()
            .find(|r| r.tags.volume.as_deref() == Some(name))
    }

    /// True when volume records use both restore methods
    pub fn is_mixed_format(&self) -> bool {
        let methods: BTreeSet<_> = self
            .volumes
            .iter()
            .map(|r| detect_format(r) == VolumeRestoreMethod::Modern)
            .collect();
        methods.len() > 1
    }
}

/// Group records by `(unit, backup_id)`, newest session first
pub fn group_sessions(records: Vec<SnapshotRecord>) -> Vec<RestoreSession> {
    let mut sessions: BTreeMap<(String, String), RestoreSession> = BTreeMap::new();
    for record in records {
        let key = (record.tags.unit.clone(), record.tags.backup_id.clone());
        sessions
            .entry(key)
            .or_insert_with(|| RestoreSession::new(&record))
            .add(record);
    }

    let mut sessions: Vec<RestoreSession> = sessions.into_values().collect();
    for session in &mut sessions {
        session
            .volumes
            .sort_by(|a, b| a.tags.volume.cmp(&b.tags.volume));
    }
    sessions.sort_by(|a, b| {
        b.timestamp
            .cmp(&a.timestamp)
            .then_with(|| a.unit.cmp(&b.unit))
    });
    sessions
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostSummary {
    pub hostname: String,
    pub last_backup: DateTime<Utc>,
    pub unit_count: usize,
    pub snapshot_count: usize,
}

/// Per-host overview for cross-host recovery, by engine-reported hostname
pub fn host_summaries(records: &[SnapshotRecord]) -> Vec<HostSummary> {
    let mut hosts: BTreeMap<&str, (DateTime<Utc>, BTreeSet<&str>, usize)> = BTreeMap::new();
    for record in records {
        let entry = hosts
            .entry(record.hostname.as_str())
            .or_insert_with(|| (record.time, BTreeSet::new(), 0));
        entry.0 = entry.0.max(record.time);
        entry.1.insert(record.tags.unit.as_str());
        entry.2 += 1;
    }

    hosts
        .into_iter()
        .map(|(hostname, (last_backup, units, snapshot_count))| HostSummary {
            hostname: hostname.to_string(),
            last_backup,
            unit_count: units.len(),
            snapshot_count,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use executor::types::SnapshotTags;

    fn record(unit: &str, backup_id: &str, kind: SnapshotType, volume: Option<(&str, Option<&str>)>, host: &str, hour: u32) -> SnapshotRecord {
        let ts = Utc.with_ymd_and_hms(2026, 3, 1, hour, 0, 0).unwrap();
        let mut tags = SnapshotTags::new(kind, unit, backup_id, ts);
        if let Some((name, format)) = volume {
            tags.volume = Some(name.to_string());
            tags.backup_format = format.map(str::to_string);
        }
        SnapshotRecord {
            id: format!("{}-{}-{}", unit, backup_id, kind),
            short_id: "short".to_string(),
            time: ts,
            hostname: host.to_string(),
            paths: vec![],
            tags,
        }
    }

    #[test]
    fn records_group_by_unit_and_backup_id() {
        let records = vec![
            record("a", "1", SnapshotType::Recipe, None, "web01", 1),
            record("a", "1", SnapshotType::Volume, Some(("x", Some("direct"))), "web01", 1),
            record("a", "2", SnapshotType::Recipe, None, "web01", 2),
        ];

        let sessions = group_sessions(records);

        assert_eq!(sessions.len(), 2);
        // Newest first
        assert_eq!(sessions[0].backup_id, "2");
        assert_eq!(sessions[0].record_count(), 1);
        assert_eq!(sessions[1].backup_id, "1");
        assert_eq!(sessions[1].record_count(), 2);
        assert_eq!(sessions[1].volume_names(), vec!["x"]);
    }

    #[test]
    fn format_marker_selects_restore_method() {
        let legacy = record("a", "1", SnapshotType::Volume, Some(("old", None)), "h", 1);
        let streamed = record("a", "1", SnapshotType::Volume, Some(("nfs", Some("stream"))), "h", 1);
        let modern = record("a", "1", SnapshotType::Volume, Some(("new", Some("direct"))), "h", 1);

        assert_eq!(detect_format(&legacy), VolumeRestoreMethod::Legacy);
        assert_eq!(detect_format(&streamed), VolumeRestoreMethod::Legacy);
        assert_eq!(detect_format(&modern), VolumeRestoreMethod::Modern);

        let sessions = group_sessions(vec![legacy, modern]);
        assert_eq!(sessions.len(), 1);
        assert!(sessions[0].is_mixed_format());
    }

    #[test]
    fn host_summary_counts_units_and_snapshots() {
        let records = vec![
            record("a", "1", SnapshotType::Recipe, None, "web01", 1),
            record("b", "2", SnapshotType::Recipe, None, "web01", 3),
            record("b", "2", SnapshotType::Volume, Some(("v", Some("direct"))), "web01", 3),
            record("c", "3", SnapshotType::Recipe, None, "db01", 2),
        ];

        let summaries = host_summaries(&records);

        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].hostname, "db01");
        assert_eq!(summaries[0].snapshot_count, 1);
        assert_eq!(summaries[1].hostname, "web01");
        assert_eq!(summaries[1].unit_count, 2);
        assert_eq!(summaries[1].snapshot_count, 3);
        assert_eq!(
            summaries[1].last_backup,
            Utc.with_ymd_and_hms(2026, 3, 1, 3, 0, 0).unwrap()
        );
    }
}
