use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;

/// Timestamp layout used inside snapshot tags (no commas, restic-safe)
pub const TAG_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

// === CONTAINER ENGINE STRUCTURES ===

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountInfo {
    /// "volume", "bind" or "tmpfs"
    pub kind: String,
    pub name: Option<String>,
    pub source: String,
    pub destination: String,
    pub driver: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub image: String,
    pub running: bool,
    pub labels: HashMap<String, String>,
    pub mounts: Vec<MountInfo>,
    pub networks: Vec<String>,
    pub has_healthcheck: bool,
}

impl ContainerInfo {
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    pub fn volume_names(&self) -> impl Iterator<Item = &str> {
        self.mounts
            .iter()
            .filter(|m| m.kind == "volume")
            .filter_map(|m| m.name.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeInfo {
    pub name: String,
    pub driver: String,
    pub mountpoint: Option<PathBuf>,
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Starting,
    /// Container declares no health probe
    NoProbe,
}

impl HealthStatus {
    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            "healthy" => HealthStatus::Healthy,
            "unhealthy" => HealthStatus::Unhealthy,
            "starting" => HealthStatus::Starting,
            _ => HealthStatus::NoProbe,
        }
    }
}

/// Definition needed to recreate a user-defined network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSpec {
    pub name: String,
    pub driver: String,
    pub subnets: Vec<String>,
    pub gateways: Vec<String>,
    pub internal: bool,
    pub attachable: bool,
    pub labels: BTreeMap<String, String>,
}

impl NetworkSpec {
    /// Build from one element of `docker network inspect` output
    pub fn from_inspect(value: &serde_json::Value) -> Option<Self> {
        let name = value.get("Name")?.as_str()?.to_string();
        let driver = value
            .get("Driver")
            .and_then(|d| d.as_str())
            .unwrap_or("bridge")
            .to_string();

        let ipam = value
            .get("IPAM")
            .and_then(|i| i.get("Config"))
            .and_then(|c| c.as_array())
            .cloned()
            .unwrap_or_default();
        let subnets = ipam
            .iter()
            .filter_map(|c| c.get("Subnet").and_then(|s| s.as_str()))
            .map(str::to_string)
            .collect();
        let gateways = ipam
            .iter()
            .filter_map(|c| c.get("Gateway").and_then(|s| s.as_str()))
            .map(str::to_string)
            .collect();

        let labels = value
            .get("Labels")
            .and_then(|l| l.as_object())
            .map(|map| {
                map.iter()
                    .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                    .collect()
            })
            .unwrap_or_default();

        Some(Self {
            name,
            driver,
            subnets,
            gateways,
            internal: value.get("Internal").and_then(|v| v.as_bool()).unwrap_or(false),
            attachable: value.get("Attachable").and_then(|v| v.as_bool()).unwrap_or(false),
            labels,
        })
    }
}

// === BACKUP UNITS ===

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitKind {
    Stack,
    Standalone,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerRef {
    pub id: String,
    pub name: String,
    pub has_healthcheck: bool,
    /// Only containers running at discovery are stopped and restarted
    #[serde(default)]
    pub running: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeRef {
    pub name: String,
    pub driver: String,
    pub mountpoint: Option<PathBuf>,
}

/// Containers, volumes and networks backed up and restored together
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupUnit {
    pub name: String,
    pub kind: UnitKind,
    pub containers: Vec<ContainerRef>,
    pub volumes: Vec<VolumeRef>,
    pub networks: Vec<String>,
    /// Compose files for stacks, taken from the compose labels
    pub compose_files: Vec<PathBuf>,
    pub working_dir: Option<PathBuf>,
}

// === SNAPSHOT TAGS ===

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotType {
    Recipe,
    Volume,
    Networks,
    DockerConfig,
}

impl SnapshotType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotType::Recipe => "recipe",
            SnapshotType::Volume => "volume",
            SnapshotType::Networks => "networks",
            SnapshotType::DockerConfig => "docker_config",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "recipe" => Some(SnapshotType::Recipe),
            "volume" => Some(SnapshotType::Volume),
            "networks" => Some(SnapshotType::Networks),
            "docker_config" => Some(SnapshotType::DockerConfig),
            _ => None,
        }
    }
}

impl fmt::Display for SnapshotType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a volume's data was handed to the snapshot engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupFormat {
    /// Snapshot of the volume's host mountpoint
    Direct,
    /// tar stream piped from a helper container
    Stream,
}

impl BackupFormat {
    pub fn as_tag(&self) -> &'static str {
        match self {
            BackupFormat::Direct => "direct",
            BackupFormat::Stream => "stream",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupScope {
    /// Recipes, networks and volumes, containers stopped
    #[default]
    Full,
    /// Recipes and networks only, containers keep running
    Config,
}

impl BackupScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupScope::Full => "full",
            BackupScope::Config => "config",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "full" => Some(BackupScope::Full),
            "config" => Some(BackupScope::Config),
            _ => None,
        }
    }
}

/// Tags attached to every record the snapshot engine stores
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotTags {
    pub kind: SnapshotType,
    pub unit: String,
    pub backup_id: String,
    pub timestamp: DateTime<Utc>,
    pub volume: Option<String>,
    pub backup_format: Option<String>,
    pub backup_scope: Option<BackupScope>,
    /// Tags present on the record that are not part of the tag set
    #[serde(default)]
    pub extra: Vec<String>,
}

impl SnapshotTags {
    pub fn new(
        kind: SnapshotType,
        unit: &str,
        backup_id: &str,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            kind,
            unit: unit.to_string(),
            backup_id: backup_id.to_string(),
            timestamp,
            volume: None,
            backup_format: None,
            backup_scope: None,
            extra: Vec::new(),
        }
    }

    pub fn with_volume(mut self, volume: &str, format: BackupFormat) -> Self {
        self.volume = Some(volume.to_string());
        self.backup_format = Some(format.as_tag().to_string());
        self
    }

    pub fn with_scope(mut self, scope: BackupScope) -> Self {
        self.backup_scope = Some(scope);
        self
    }

    /// Encode as `key=value` tag strings
    pub fn to_tag_list(&self) -> Vec<String> {
        let mut tags = vec![
            format!("type={}", self.kind.as_str()),
            format!("unit={}", self.unit),
            format!("backup_id={}", self.backup_id),
            format!("timestamp={}", self.timestamp.format(TAG_TIMESTAMP_FORMAT)),
        ];
        if let Some(volume) = &self.volume {
            tags.push(format!("volume={}", volume));
        }
        if let Some(format) = &self.backup_format {
            tags.push(format!("backup_format={}", format));
        }
        if let Some(scope) = &self.backup_scope {
            tags.push(format!("backup_scope={}", scope.as_str()));
        }
        tags
    }

    /// Decode a tag list; `None` when a required key is missing
    pub fn from_tag_list(tags: &[String]) -> Option<Self> {
        let mut kind = None;
        let mut unit = None;
        let mut backup_id = None;
        let mut timestamp = None;
        let mut volume = None;
        let mut backup_format = None;
        let mut backup_scope = None;
        let mut extra = Vec::new();

        for tag in tags {
            match tag.split_once('=') {
                Some(("type", v)) => kind = SnapshotType::parse(v),
                Some(("unit", v)) => unit = Some(v.to_string()),
                Some(("backup_id", v)) => backup_id = Some(v.to_string()),
                Some(("timestamp", v)) => timestamp = parse_tag_timestamp(v),
                Some(("volume", v)) => volume = Some(v.to_string()),
                Some(("backup_format", v)) => backup_format = Some(v.to_string()),
                Some(("backup_scope", v)) => backup_scope = BackupScope::parse(v),
                _ => extra.push(tag.clone()),
            }
        }

        Some(Self {
            kind: kind?,
            unit: unit?,
            backup_id: backup_id?,
            timestamp: timestamp?,
            volume,
            backup_format,
            backup_scope,
            extra,
        })
    }
}

pub fn parse_tag_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(raw, TAG_TIMESTAMP_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
        .or_else(|| {
            DateTime::parse_from_rfc3339(raw)
                .ok()
                .map(|dt| dt.with_timezone(&Utc))
        })
}

/// One snapshot as reported by the snapshot engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub id: String,
    pub short_id: String,
    pub time: DateTime<Utc>,
    pub hostname: String,
    pub paths: Vec<String>,
    pub tags: SnapshotTags,
}

/// Selects snapshots whose tags contain every listed tag
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotFilter {
    pub tags: Vec<String>,
    pub host: Option<String>,
}

impl SnapshotFilter {
    pub fn for_unit(unit: &str) -> Self {
        Self {
            tags: vec![format!("unit={}", unit)],
            host: None,
        }
    }

    pub fn for_tags(tags: &SnapshotTags) -> Self {
        Self {
            tags: tags.to_tag_list(),
            host: None,
        }
    }

    pub fn with_host(mut self, host: &str) -> Self {
        self.host = Some(host.to_string());
        self
    }

    pub fn matches(&self, record: &SnapshotRecord) -> bool {
        if let Some(host) = &self.host {
            if &record.hostname != host {
                return false;
            }
        }
        let present = record.tags.to_tag_list();
        self.tags
            .iter()
            .all(|wanted| present.contains(wanted) || record.tags.extra.contains(wanted))
    }
}

// === RETENTION ===

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub keep_last: Option<u32>,
    pub keep_hourly: Option<u32>,
    pub keep_daily: Option<u32>,
    pub keep_weekly: Option<u32>,
    pub keep_monthly: Option<u32>,
    pub keep_yearly: Option<u32>,
    #[serde(default)]
    pub prune: bool,
}

impl RetentionPolicy {
    pub fn is_empty(&self) -> bool {
        self.to_args().is_empty()
    }

    /// restic `forget` flags for this policy
    pub fn to_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        let pairs = [
            ("--keep-last", self.keep_last),
            ("--keep-hourly", self.keep_hourly),
            ("--keep-daily", self.keep_daily),
            ("--keep-weekly", self.keep_weekly),
            ("--keep-monthly", self.keep_monthly),
            ("--keep-yearly", self.keep_yearly),
        ];
        for (flag, value) in pairs {
            if let Some(count) = value {
                args.push(flag.to_string());
                args.push(count.to_string());
            }
        }
        args
    }
}

// === HOOKS ===

/// Shell commands run around backup and restore of one unit
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookSet {
    pub pre_backup: Option<String>,
    pub post_backup: Option<String>,
    pub pre_restore: Option<String>,
    pub post_restore: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_tags() -> SnapshotTags {
        let ts = Utc.with_ymd_and_hms(2026, 3, 1, 2, 30, 0).unwrap();
        SnapshotTags::new(SnapshotType::Volume, "demo", "20260301T023000-ab12cd34", ts)
            .with_volume("demo_db", BackupFormat::Direct)
            .with_scope(BackupScope::Full)
    }

    #[test]
    fn tag_list_decodes_back_to_the_same_set() {
        let tags = sample_tags();
        let decoded = SnapshotTags::from_tag_list(&tags.to_tag_list()).unwrap();
        assert_eq!(decoded, tags);
    }

    #[test]
    fn foreign_tags_are_kept_as_extra() {
        let mut list = sample_tags().to_tag_list();
        list.push("manual".to_string());
        let decoded = SnapshotTags::from_tag_list(&list).unwrap();
        assert_eq!(decoded.extra, vec!["manual".to_string()]);
    }

    #[test]
    fn records_without_unit_are_not_ours() {
        let list = vec!["type=recipe".to_string(), "backup_id=x".to_string()];
        assert!(SnapshotTags::from_tag_list(&list).is_none());
    }

    #[test]
    fn retention_policy_renders_only_set_fields() {
        let policy = RetentionPolicy {
            keep_daily: Some(7),
            keep_weekly: Some(4),
            ..Default::default()
        };
        assert_eq!(
            policy.to_args(),
            vec!["--keep-daily", "7", "--keep-weekly", "4"]
        );
        assert!(RetentionPolicy::default().is_empty());
    }

    #[test]
    fn network_spec_reads_ipam_config() {
        let value = serde_json::json!({
            "Name": "demo_backend",
            "Driver": "bridge",
            "Internal": true,
            "Attachable": false,
            "IPAM": { "Config": [ { "Subnet": "172.30.0.0/16", "Gateway": "172.30.0.1" } ] },
            "Labels": { "com.docker.compose.project": "demo" }
        });
        let spec = NetworkSpec::from_inspect(&value).unwrap();
        assert_eq!(spec.name, "demo_backend");
        assert_eq!(spec.subnets, vec!["172.30.0.0/16"]);
        assert_eq!(spec.gateways, vec!["172.30.0.1"]);
        assert!(spec.internal);
        assert_eq!(spec.labels.get("com.docker.compose.project").unwrap(), "demo");
    }
}
