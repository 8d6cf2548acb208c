//! Backup pipeline tests against the scripted engine and in-memory snapshots
//!
//! Covers stop/start ordering, shared backup ids, stable staging paths,
//! format selection and the failure paths that must still restart services.

mod common;

use common::fixtures::mock_engine::demo_unit;
use common::fixtures::*;
use executor::exit_safety::ExitSafety;
use executor::types::{BackupFormat, BackupScope, SnapshotFilter, SnapshotTags, SnapshotType};
use orchestrator::config::{Config, UnitConfig};
use orchestrator::{BackupPipeline, BackupStage, PipelineContext};
use std::path::PathBuf;
use std::sync::Arc;

struct Harness {
    dirs: TestDirs,
    engine: Arc<MockEngine>,
    snapshots: Arc<MemorySnapshots>,
    ctx: PipelineContext,
    volume_dir: PathBuf,
}

fn harness(engine: MockEngine, configure: impl FnOnce(&mut Config)) -> Harness {
    let dirs = TestDirs::new();
    let volume_dir = dirs.base.join("volumes").join("demo_data");
    std::fs::create_dir_all(&volume_dir).unwrap();
    std::fs::write(volume_dir.join("db.sqlite"), "rows").unwrap();

    let mut config = dirs.config();
    configure(&mut config);

    let coordinator = ExitSafety::new();
    let engine = Arc::new(engine);
    let snapshots = Arc::new(MemorySnapshots::new("web01"));
    let ctx = test_context(engine.clone(), snapshots.clone(), coordinator, config);
    Harness {
        dirs,
        engine,
        snapshots,
        ctx,
        volume_dir,
    }
}

fn demo_engine() -> MockEngine {
    MockEngine::new()
        .with_container("demo", "id-db", "demo-db-1", &["demo_data"], &["demo_default"])
        .with_container("demo", "id-web", "demo-web-1", &[], &["demo_default"])
        .with_network("demo_default")
}

#[tokio::test]
async fn test_full_backup_stops_snapshots_and_restarts_in_reverse() {
    let h = harness(demo_engine(), |_| {});
    let unit = demo_unit(Some(h.volume_dir.clone()));

    let report = BackupPipeline::new(h.ctx.clone())
        .run(&unit, BackupScope::Full)
        .await;

    assert!(report.success(), "errors: {:?}", report.errors);
    assert_eq!(report.stage, BackupStage::Done);
    assert_eq!(h.engine.stopped(), vec!["id-db", "id-web"]);
    assert_eq!(h.engine.started(), vec!["id-web", "id-db"]);
    assert_eq!(report.restarted, vec!["demo-web-1", "demo-db-1"]);

    let kinds: Vec<SnapshotType> = h.snapshots.records().iter().map(|r| r.tags.kind).collect();
    assert_eq!(
        kinds,
        vec![
            SnapshotType::Recipe,
            SnapshotType::DockerConfig,
            SnapshotType::Networks,
            SnapshotType::Volume
        ]
    );
}

#[tokio::test]
async fn test_every_snapshot_of_a_run_shares_one_backup_id() {
    let h = harness(demo_engine(), |_| {});
    let unit = demo_unit(Some(h.volume_dir.clone()));

    let report = BackupPipeline::new(h.ctx.clone())
        .run(&unit, BackupScope::Full)
        .await;

    let records = h.snapshots.records();
    assert_eq!(records.len(), 4);
    for record in &records {
        assert_eq!(record.tags.backup_id, report.backup_id);
        assert_eq!(record.tags.unit, "demo");
        assert_eq!(record.tags.backup_scope, Some(BackupScope::Full));
        assert_eq!(
            SnapshotTags::from_tag_list(&record.tags.to_tag_list()).as_ref(),
            Some(&record.tags)
        );
    }

    // Filtering on the run's base tags finds the whole session
    let base = SnapshotTags {
        kind: SnapshotType::Volume,
        volume: None,
        backup_format: None,
        ..records[0].tags.clone()
    };
    let mut filter = SnapshotFilter::for_tags(&base);
    filter.tags.retain(|t| !t.starts_with("type="));
    assert_eq!(records.iter().filter(|r| filter.matches(r)).count(), 4);
}

#[tokio::test]
async fn test_local_volume_with_mountpoint_is_snapshotted_directly() {
    let h = harness(demo_engine(), |_| {});
    let unit = demo_unit(Some(h.volume_dir.clone()));

    BackupPipeline::new(h.ctx.clone())
        .run(&unit, BackupScope::Full)
        .await;

    let volume = h
        .snapshots
        .records()
        .into_iter()
        .find(|r| r.tags.kind == SnapshotType::Volume)
        .expect("volume snapshot");
    assert_eq!(volume.tags.volume.as_deref(), Some("demo_data"));
    assert_eq!(volume.tags.backup_format.as_deref(), Some(BackupFormat::Direct.as_tag()));
    assert_eq!(volume.paths, vec![h.volume_dir.display().to_string()]);
}

#[tokio::test]
async fn test_volume_without_mountpoint_falls_back_to_stream() {
    let h = harness(demo_engine(), |_| {});
    let unit = demo_unit(None);

    let report = BackupPipeline::new(h.ctx.clone())
        .run(&unit, BackupScope::Full)
        .await;

    assert!(report.success(), "errors: {:?}", report.errors);
    let volume = h
        .snapshots
        .records()
        .into_iter()
        .find(|r| r.tags.kind == SnapshotType::Volume)
        .expect("volume snapshot");
    assert_eq!(volume.tags.backup_format.as_deref(), Some(BackupFormat::Stream.as_tag()));
    assert_eq!(volume.paths, vec!["/volumes/demo/demo_data.tar".to_string()]);
}

#[tokio::test]
async fn test_staging_paths_are_stable_across_runs() {
    let h = harness(demo_engine(), |_| {});
    let unit = demo_unit(Some(h.volume_dir.clone()));
    let pipeline = BackupPipeline::new(h.ctx.clone());

    let first = pipeline.run(&unit, BackupScope::Full).await;
    let second = pipeline.run(&unit, BackupScope::Full).await;
    assert_ne!(first.backup_id, second.backup_id);

    let paths_of = |backup_id: &str| -> Vec<(SnapshotType, Vec<String>)> {
        h.snapshots
            .records()
            .into_iter()
            .filter(|r| r.tags.backup_id == backup_id)
            .map(|r| (r.tags.kind, r.paths))
            .collect()
    };
    assert_eq!(paths_of(&first.backup_id), paths_of(&second.backup_id));

    let recipe_dir = h.dirs.staging.join("demo").join("recipe");
    assert!(paths_of(&first.backup_id)
        .iter()
        .any(|(kind, paths)| *kind == SnapshotType::Recipe
            && paths == &vec![recipe_dir.display().to_string()]));
}

#[tokio::test]
async fn test_docker_config_snapshot_is_redacted() {
    let h = harness(demo_engine(), |_| {});
    let unit = demo_unit(Some(h.volume_dir.clone()));

    BackupPipeline::new(h.ctx.clone())
        .run(&unit, BackupScope::Full)
        .await;

    let dir = h.dirs.staging.join("demo").join("docker_config");
    let mut combined = String::new();
    for entry in std::fs::read_dir(&dir).unwrap() {
        combined.push_str(&std::fs::read_to_string(entry.unwrap().path()).unwrap());
    }
    assert!(combined.contains("APP_MODE=prod"));
    assert!(!combined.contains("hunter2"), "secret leaked: {}", combined);
}

#[tokio::test]
async fn test_stop_failure_skips_snapshots_and_restarts_stopped_containers() {
    let h = harness(demo_engine().fail_stop_of("id-web"), |_| {});
    let unit = demo_unit(Some(h.volume_dir.clone()));

    let report = BackupPipeline::new(h.ctx.clone())
        .run(&unit, BackupScope::Full)
        .await;

    assert!(!report.success());
    assert!(report.errors.iter().any(|e| e.contains("stop demo-web-1")));
    assert!(h.snapshots.records().is_empty());
    // The failed stop was registered first, so both come back up
    assert_eq!(h.engine.started(), vec!["id-web", "id-db"]);
    assert!(h.snapshots.retention_paths().is_empty(), "retention must not run after errors");
}

#[tokio::test]
async fn test_config_scope_leaves_containers_running() {
    let h = harness(demo_engine(), |_| {});
    let unit = demo_unit(Some(h.volume_dir.clone()));

    let report = BackupPipeline::new(h.ctx.clone())
        .run(&unit, BackupScope::Config)
        .await;

    assert!(report.success(), "errors: {:?}", report.errors);
    assert!(h.engine.stopped().is_empty());
    assert!(h.engine.started().is_empty());
    let records = h.snapshots.records();
    assert!(records.iter().all(|r| r.tags.kind != SnapshotType::Volume));
    assert!(records
        .iter()
        .all(|r| r.tags.backup_scope == Some(BackupScope::Config)));
}

#[tokio::test]
async fn test_stopped_containers_are_not_touched() {
    let h = harness(demo_engine(), |_| {});
    let mut unit = demo_unit(Some(h.volume_dir.clone()));
    unit.containers[1].running = false;

    let report = BackupPipeline::new(h.ctx.clone())
        .run(&unit, BackupScope::Full)
        .await;

    assert!(report.success(), "errors: {:?}", report.errors);
    assert_eq!(h.engine.stopped(), vec!["id-db"]);
    assert_eq!(h.engine.started(), vec!["id-db"]);
}

#[tokio::test]
async fn test_failing_pre_hook_aborts_before_any_stop() {
    let h = harness(demo_engine(), |config| {
        config.units.insert(
            "demo".to_string(),
            UnitConfig {
                hooks: executor::types::HookSet {
                    pre_backup: Some("exit 3".to_string()),
                    ..Default::default()
                },
                ..Default::default()
            },
        );
    });
    let unit = demo_unit(Some(h.volume_dir.clone()));

    let report = BackupPipeline::new(h.ctx.clone())
        .run(&unit, BackupScope::Full)
        .await;

    assert!(matches!(report.stage, BackupStage::Aborted(_)));
    assert!(h.engine.events().is_empty());
    assert!(h.snapshots.records().is_empty());
}

#[tokio::test]
async fn test_skipped_volumes_are_not_snapshotted() {
    let h = harness(demo_engine(), |config| {
        config.units.insert(
            "demo".to_string(),
            UnitConfig {
                skip_volumes: vec!["demo_data".to_string()],
                ..Default::default()
            },
        );
    });
    let unit = demo_unit(Some(h.volume_dir.clone()));

    let report = BackupPipeline::new(h.ctx.clone())
        .run(&unit, BackupScope::Full)
        .await;

    assert!(report.success(), "errors: {:?}", report.errors);
    assert!(report.volumes.is_empty());
    assert!(h
        .snapshots
        .records()
        .iter()
        .all(|r| r.tags.kind != SnapshotType::Volume));
}

#[tokio::test]
async fn test_retention_runs_per_stable_path_after_success() {
    let h = harness(demo_engine(), |_| {});
    let unit = demo_unit(Some(h.volume_dir.clone()));

    BackupPipeline::new(h.ctx.clone())
        .run(&unit, BackupScope::Full)
        .await;

    let paths = h.snapshots.retention_paths();
    let unit_dir = h.dirs.staging.join("demo");
    assert!(paths.contains(&unit_dir.join("recipe")));
    assert!(paths.contains(&unit_dir.join("docker_config")));
    assert!(paths.contains(&unit_dir.join("networks")));
    assert!(paths.contains(&h.volume_dir));
    assert!(paths.contains(&PathBuf::from("/volumes/demo/demo_data.tar")));
}

#[tokio::test]
async fn test_dr_bundle_records_the_latest_backup() {
    let dirs_bundle = tempfile::TempDir::new().unwrap();
    let bundle = dirs_bundle.path().join("dr.json");
    let bundle_for_config = bundle.clone();
    let h = harness(demo_engine(), move |config| {
        config.dr_bundle.enabled = true;
        config.dr_bundle.path = Some(bundle_for_config);
    });
    let unit = demo_unit(Some(h.volume_dir.clone()));

    let report = BackupPipeline::new(h.ctx.clone())
        .run(&unit, BackupScope::Full)
        .await;

    assert!(report.success(), "errors: {:?} warnings: {:?}", report.errors, report.warnings);
    let content = std::fs::read_to_string(&bundle).unwrap();
    assert!(content.contains(&report.backup_id));
    assert!(content.contains("demo_data"));
}
