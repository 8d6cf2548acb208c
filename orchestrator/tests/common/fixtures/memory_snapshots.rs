//! In-memory snapshot engine
//!
//! Directory snapshots copy the file tree into memory so a later restore can
//! write it back. Volume snapshots and restores can be told to block on a
//! real `sleep` spawned through the command wrapper, which gives interrupt
//! tests a tracked subprocess to kill.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use executor::services::restic::SnapshotEngine;
use executor::types::{RetentionPolicy, SnapshotFilter, SnapshotRecord, SnapshotTags, SnapshotType};
use executor::{CommandRunner, CommandSpec};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

struct Stored {
    record: SnapshotRecord,
    files: Vec<(PathBuf, Vec<u8>)>,
}

#[derive(Default)]
struct State {
    snapshots: Vec<Stored>,
    retention_paths: Vec<PathBuf>,
    dumps: Vec<(String, String)>,
    restores: Vec<(String, PathBuf)>,
}

pub struct MemorySnapshots {
    hostname: String,
    runner: Option<CommandRunner>,
    block_volume_snapshots: AtomicBool,
    block_restores: AtomicBool,
    block_recipe_restores: AtomicBool,
    state: Mutex<State>,
}

impl MemorySnapshots {
    pub fn new(hostname: &str) -> Self {
        Self {
            hostname: hostname.to_string(),
            runner: None,
            block_volume_snapshots: AtomicBool::new(false),
            block_restores: AtomicBool::new(false),
            block_recipe_restores: AtomicBool::new(false),
            state: Mutex::new(State::default()),
        }
    }

    pub fn with_runner(mut self, runner: CommandRunner) -> Self {
        self.runner = Some(runner);
        self
    }

    pub fn block_volume_snapshots(&self) {
        self.block_volume_snapshots.store(true, Ordering::SeqCst);
    }

    pub fn block_restores(&self) {
        self.block_restores.store(true, Ordering::SeqCst);
    }

    /// Recipe restores write their files, then block until killed
    pub fn block_recipe_restores(&self) {
        self.block_recipe_restores.store(true, Ordering::SeqCst);
    }

    /// Seed a record as if an earlier version had written it
    pub fn insert(&self, record: SnapshotRecord) {
        self.state.lock().unwrap().snapshots.push(Stored {
            record,
            files: Vec::new(),
        });
    }

    pub fn records(&self) -> Vec<SnapshotRecord> {
        self.state
            .lock()
            .unwrap()
            .snapshots
            .iter()
            .map(|s| s.record.clone())
            .collect()
    }

    pub fn retention_paths(&self) -> Vec<PathBuf> {
        self.state.lock().unwrap().retention_paths.clone()
    }

    pub fn dumps(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().dumps.clone()
    }

    pub fn restores(&self) -> Vec<(String, PathBuf)> {
        self.state.lock().unwrap().restores.clone()
    }

    /// Run `sleep 30` through the wrapper until the exit-safety sweep kills it
    async fn block(&self, label: &str) -> Result<()> {
        let runner = self
            .runner
            .as_ref()
            .ok_or_else(|| anyhow!("blocking requires a command runner"))?;
        let output = runner
            .run(
                &CommandSpec::new("sleep").arg("30").label(label),
                Some(Duration::from_secs(60)),
            )
            .await?;
        Err(anyhow!("{} ended with exit code {}", label, output.exit_code))
    }

    fn store(&self, path: &str, tags: &SnapshotTags, files: Vec<(PathBuf, Vec<u8>)>) -> String {
        let mut state = self.state.lock().unwrap();
        let id = format!("{:08x}{:056x}", state.snapshots.len() + 1, 0);
        let record = SnapshotRecord {
            id: id.clone(),
            short_id: id[..8].to_string(),
            time: Utc::now(),
            hostname: self.hostname.clone(),
            paths: vec![path.to_string()],
            tags: tags.clone(),
        };
        state.snapshots.push(Stored { record, files });
        id
    }
}

fn read_tree(root: &Path, dir: &Path, out: &mut Vec<(PathBuf, Vec<u8>)>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            read_tree(root, &path, out)?;
        } else {
            let relative = path.strip_prefix(root).unwrap_or(&path).to_path_buf();
            out.push((relative, std::fs::read(&path)?));
        }
    }
    Ok(())
}

#[async_trait]
impl SnapshotEngine for MemorySnapshots {
    async fn create_snapshot(&self, path: &Path, tags: &SnapshotTags, _excludes: &[String]) -> Result<String> {
        if tags.kind == SnapshotType::Volume && self.block_volume_snapshots.load(Ordering::SeqCst) {
            self.block("restic backup (volume)").await?;
        }
        let mut files = Vec::new();
        if path.is_dir() {
            read_tree(path, path, &mut files)?;
        }
        Ok(self.store(&path.display().to_string(), tags, files))
    }

    async fn create_snapshot_from_stream(
        &self,
        producer: &CommandSpec,
        virtual_path: &str,
        tags: &SnapshotTags,
    ) -> Result<String> {
        let mut files = Vec::new();
        if let Some(runner) = &self.runner {
            let output = runner.run_checked(producer, None).await?;
            files.push((PathBuf::new(), output.stdout.into_bytes()));
        }
        Ok(self.store(virtual_path, tags, files))
    }

    async fn list_snapshots(&self, filter: Option<&SnapshotFilter>) -> Result<Vec<SnapshotRecord>> {
        Ok(self
            .records()
            .into_iter()
            .filter(|r| filter.map_or(true, |f| f.matches(r)))
            .collect())
    }

    async fn restore_snapshot(&self, id: &str, target: &Path) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .restores
            .push((id.to_string(), target.to_path_buf()));
        let (kind, source, files) = {
            let state = self.state.lock().unwrap();
            let stored = state
                .snapshots
                .iter()
                .find(|s| s.record.id == id)
                .ok_or_else(|| anyhow!("no snapshot {}", id))?;
            (
                stored.record.tags.kind,
                stored.record.paths[0].clone(),
                stored.files.clone(),
            )
        };
        if kind == SnapshotType::Volume && self.block_restores.load(Ordering::SeqCst) {
            self.block("restic restore (volume)").await?;
        }

        let base = target.join(source.trim_start_matches('/'));
        std::fs::create_dir_all(&base)?;
        for (relative, content) in files {
            let destination = base.join(relative);
            if let Some(parent) = destination.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(destination, content)?;
        }
        if kind == SnapshotType::Recipe && self.block_recipe_restores.load(Ordering::SeqCst) {
            self.block("restic restore (recipe)").await?;
        }
        Ok(())
    }

    async fn dump_snapshot_to(&self, id: &str, path: &str, _consumer: &CommandSpec) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .dumps
            .push((id.to_string(), path.to_string()));
        Ok(())
    }

    async fn apply_retention_policy(&self, path: &Path, _policy: &RetentionPolicy) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .retention_paths
            .push(path.to_path_buf());
        Ok(())
    }
}
