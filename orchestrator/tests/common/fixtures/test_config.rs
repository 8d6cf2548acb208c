//! Test configuration builders
//!
//! `TestDirs` hands out an in-memory `Config` whose paths live in a temp
//! dir. `TestConfigBuilder` writes the same layout to disk for the loader.

use executor::backends::BackendConfig;
use executor::exit_safety::ExitSafety;
use executor::types::RetentionPolicy;
use orchestrator::config::{
    Config, DrBundleConfig, NotificationConfig, RepositoryConfig, RestoreConfig, TimeoutConfig,
};
use orchestrator::PipelineContext;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

use super::{MemorySnapshots, MockEngine};

/// Scratch directories for one test
pub struct TestDirs {
    _root: TempDir,
    pub base: PathBuf,
    pub staging: PathBuf,
    pub scratch: PathBuf,
    pub repo: PathBuf,
    pub password_file: PathBuf,
}

impl TestDirs {
    pub fn new() -> Self {
        let root = TempDir::new().expect("Failed to create temp dir");
        let base = root.path().to_path_buf();
        let password_file = base.join("password");
        fs::write(&password_file, "correct horse").expect("Failed to write password file");

        Self {
            staging: base.join("staging"),
            scratch: base.join("scratch"),
            repo: base.join("repo"),
            password_file,
            base,
            _root: root,
        }
    }

    /// A valid configuration rooted in this directory
    pub fn config(&self) -> Config {
        Config {
            hostname: Some("web01".to_string()),
            staging_root: self.staging.clone(),
            scratch_root: self.scratch.clone(),
            parallelism: Some(2),
            helper_image: "alpine:3".to_string(),
            non_interactive: true,
            exclude_units: Vec::new(),
            repository: RepositoryConfig {
                password_file: self.password_file.clone(),
                backend: BackendConfig::Local {
                    path: self.repo.clone(),
                },
            },
            retention: RetentionPolicy {
                keep_last: Some(3),
                ..Default::default()
            },
            timeouts: TimeoutConfig {
                health_seconds: 2,
                ..Default::default()
            },
            restore: RestoreConfig::default(),
            notifications: NotificationConfig::default(),
            dr_bundle: DrBundleConfig::default(),
            units: HashMap::new(),
        }
    }
}

impl Default for TestDirs {
    fn default() -> Self {
        Self::new()
    }
}

pub fn test_context(
    engine: Arc<MockEngine>,
    snapshots: Arc<MemorySnapshots>,
    coordinator: Arc<ExitSafety>,
    config: Config,
) -> PipelineContext {
    PipelineContext::new(coordinator, engine, snapshots, Arc::new(config))
}

/// Writes `stackvault.toml` and `units/*.toml` to a temp dir
pub struct TestConfigBuilder {
    temp_dir: TempDir,
    parallelism: Option<usize>,
    webhook_url: Option<String>,
    extra_main: Vec<String>,
    units: HashMap<String, String>,
}

impl TestConfigBuilder {
    pub fn new() -> Self {
        Self {
            temp_dir: TempDir::new().expect("Failed to create temp dir"),
            parallelism: None,
            webhook_url: None,
            extra_main: Vec::new(),
            units: HashMap::new(),
        }
    }

    pub fn with_parallelism(mut self, workers: usize) -> Self {
        self.parallelism = Some(workers);
        self
    }

    pub fn with_webhook(mut self, url: &str) -> Self {
        self.webhook_url = Some(url.to_string());
        self
    }

    /// Raw TOML appended to the main file, e.g. a `[retention]` table
    pub fn with_main_toml(mut self, fragment: &str) -> Self {
        self.extra_main.push(fragment.to_string());
        self
    }

    pub fn with_unit(mut self, name: &str, content: &str) -> Self {
        self.units.insert(name.to_string(), content.to_string());
        self
    }

    pub fn build(self) -> TestConfig {
        let base = self.temp_dir.path();
        let config_dir = base.join("config");
        let units_dir = config_dir.join("units");
        fs::create_dir_all(&units_dir).expect("Failed to create config dir");

        let mut main = format!(
            "hostname = \"web01\"\n\
             staging_root = \"{staging}\"\n\
             scratch_root = \"{scratch}\"\n\
             non_interactive = true\n",
            staging = base.join("staging").display(),
            scratch = base.join("scratch").display(),
        );
        if let Some(workers) = self.parallelism {
            main.push_str(&format!("parallelism = {}\n", workers));
        }
        main.push_str(&format!(
            "\n[repository]\nkind = \"local\"\npath = \"{}\"\npassword_file = \"{}\"\n",
            base.join("repo").display(),
            base.join("password").display()
        ));
        if let Some(url) = &self.webhook_url {
            main.push_str(&format!("\n[notifications]\nwebhook_url = \"{}\"\n", url));
        }
        for fragment in &self.extra_main {
            main.push('\n');
            main.push_str(fragment);
            main.push('\n');
        }

        fs::write(config_dir.join("stackvault.toml"), main).expect("Failed to write stackvault.toml");
        for (name, content) in &self.units {
            fs::write(units_dir.join(format!("{}.toml", name)), content)
                .expect("Failed to write unit config");
        }

        TestConfig {
            _temp_dir: self.temp_dir,
            config_dir,
        }
    }
}

impl Default for TestConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

pub struct TestConfig {
    _temp_dir: TempDir,
    pub config_dir: PathBuf,
}
