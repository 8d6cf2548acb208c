//! Central repository for timeouts, limits and default values
//!
//! Constants are grouped by concern; configuration defaults point here so
//! there is a single source of truth for every magic number.

use std::time::Duration;

/// Default timeouts for external calls, overridable under `[timeouts]`
pub mod timeouts {
    /// `docker stop --time` grace before the engine kills a container
    pub const STOP_SECONDS: u64 = 30;

    /// Per-container start timeout, also used by the exit handler
    pub const START_SECONDS: u64 = 60;

    /// How long to wait for a health probe to report healthy
    pub const HEALTH_SECONDS: u64 = 120;

    /// restic backup/restore/dump/forget
    pub const SNAPSHOT_SECONDS: u64 = 6 * 3600;

    /// Pre/post hooks
    pub const HOOK_SECONDS: u64 = 300;

    /// Every other docker or restic call
    pub const COMMAND_SECONDS: u64 = 120;
}

/// Health probe polling
pub mod health {
    use super::Duration;

    pub const POLL_INTERVAL: Duration = Duration::from_secs(2);
}

/// Volume worker pool sizing
pub mod parallelism {
    pub const MIN_WORKERS: usize = 1;

    /// Upper bound for the computed default
    pub const MAX_DEFAULT_WORKERS: usize = 4;

    /// Upper bound for an explicitly configured value
    pub const MAX_CONFIGURED_WORKERS: usize = 16;

    /// Memory reserved per concurrent volume snapshot
    pub const GIB_PER_WORKER: u64 = 2;

    /// Units backed up at the same time in one run
    pub const UNITS_IN_FLIGHT: usize = 2;
}

/// Notification delivery
pub mod notifications {
    pub const WEBHOOK_TIMEOUT_SECONDS: u64 = 10;
}

/// Run summaries
pub mod summary {
    /// Errors listed per unit before collapsing into "... and N more"
    pub const MAX_ERRORS_SHOWN: usize = 3;
}

/// Filesystem defaults
pub mod paths {
    pub const DEFAULT_STAGING_ROOT: &str = "/var/lib/stackvault/staging";
    pub const DEFAULT_SCRATCH_ROOT: &str = "/var/tmp/stackvault";
    pub const DEFAULT_HELPER_IMAGE: &str = "alpine:3";
    pub const MAIN_CONFIG_FILE: &str = "stackvault.toml";
    pub const UNIT_CONFIG_DIR: &str = "units";

    /// Prefix of virtual paths used by streamed volume snapshots
    pub const STREAM_PATH_PREFIX: &str = "/volumes";
}

/// Docker labels read during discovery
pub mod labels {
    pub const COMPOSE_PROJECT: &str = "com.docker.compose.project";
    pub const COMPOSE_CONFIG_FILES: &str = "com.docker.compose.project.config_files";
    pub const COMPOSE_WORKING_DIR: &str = "com.docker.compose.project.working_dir";

    /// Set to "true" on a container to keep it out of every backup
    pub const EXCLUDE: &str = "stackvault.exclude";
}

/// Secret redaction in recipes and docker_config dumps
pub mod redaction {
    pub const MARKER: &str = "***REDACTED***";

    /// Env keys containing any of these (case-insensitive) are redacted
    pub const SENSITIVE_KEY_PARTS: [&str; 5] = ["PASSWORD", "SECRET", "TOKEN", "KEY", "CREDENTIAL"];
}
