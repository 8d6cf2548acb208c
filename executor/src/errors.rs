//! Error taxonomy for backup and restore runs
//!
//! Configuration problems surface before any pipeline starts, precondition
//! failures abort before anything is mutated, external tool failures and
//! timeouts are recorded per unit or volume. Once the exit-safety cleanup
//! began, the command wrapper refuses new processes with `Interrupted`.

use std::fmt;
use std::time::Duration;

/// Main error type shared by the executor and orchestrator crates
#[derive(Debug)]
pub enum VaultError {
    /// Invalid or unreadable configuration, fatal before any run
    Configuration(ConfigError),

    /// Pre-hook or dependency failure, nothing was touched
    Precondition(PreconditionError),

    /// Some volumes or units failed while others succeeded
    PartialFailure(PartialFailure),

    /// Non-zero exit from docker, restic or a hook
    ExternalTool(ExternalToolError),

    /// Process could not be spawned at all
    Spawn { label: String, reason: String },

    /// External call exceeded its timeout and was terminated
    Timeout { label: String, after: Duration },

    /// Operation interrupted by a signal
    Interrupted { signal: i32 },

    /// Other errors with context
    Other(String),
}

/// Configuration error variants
#[derive(Debug)]
pub enum ConfigError {
    /// Failed to load configuration file
    LoadFailed { path: String, reason: String },

    /// Invalid configuration value
    InvalidValue { field: String, reason: String },

    /// Missing required configuration
    MissingRequired { field: String },

    /// Configuration parsing error
    ParseError { reason: String },
}

/// Precondition error variants
#[derive(Debug)]
pub enum PreconditionError {
    /// A pre-backup or pre-restore hook failed
    HookFailed {
        hook: String,
        unit: String,
        reason: String,
    },

    /// Required binary not found on PATH
    MissingDependency { tool: String },

    /// Unit already has a run in flight
    UnitBusy {
        unit: String,
        current_operation: String,
    },

    /// Unit name did not match anything discovered
    UnknownUnit { unit: String },
}

#[derive(Debug)]
pub struct PartialFailure {
    pub unit: String,
    pub failed: Vec<String>,
    pub succeeded: usize,
}

#[derive(Debug)]
pub struct ExternalToolError {
    pub label: String,
    pub exit_code: i32,
    pub stderr: String,
}

impl VaultError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, VaultError::Timeout { .. })
    }

    /// Timeouts count as tool failures once the process has been killed
    pub fn is_external_tool_failure(&self) -> bool {
        matches!(
            self,
            VaultError::ExternalTool(_) | VaultError::Timeout { .. }
        )
    }
}

impl fmt::Display for VaultError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VaultError::Configuration(e) => write!(f, "Configuration error: {}", e),
            VaultError::Precondition(e) => write!(f, "Precondition failed: {}", e),
            VaultError::PartialFailure(e) => write!(f, "Partial failure: {}", e),
            VaultError::ExternalTool(e) => write!(f, "External tool failure: {}", e),
            VaultError::Spawn { label, reason } => {
                write!(f, "Failed to spawn '{}': {}", label, reason)
            }
            VaultError::Timeout { label, after } => {
                write!(f, "'{}' timed out after {}s and was terminated", label, after.as_secs())
            }
            VaultError::Interrupted { signal } => {
                write!(f, "Interrupted by signal {}", signal)
            }
            VaultError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::LoadFailed { path, reason } => {
                write!(f, "Failed to load config from '{}': {}", path, reason)
            }
            ConfigError::InvalidValue { field, reason } => {
                write!(f, "Invalid value for '{}': {}", field, reason)
            }
            ConfigError::MissingRequired { field } => {
                write!(f, "Missing required field: {}", field)
            }
            ConfigError::ParseError { reason } => {
                write!(f, "Failed to parse config: {}", reason)
            }
        }
    }
}

impl fmt::Display for PreconditionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PreconditionError::HookFailed { hook, unit, reason } => {
                write!(f, "{} hook failed for '{}': {}", hook, unit, reason)
            }
            PreconditionError::MissingDependency { tool } => {
                write!(f, "Required tool '{}' not found on PATH", tool)
            }
            PreconditionError::UnitBusy {
                unit,
                current_operation,
            } => {
                write!(f, "Unit '{}' is busy with: {}", unit, current_operation)
            }
            PreconditionError::UnknownUnit { unit } => {
                write!(f, "Unit '{}' not found", unit)
            }
        }
    }
}

impl fmt::Display for PartialFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} of {} items failed for '{}': {}",
            self.failed.len(),
            self.failed.len() + self.succeeded,
            self.unit,
            self.failed.join("; ")
        )
    }
}

impl fmt::Display for ExternalToolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.stderr.is_empty() {
            write!(f, "'{}' exited with code {}", self.label, self.exit_code)
        } else {
            write!(
                f,
                "'{}' exited with code {}: {}",
                self.label, self.exit_code, self.stderr
            )
        }
    }
}

impl std::error::Error for VaultError {}
impl std::error::Error for ConfigError {}
impl std::error::Error for PreconditionError {}
impl std::error::Error for PartialFailure {}
impl std::error::Error for ExternalToolError {}

impl From<ConfigError> for VaultError {
    fn from(err: ConfigError) -> Self {
        VaultError::Configuration(err)
    }
}

impl From<PreconditionError> for VaultError {
    fn from(err: PreconditionError) -> Self {
        VaultError::Precondition(err)
    }
}

impl From<PartialFailure> for VaultError {
    fn from(err: PartialFailure) -> Self {
        VaultError::PartialFailure(err)
    }
}

impl From<ExternalToolError> for VaultError {
    fn from(err: ExternalToolError) -> Self {
        VaultError::ExternalTool(err)
    }
}

impl From<std::io::Error> for VaultError {
    fn from(err: std::io::Error) -> Self {
        VaultError::Other(err.to_string())
    }
}
