use std::fmt;
use std::time::Duration;
use tracing::{info, warn};

use crate::errors::{PreconditionError, VaultError};
use crate::services::commands::{CommandRunner, CommandSpec};
use crate::types::HookSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookKind {
    PreBackup,
    PostBackup,
    PreRestore,
    PostRestore,
}

impl HookKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookKind::PreBackup => "pre_backup",
            HookKind::PostBackup => "post_backup",
            HookKind::PreRestore => "pre_restore",
            HookKind::PostRestore => "post_restore",
        }
    }

    /// Pre-hooks gate the run, post-hooks only warn
    pub fn is_blocking(&self) -> bool {
        matches!(self, HookKind::PreBackup | HookKind::PreRestore)
    }

    fn command<'a>(&self, hooks: &'a HookSet) -> Option<&'a str> {
        match self {
            HookKind::PreBackup => hooks.pre_backup.as_deref(),
            HookKind::PostBackup => hooks.post_backup.as_deref(),
            HookKind::PreRestore => hooks.pre_restore.as_deref(),
            HookKind::PostRestore => hooks.post_restore.as_deref(),
        }
    }
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookOutcome {
    /// No hook configured for this kind
    Skipped,
    Succeeded { stdout: String, stderr: String },
    Failed { reason: String },
}

impl HookOutcome {
    pub fn success(&self) -> bool {
        !matches!(self, HookOutcome::Failed { .. })
    }
}

#[derive(Clone)]
pub struct HookRunner {
    runner: CommandRunner,
}

impl HookRunner {
    pub fn new(runner: CommandRunner) -> Self {
        Self { runner }
    }

    /// Run the hook of `kind` from `hooks` through `sh -c`
    pub async fn execute(
        &self,
        kind: HookKind,
        unit: &str,
        hooks: &HookSet,
        timeout: Duration,
    ) -> HookOutcome {
        let Some(script) = kind.command(hooks) else {
            return HookOutcome::Skipped;
        };

        info!(unit, hook = %kind, "Running hook");
        let spec = CommandSpec::shell(script)
            .env("STACKVAULT_UNIT", unit)
            .env("STACKVAULT_HOOK", kind.as_str())
            .label(&format!("hook {} ({})", kind, unit));

        match self.runner.run(&spec, Some(timeout)).await {
            Ok(output) if output.success() => HookOutcome::Succeeded {
                stdout: output.stdout,
                stderr: output.stderr,
            },
            Ok(output) => {
                let detail = if output.stderr.trim().is_empty() {
                    output.stdout.trim().to_string()
                } else {
                    output.stderr.trim().to_string()
                };
                HookOutcome::Failed {
                    reason: format!("exit code {}: {}", output.exit_code, detail),
                }
            }
            Err(e) => HookOutcome::Failed {
                reason: e.to_string(),
            },
        }
    }

    /// Run a hook and apply its gating rule: a failed pre-hook is an error,
    /// a failed post-hook is logged and returned as a warning.
    pub async fn run_gated(
        &self,
        kind: HookKind,
        unit: &str,
        hooks: &HookSet,
        timeout: Duration,
    ) -> Result<Option<String>, VaultError> {
        match self.execute(kind, unit, hooks, timeout).await {
            HookOutcome::Failed { reason } if kind.is_blocking() => {
                Err(PreconditionError::HookFailed {
                    hook: kind.to_string(),
                    unit: unit.to_string(),
                    reason,
                }
                .into())
            }
            HookOutcome::Failed { reason } => {
                warn!(unit, hook = %kind, "Hook failed: {}", reason);
                Ok(Some(format!("{} hook failed: {}", kind, reason)))
            }
            _ => Ok(None),
        }
    }
}
