pub mod backends;
pub mod errors;
pub mod exit_safety;
pub mod services;
pub mod types;

#[cfg(test)]
mod testing;

pub use errors::VaultError;
pub use exit_safety::ExitSafety;
pub use services::commands::{CommandOutput, CommandRunner, CommandSpec};
pub use services::docker::{ContainerEngine, DockerCli};
pub use services::hooks::{HookKind, HookOutcome, HookRunner};
pub use services::restic::{ResticCli, ResticTimeouts, SnapshotEngine};
