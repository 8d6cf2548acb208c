use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use executor::exit_safety::ExitSafety;
use executor::types::BackupScope;
use orchestrator::config::ConfigManager;
use orchestrator::restore::{ConflictPolicy, RestoreSelection, StdinPrompt};
use orchestrator::{summary, Vault};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "stackvault", version, about = "Cold backups of container stacks")]
struct Cli {
    /// Directory holding stackvault.toml and units/*.toml
    #[arg(long, default_value = "/etc/stackvault")]
    config: PathBuf,

    /// Debug logging for stackvault crates
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List backup units found on this host
    Discover,
    /// Back up the given units, or all of them
    Backup {
        units: Vec<String>,
        /// full | config
        #[arg(long, default_value = "full")]
        scope: String,
    },
    /// List restore sessions
    Sessions {
        #[arg(long)]
        unit: Option<String>,
        /// Sessions created on another host
        #[arg(long)]
        host: Option<String>,
    },
    /// Hosts with backups in the repository
    Hosts,
    /// Restore one session
    Restore {
        unit: String,
        backup_id: String,
        /// Restore only these volumes (repeatable)
        #[arg(long = "volume")]
        volumes: Vec<String>,
        #[arg(long)]
        no_networks: bool,
        #[arg(long)]
        no_volumes: bool,
        /// skip | rename | overwrite | ask
        #[arg(long)]
        conflict: Option<String>,
    },
    /// Verify tools, backend and repository
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    let env_filter = EnvFilter::from_default_env()
        .add_directive(format!("orchestrator={}", level).parse()?)
        .add_directive(format!("executor={}", level).parse()?)
        .add_directive("reqwest=warn".parse()?);

    fmt().with_env_filter(env_filter).init();

    let config_manager = ConfigManager::new(&cli.config).await?;
    let config = config_manager.get_current_config();
    info!(
        "Configuration loaded: {} backend, {} unit overrides",
        config.repository.backend.kind(),
        config.units.len()
    );

    // Signal handlers go in before anything can spawn a process
    let coordinator = ExitSafety::new();
    coordinator.install()?;

    let vault = Vault::from_config(config.clone(), coordinator)?;

    match cli.command {
        Command::Discover => {
            for unit in vault.discover().await? {
                println!(
                    "{} ({:?}): {} containers, {} volumes, {} networks",
                    unit.name,
                    unit.kind,
                    unit.containers.len(),
                    unit.volumes.len(),
                    unit.networks.len()
                );
            }
        }
        Command::Backup { units, scope } => {
            let Some(scope) = BackupScope::parse(&scope) else {
                bail!("Unknown scope '{}', expected full or config", scope);
            };
            let reports = vault.run_backups(&units, scope).await?;
            for line in summary::backup_lines(&reports) {
                println!("{}", line);
            }
            if reports.iter().any(|r| !r.success()) {
                error!("Backup run finished with failures");
                std::process::exit(1);
            }
        }
        Command::Sessions { unit, host } => {
            let sessions = vault
                .list_restore_sessions(unit.as_deref(), host.as_deref())
                .await?;
            for session in sessions {
                let scope = session.scope.map(|s| s.as_str()).unwrap_or("full");
                let mixed = if session.is_mixed_format() { " (mixed formats)" } else { "" };
                println!(
                    "{}  {}  {}  host={} scope={} volumes=[{}]{}",
                    session.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    session.unit,
                    session.backup_id,
                    session.hostname,
                    scope,
                    session.volume_names().join(", "),
                    mixed
                );
            }
        }
        Command::Hosts => {
            for host in vault.host_summaries().await? {
                println!(
                    "{}  last backup {}  {} units  {} snapshots",
                    host.hostname,
                    host.last_backup.format("%Y-%m-%d %H:%M:%S"),
                    host.unit_count,
                    host.snapshot_count
                );
            }
        }
        Command::Restore {
            unit,
            backup_id,
            volumes,
            no_networks,
            no_volumes,
            conflict,
        } => {
            let policy = match conflict.as_deref() {
                Some(raw) => match ConflictPolicy::parse(raw) {
                    Some(policy) => Some(policy),
                    None => bail!("Unknown conflict policy '{}'", raw),
                },
                None => None,
            };
            let selection = RestoreSelection {
                volumes: if volumes.is_empty() { None } else { Some(volumes) },
                networks: !no_networks,
                volumes_enabled: !no_volumes,
            };

            let session = vault.find_session(&unit, &backup_id).await?;
            let report = vault
                .run_restore(&session, &selection, policy, &StdinPrompt)
                .await?;
            for line in summary::restore_lines(&report) {
                println!("{}", line);
            }
            if !report.success() {
                std::process::exit(1);
            }
        }
        Command::Check => {
            for line in vault.check().await? {
                println!("ok: {}", line);
            }
        }
    }

    Ok(())
}
