pub mod backup;
pub mod config;
pub mod constants;
pub mod context;
pub mod discovery;
pub mod dr_bundle;
pub mod restore;
pub mod retention;
pub mod run_tracker;
pub mod services;
pub mod staging;
pub mod summary;
pub mod vault;

// Re-export commonly used types
pub use backup::{BackupPipeline, BackupReport, BackupStage};
pub use config::{Config, ConfigManager, UnitConfig};
pub use context::PipelineContext;
pub use restore::{RestorePipeline, RestoreReport, RestoreSelection, RestoreSession};
pub use run_tracker::RunTracker;
pub use services::{NotificationSink, WebhookNotifier};
pub use staging::StagingLayout;
pub use vault::Vault;
