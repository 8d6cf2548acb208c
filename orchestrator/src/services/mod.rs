pub mod notification_service;

pub use notification_service::{NoopNotifier, NotificationSink, RunStats, UnitStats, WebhookNotifier};
