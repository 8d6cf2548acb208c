use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct UnitStats {
    pub unit: String,
    pub success: bool,
    pub backup_id: Option<String>,
    pub errors: Vec<String>,
}

/// Outcome of one run across all units
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct RunStats {
    pub operation: String,
    pub host: String,
    pub interrupted: bool,
    pub units: Vec<UnitStats>,
}

impl RunStats {
    pub fn failed(&self) -> usize {
        self.units.iter().filter(|u| !u.success).count()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NotificationPayload<'a> {
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub operation: &'a str,
    pub host: &'a str,
    pub units_total: usize,
    pub units_failed: usize,
    pub units: &'a [UnitStats],
}

/// Fire-and-forget run notifications. Delivery problems are logged and
/// never reach the caller.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, success: bool, stats: &RunStats);
}

pub struct NoopNotifier;

#[async_trait]
impl NotificationSink for NoopNotifier {
    async fn notify(&self, success: bool, stats: &RunStats) {
        debug!(success, units = stats.units.len(), "No notification sink configured");
    }
}

#[derive(Clone)]
pub struct WebhookNotifier {
    webhook_url: String,
    client: Client,
    timeout: Duration,
    notify_on_success: bool,
}

impl WebhookNotifier {
    pub fn new(webhook_url: &str, timeout_secs: u64, notify_on_success: bool) -> Result<Self> {
        let timeout = Duration::from_secs(timeout_secs);
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client for notifications")?;

        Ok(Self {
            webhook_url: webhook_url.to_string(),
            client,
            timeout,
            notify_on_success,
        })
    }

    async fn send_webhook(&self, payload: &NotificationPayload<'_>) {
        match timeout(
            self.timeout,
            self.client.post(&self.webhook_url).json(payload).send(),
        )
        .await
        {
            Ok(Ok(response)) => {
                if response.status().is_success() {
                    info!("Notification sent for {} ({} units)", payload.operation, payload.units_total);
                } else {
                    warn!("Notification webhook returned status: {}", response.status());
                }
            }
            Ok(Err(e)) => {
                warn!("Failed to send notification: {}", e);
            }
            Err(_) => {
                warn!("Notification webhook timeout after {}s", self.timeout.as_secs());
            }
        }
    }
}

#[async_trait]
impl NotificationSink for WebhookNotifier {
    async fn notify(&self, success: bool, stats: &RunStats) {
        if success && !self.notify_on_success {
            debug!("Run succeeded, success notifications disabled");
            return;
        }

        let payload = NotificationPayload {
            timestamp: Utc::now(),
            success,
            operation: &stats.operation,
            host: &stats.host,
            units_total: stats.units.len(),
            units_failed: stats.failed(),
            units: &stats.units,
        };
        self.send_webhook(&payload).await;
    }
}
