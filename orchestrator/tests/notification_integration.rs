//! Webhook notification delivery against a wiremock endpoint

mod common;

use common::fixtures::*;
use orchestrator::services::{NotificationSink, RunStats, UnitStats, WebhookNotifier};
use std::time::{Duration, Instant};

fn stats(failed: bool) -> RunStats {
    RunStats {
        operation: "backup".to_string(),
        host: "web01".to_string(),
        interrupted: false,
        units: vec![
            UnitStats {
                unit: "demo".to_string(),
                success: true,
                backup_id: Some("20260301T023000-ab12cd34".to_string()),
                errors: vec![],
            },
            UnitStats {
                unit: "mail".to_string(),
                success: !failed,
                backup_id: Some("20260301T023000-ab12cd34".to_string()),
                errors: if failed {
                    vec!["volume mail_data failed: disk full".to_string()]
                } else {
                    vec![]
                },
            },
        ],
    }
}

#[tokio::test]
async fn test_failure_notification_payload() {
    let server = MockWebhookServer::start().await;
    server.mock_success().await;
    let notifier = WebhookNotifier::new(&server.webhook_url(), 5, false).unwrap();

    notifier.notify(false, &stats(true)).await;

    let bodies = server.bodies().await;
    assert_eq!(bodies.len(), 1);
    let body = &bodies[0];
    assert_eq!(body["success"], false);
    assert_eq!(body["operation"], "backup");
    assert_eq!(body["host"], "web01");
    assert_eq!(body["units_total"], 2);
    assert_eq!(body["units_failed"], 1);
    assert_eq!(body["units"][1]["unit"], "mail");
    assert_eq!(body["units"][1]["errors"][0], "volume mail_data failed: disk full");
    assert!(body["timestamp"].is_string());
}

#[tokio::test]
async fn test_success_notification_can_be_disabled() {
    let server = MockWebhookServer::start().await;
    server.mock_success().await;

    let quiet = WebhookNotifier::new(&server.webhook_url(), 5, false).unwrap();
    quiet.notify(true, &stats(false)).await;
    assert_eq!(server.request_count().await, 0);

    let chatty = WebhookNotifier::new(&server.webhook_url(), 5, true).unwrap();
    chatty.notify(true, &stats(false)).await;
    assert_eq!(server.request_count().await, 1);
}

#[tokio::test]
async fn test_webhook_errors_do_not_reach_the_caller() {
    let server = MockWebhookServer::start().await;
    server.mock_failure(500).await;
    let notifier = WebhookNotifier::new(&server.webhook_url(), 5, true).unwrap();

    notifier.notify(false, &stats(true)).await;

    assert_eq!(server.request_count().await, 1);
}

#[tokio::test]
async fn test_slow_webhook_is_abandoned_after_timeout() {
    let server = MockWebhookServer::start().await;
    server.mock_slow(Duration::from_secs(10)).await;
    let notifier = WebhookNotifier::new(&server.webhook_url(), 1, true).unwrap();

    let started = Instant::now();
    notifier.notify(false, &stats(true)).await;

    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_unreachable_webhook_is_logged_only() {
    // Nothing listens on port 9 of localhost
    let notifier = WebhookNotifier::new("http://127.0.0.1:9/webhook", 2, true).unwrap();
    notifier.notify(false, &stats(true)).await;
}
