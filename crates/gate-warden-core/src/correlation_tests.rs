//! Tests for the correlation cache.

use super::*;
use crate::{QualityGateOutcome, TaskStatus};
use bytes::Bytes;

fn notification(task_id: &str, status: TaskStatus) -> WebhookNotification {
    WebhookNotification {
        raw_payload: Bytes::from_static(b"{}"),
        task_id: task_id.to_string(),
        task_status: status,
        quality_gate: (status == TaskStatus::Success).then_some(QualityGateOutcome::Ok),
        component_name: "demo-project".to_string(),
        dashboard_url: "https://quality.example.com/dashboard?id=demo".to_string(),
        received_signature: None,
        received_at: Timestamp::now(),
    }
}

#[test]
fn test_absent_task_id_returns_none() {
    let cache = CorrelationCache::new();
    assert!(cache.notification_for_task("AYx-missing").is_none());
}

#[test]
fn test_store_then_lookup() {
    let cache = CorrelationCache::new();
    cache.store(notification("AYx-1", TaskStatus::Success));

    let found = cache.notification_for_task("AYx-1").unwrap();
    assert_eq!(found.task_id, "AYx-1");
    assert_eq!(found.task_status, TaskStatus::Success);
    assert_eq!(found.quality_gate, Some(QualityGateOutcome::Ok));
}

/// Re-delivery for the same task id overwrites: last write wins.
#[test]
fn test_overwrite_is_last_write_wins() {
    let cache = CorrelationCache::new();
    cache.store(notification("AYx-1", TaskStatus::InProgress));
    cache.store(notification("AYx-1", TaskStatus::Success));

    let found = cache.notification_for_task("AYx-1").unwrap();
    assert_eq!(found.task_status, TaskStatus::Success);
    assert_eq!(cache.len(), 1);
}

#[test]
fn test_entries_are_independent_per_task() {
    let cache = CorrelationCache::new();
    cache.store(notification("AYx-1", TaskStatus::Success));
    cache.store(notification("AYx-2", TaskStatus::Failed));

    assert_eq!(
        cache.notification_for_task("AYx-1").unwrap().task_status,
        TaskStatus::Success
    );
    assert_eq!(
        cache.notification_for_task("AYx-2").unwrap().task_status,
        TaskStatus::Failed
    );
}

#[test]
fn test_expired_entry_is_not_returned() {
    let cache = CorrelationCache::new();
    cache.store(notification("AYx-1", TaskStatus::Success));

    cache.backdate("AYx-1", RETENTION + Duration::from_secs(1));
    assert!(cache.notification_for_task("AYx-1").is_none());
}

#[test]
fn test_entry_just_inside_retention_is_returned() {
    let cache = CorrelationCache::new();
    cache.store(notification("AYx-1", TaskStatus::Success));

    cache.backdate("AYx-1", RETENTION - Duration::from_secs(60));
    assert!(cache.notification_for_task("AYx-1").is_some());
}

/// Expired entries are evicted when a new notification is stored.
#[test]
fn test_store_sweeps_expired_entries() {
    let cache = CorrelationCache::new();
    cache.store(notification("AYx-old", TaskStatus::Success));
    cache.backdate("AYx-old", RETENTION + Duration::from_secs(1));

    cache.store(notification("AYx-new", TaskStatus::Success));
    assert_eq!(cache.len(), 1);
    assert!(cache.notification_for_task("AYx-new").is_some());
}
