//! Short-lived correlation store mapping a task id to the most recent
//! notification received for it.
//!
//! The cache closes the race where a webhook arrives before the waiting
//! step has registered its listener: the step always checks here before
//! suspending. Entries are retained for a fixed two hours and then evicted
//! regardless of whether any waiter consumed them.

use crate::receiver::WebhookNotification;
use crate::Timestamp;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

#[cfg(test)]
#[path = "correlation_tests.rs"]
mod tests;

/// How long a notification stays available for correlation.
pub const RETENTION: Duration = Duration::from_secs(2 * 60 * 60);

struct StoredNotification {
    notification: WebhookNotification,
    stored_at: Timestamp,
}

/// Task-id keyed notification store with fixed expiry.
///
/// Synchronization is a single mutex over the map; there are no cross-entry
/// invariants, and all operations are short.
pub struct CorrelationCache {
    entries: Mutex<HashMap<String, StoredNotification>>,
}

impl CorrelationCache {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Store a notification under its task id, overwriting any prior entry
    /// for the same id (last write wins). Expired entries are swept on the
    /// way in.
    pub fn store(&self, notification: WebhookNotification) {
        let now = Timestamp::now();
        let mut entries = self.lock();

        entries.retain(|_, stored| now.duration_since(stored.stored_at) < RETENTION);

        debug!(task_id = %notification.task_id, "Storing notification for correlation");
        entries.insert(
            notification.task_id.clone(),
            StoredNotification {
                notification,
                stored_at: now,
            },
        );
    }

    /// Look up the most recent unexpired notification for a task id.
    pub fn notification_for_task(&self, task_id: &str) -> Option<WebhookNotification> {
        let now = Timestamp::now();
        let entries = self.lock();
        entries
            .get(task_id)
            .filter(|stored| now.duration_since(stored.stored_at) < RETENTION)
            .map(|stored| stored.notification.clone())
    }

    /// Number of entries currently held, expired or not.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Test affordance: force an entry's age backward instead of waiting
    /// out the retention window.
    pub fn backdate(&self, task_id: &str, by: Duration) {
        let mut entries = self.lock();
        if let Some(stored) = entries.get_mut(task_id) {
            stored.stored_at = stored.stored_at.minus(by);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, StoredNotification>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for CorrelationCache {
    fn default() -> Self {
        Self::new()
    }
}
