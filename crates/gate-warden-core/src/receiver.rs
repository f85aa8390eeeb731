//! Webhook notification decoding, storage, and listener dispatch.
//!
//! The quality server pushes one notification per finished analysis task.
//! [`WebhookReceiver`] owns the two pieces of shared mutable state in the
//! subsystem: the listener registry and the [`CorrelationCache`]. It is an
//! explicit component instance, created at startup, injected into both the
//! HTTP endpoint and every waiting step, and never reachable as process
//! global state.
//!
//! Delivery ordering: a notification is stored in the correlation cache
//! *before* listeners are dispatched, so a listener invoked during
//! [`WebhookReceiver::receive`] can always read the just-stored entry.

use crate::correlation::CorrelationCache;
use crate::{ParseError, QualityGateOutcome, TaskStatus, Timestamp};
use bytes::Bytes;
use serde::Deserialize;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[cfg(test)]
#[path = "receiver_tests.rs"]
mod tests;

// ============================================================================
// Notification Type
// ============================================================================

/// A decoded webhook notification, immutable once created.
///
/// The raw payload bytes are retained because signature verification must
/// run over exactly what the server signed, not over a re-serialization.
#[derive(Debug, Clone)]
pub struct WebhookNotification {
    /// Raw request body as received.
    pub raw_payload: Bytes,

    /// Compute-engine task id the notification refers to.
    pub task_id: String,

    /// Task status reported by the server.
    pub task_status: TaskStatus,

    /// Quality gate outcome; present only when the task succeeded.
    pub quality_gate: Option<QualityGateOutcome>,

    /// Name of the analyzed project.
    pub component_name: String,

    /// Dashboard URL of the analyzed project.
    pub dashboard_url: String,

    /// Value of the HMAC signature header, when the sender was configured
    /// with a secret.
    pub received_signature: Option<String>,

    /// When the notification arrived.
    pub received_at: Timestamp,
}

// ============================================================================
// Payload Schema
// ============================================================================

/// Wire schema of the notification body. Decoding fails closed: any missing
/// required field rejects the whole notification.
#[derive(Debug, Deserialize)]
struct NotificationPayload {
    #[serde(rename = "taskId")]
    task_id: String,
    status: String,
    #[serde(rename = "qualityGate")]
    quality_gate: Option<QualityGatePayload>,
    project: ProjectPayload,
}

#[derive(Debug, Deserialize)]
struct QualityGatePayload {
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProjectPayload {
    name: String,
    url: String,
}

/// Error raised for a webhook body that cannot be accepted.
///
/// This is a local, non-retryable failure surfaced only to the HTTP caller
/// (the quality server); it is never propagated into any job.
#[derive(Debug, thiserror::Error)]
pub enum NotificationError {
    #[error("Invalid JSON Payload")]
    MalformedPayload { message: String },
}

impl From<ParseError> for NotificationError {
    fn from(e: ParseError) -> Self {
        Self::MalformedPayload {
            message: e.to_string(),
        }
    }
}

// ============================================================================
// Listeners
// ============================================================================

/// Identifier handed out at listener registration, used for removal.
pub type ListenerId = Uuid;

/// Error returned by a listener callback. Failures are isolated per
/// listener: they are logged and never abort dispatch to other listeners
/// or the webhook delivery itself.
#[derive(Debug, thiserror::Error)]
#[error("Listener failed: {message}")]
pub struct ListenerError {
    pub message: String,
}

/// Callback interface for notification delivery.
///
/// Listeners receive *every* accepted notification and must filter by task
/// id themselves; the receiver does no per-task routing (only the
/// correlation cache is pull-based per task).
///
/// Callbacks run synchronously while the registry lock is held, so a
/// listener removed during dispatch is never invoked after its removal
/// returns. Implementations must therefore be quick and must not call back
/// into the receiver's registration methods.
pub trait WebhookListener: Send + Sync {
    fn on_notification(&self, notification: &WebhookNotification) -> Result<(), ListenerError>;
}

struct RegisteredListener {
    id: ListenerId,
    listener: Arc<dyn WebhookListener>,
}

// ============================================================================
// Receiver
// ============================================================================

/// Accepts inbound webhook notifications, validates their shape, stores
/// them for pull-based correlation, and fans them out to registered
/// listeners.
pub struct WebhookReceiver {
    cache: Arc<CorrelationCache>,
    listeners: Mutex<Vec<RegisteredListener>>,
}

impl WebhookReceiver {
    /// Create a receiver around the given correlation cache.
    pub fn new(cache: Arc<CorrelationCache>) -> Self {
        Self {
            cache,
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Process a raw webhook delivery.
    ///
    /// On success the decoded notification has been stored in the
    /// correlation cache (overwriting any prior entry for the same task id)
    /// and dispatched to every currently-registered listener. Listener
    /// errors are logged and swallowed.
    ///
    /// # Errors
    ///
    /// Returns [`NotificationError::MalformedPayload`] when the body is not
    /// valid JSON, misses a required field, or carries an unrecognized
    /// status value. Nothing is stored or dispatched in that case.
    pub fn receive(
        &self,
        raw_body: Bytes,
        signature_header: Option<&str>,
    ) -> Result<WebhookNotification, NotificationError> {
        let payload: NotificationPayload = serde_json::from_slice(&raw_body).map_err(|e| {
            NotificationError::MalformedPayload {
                message: e.to_string(),
            }
        })?;

        let task_status = TaskStatus::from_str(&payload.status)?;

        // The gate outcome is only meaningful for a successful task; its
        // absence there means no gate was evaluated.
        let quality_gate = if task_status == TaskStatus::Success {
            match payload.quality_gate.and_then(|qg| qg.status) {
                Some(raw) => Some(QualityGateOutcome::from_str(&raw)?),
                None => Some(QualityGateOutcome::None),
            }
        } else {
            None
        };

        let notification = WebhookNotification {
            raw_payload: raw_body,
            task_id: payload.task_id,
            task_status,
            quality_gate,
            component_name: payload.project.name,
            dashboard_url: payload.project.url,
            received_signature: signature_header.map(String::from),
            received_at: Timestamp::now(),
        };

        info!(
            task_id = %notification.task_id,
            status = %notification.task_status,
            component = %notification.component_name,
            "Received quality server webhook notification"
        );

        // Store before dispatch so listeners can read the correlation entry.
        self.cache.store(notification.clone());
        self.dispatch(&notification);

        Ok(notification)
    }

    fn dispatch(&self, notification: &WebhookNotification) {
        let listeners = match self.listeners.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        for registered in listeners.iter() {
            if let Err(e) = registered.listener.on_notification(notification) {
                warn!(
                    listener_id = %registered.id,
                    task_id = %notification.task_id,
                    error = %e,
                    "Webhook listener failed; continuing with remaining listeners"
                );
            }
        }

        debug!(
            task_id = %notification.task_id,
            listener_count = listeners.len(),
            "Dispatched notification to listeners"
        );
    }

    /// Register a listener for all future notifications.
    pub fn add_listener(&self, listener: Arc<dyn WebhookListener>) -> ListenerId {
        let id = Uuid::new_v4();
        let mut listeners = match self.listeners.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        listeners.push(RegisteredListener { id, listener });
        id
    }

    /// Remove a previously registered listener.
    ///
    /// Once this returns, the listener will not be invoked again, even when
    /// a dispatch is concurrently in flight.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = match self.listeners.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let before = listeners.len();
        listeners.retain(|l| l.id != id);
        listeners.len() != before
    }

    /// Number of currently registered listeners.
    pub fn listener_count(&self) -> usize {
        match self.listeners.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    /// Pull-based lookup for a waiter that registers *after* the
    /// notification already arrived.
    pub fn notification_for_task(&self, task_id: &str) -> Option<WebhookNotification> {
        self.cache.notification_for_task(task_id)
    }

    /// The correlation cache backing this receiver.
    pub fn cache(&self) -> &Arc<CorrelationCache> {
        &self.cache
    }
}
