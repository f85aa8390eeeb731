//! The resumable quality-gate wait.
//!
//! A job reaches the wait point after launching an analysis. The step
//! polls the quality server once; if the task is still running it
//! subscribes to the webhook receiver and suspends. The only thing held
//! across the suspension is an `.await` on a channel, plus the persisted
//! [`WaitState`] that lets a restarted process pick the wait back up.
//!
//! Ordering differs deliberately between the two entry points:
//!
//! - [`QualityGateWaitStep::execute`] (fresh start) polls first and only
//!   subscribes when the poll was inconclusive (finish-early makes no
//!   subscription at all);
//! - [`QualityGateWaitStep::resume`] (after restart) subscribes *first*,
//!   then re-polls, so neither a notification lost during the outage nor
//!   one racing the restart can slip through.
//!
//! Cancellation drops the wait future; the listener registration is
//! removed synchronously by an RAII guard, so no orphaned registration can
//! receive a callback after teardown.

use crate::credentials::{CredentialError, CredentialResolver};
use crate::persistence::{PersistenceError, WaitState, WaitStateStore, WAIT_STATE_VERSION};
use crate::receiver::{ListenerError, WebhookListener, WebhookNotification, WebhookReceiver};
use crate::server::{QualityServerClient, ServerError};
use crate::signature;
use crate::{AnalysisRecord, QualityGateOutcome, RunContext, TaskStatus};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[cfg(test)]
#[path = "wait_tests.rs"]
mod tests;

// ============================================================================
// Errors
// ============================================================================

/// Failure modes of a quality-gate wait.
///
/// Setup errors, authentication failures, and terminal task failures are
/// fatal and never retried. A pending or in-progress task is not an error;
/// it is the expected keep-waiting condition and never surfaces here.
#[derive(Debug, thiserror::Error)]
pub enum WaitError {
    #[error(
        "No analysis with a compute-engine task id was recorded for this run; \
         the job never ran a supported analysis step"
    )]
    MissingAnalysis,

    #[error("Analysis record for task '{task_id}' carries no server URL")]
    MissingServerUrl { task_id: String },

    #[error("No suspended quality gate wait is persisted for run '{run_id}'")]
    MissingWaitState { run_id: String },

    #[error(
        "Persisted wait state for run '{run_id}' has version {version}, \
         but this build supports version {supported}"
    )]
    UnsupportedStateVersion {
        run_id: String,
        version: u32,
        supported: u32,
    },

    #[error("Webhook secret credential '{credential_id}' could not be found")]
    CredentialNotFound { credential_id: String },

    #[error("The incoming webhook failed verification against the configured webhook secret")]
    SignatureVerificationFailed,

    #[error("Quality server task '{task_id}' finished with status {status}")]
    TaskFailed { task_id: String, status: TaskStatus },

    #[error("Pipeline aborted due to quality gate failure: gate outcome was {outcome}")]
    QualityGateFailed { outcome: QualityGateOutcome },

    #[error(transparent)]
    Server(#[from] ServerError),

    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error("Webhook subscription closed while waiting for task '{task_id}'")]
    SubscriptionClosed { task_id: String },
}

impl WaitError {
    /// Whether the wait reached a terminal verdict about the task or gate,
    /// as opposed to failing on infrastructure. Terminal verdicts allow
    /// the persisted wait state to be discarded.
    fn is_terminal_verdict(&self) -> bool {
        matches!(
            self,
            Self::TaskFailed { .. } | Self::QualityGateFailed { .. }
        )
    }
}

// ============================================================================
// Listener Plumbing
// ============================================================================

/// Listener that forwards notifications for one task id into a channel.
/// Filtering by task id happens here; the receiver dispatches everything.
struct TaskListener {
    task_id: String,
    tx: mpsc::UnboundedSender<WebhookNotification>,
}

impl WebhookListener for TaskListener {
    fn on_notification(&self, notification: &WebhookNotification) -> Result<(), ListenerError> {
        if notification.task_id == self.task_id {
            // A send can only fail when the waiter is already gone; its
            // guard will remove this listener momentarily.
            let _ = self.tx.send(notification.clone());
        }
        Ok(())
    }
}

/// Removes the listener registration when dropped, including on
/// cancellation of the wait future.
struct ListenerGuard {
    receiver: Arc<WebhookReceiver>,
    id: crate::receiver::ListenerId,
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        self.receiver.remove_listener(self.id);
    }
}

struct Subscription {
    _guard: ListenerGuard,
    rx: mpsc::UnboundedReceiver<WebhookNotification>,
}

// ============================================================================
// Wait Step
// ============================================================================

/// Outcome of one inspection of the task, by poll or by notification.
enum Verdict {
    /// Task succeeded; gate outcome is known.
    Resolved(QualityGateOutcome),
    /// Task still running; keep waiting.
    Inconclusive,
}

/// The resumable wait step.
///
/// Holds only shared dependencies; per-wait data lives in the persisted
/// [`WaitState`], so one instance serves any number of concurrent runs.
pub struct QualityGateWaitStep {
    receiver: Arc<WebhookReceiver>,
    server: Arc<dyn QualityServerClient>,
    credentials: Arc<dyn CredentialResolver>,
    store: Arc<dyn WaitStateStore>,
}

impl QualityGateWaitStep {
    pub fn new(
        receiver: Arc<WebhookReceiver>,
        server: Arc<dyn QualityServerClient>,
        credentials: Arc<dyn CredentialResolver>,
        store: Arc<dyn WaitStateStore>,
    ) -> Self {
        Self {
            receiver,
            server,
            credentials,
            store,
        }
    }

    /// Run the wait from the start of the step.
    ///
    /// `analyses` is the job run's recorded analysis metadata, ordered
    /// most-recent-first. Returns the gate outcome, or an error on any of
    /// the fatal conditions described on [`WaitError`].
    pub async fn execute(
        &self,
        run: &RunContext,
        analyses: &[AnalysisRecord],
        abort_on_gate_failure: bool,
    ) -> Result<QualityGateOutcome, WaitError> {
        let record = AnalysisRecord::latest_with_task(analyses).ok_or(WaitError::MissingAnalysis)?;
        let state = build_state(record, abort_on_gate_failure)?;

        // Persist before the first await so a restart at any later point
        // finds the wait.
        self.store.save(&run.run_id, &state).await?;

        info!(
            run_id = %run.run_id,
            task_id = %state.ce_task_id,
            server_url = %state.server_url,
            "Checking quality gate for analysis task"
        );

        let result = self.drive_fresh(&state).await;
        self.conclude(run, &state, result).await
    }

    /// Resume a wait after a process restart.
    ///
    /// Subscribes before polling: a notification that arrived entirely
    /// during the outage is caught by the poll, one racing the restart by
    /// the subscription.
    pub async fn resume(&self, run: &RunContext) -> Result<QualityGateOutcome, WaitError> {
        let state = self
            .store
            .load(&run.run_id)
            .await?
            .ok_or_else(|| WaitError::MissingWaitState {
                run_id: run.run_id.clone(),
            })?;

        if state.version != WAIT_STATE_VERSION {
            return Err(WaitError::UnsupportedStateVersion {
                run_id: run.run_id.clone(),
                version: state.version,
                supported: WAIT_STATE_VERSION,
            });
        }

        info!(
            run_id = %run.run_id,
            task_id = %state.ce_task_id,
            "Resuming quality gate wait after restart"
        );

        let result = self.drive_resumed(&state).await;
        self.conclude(run, &state, result).await
    }

    // ------------------------------------------------------------------
    // State machine drivers
    // ------------------------------------------------------------------

    async fn drive_fresh(&self, state: &WaitState) -> Result<QualityGateOutcome, WaitError> {
        // Poll once; a terminal answer here means finish-early with no
        // subscription ever made.
        if let Verdict::Resolved(outcome) = self.poll_once(state).await? {
            return Ok(outcome);
        }

        // The webhook may have arrived before we got here.
        if let Some(notification) = self.receiver.notification_for_task(&state.ce_task_id) {
            debug!(task_id = %state.ce_task_id, "Found already-arrived notification");
            if let Verdict::Resolved(outcome) =
                self.handle_notification(state, &notification).await?
            {
                return Ok(outcome);
            }
        }

        let mut subscription = self.subscribe(&state.ce_task_id);

        // Re-check after subscribing: a notification delivered between the
        // first check and the registration would otherwise be lost.
        if let Some(notification) = self.receiver.notification_for_task(&state.ce_task_id) {
            if let Verdict::Resolved(outcome) =
                self.handle_notification(state, &notification).await?
            {
                return Ok(outcome);
            }
        }

        self.await_notification(state, &mut subscription).await
    }

    async fn drive_resumed(&self, state: &WaitState) -> Result<QualityGateOutcome, WaitError> {
        let mut subscription = self.subscribe(&state.ce_task_id);

        if let Verdict::Resolved(outcome) = self.poll_once(state).await? {
            return Ok(outcome);
        }

        if let Some(notification) = self.receiver.notification_for_task(&state.ce_task_id) {
            if let Verdict::Resolved(outcome) =
                self.handle_notification(state, &notification).await?
            {
                return Ok(outcome);
            }
        }

        self.await_notification(state, &mut subscription).await
    }

    fn subscribe(&self, task_id: &str) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.receiver.add_listener(Arc::new(TaskListener {
            task_id: task_id.to_string(),
            tx,
        }));
        debug!(task_id, listener_id = %id, "Subscribed to webhook notifications");
        Subscription {
            _guard: ListenerGuard {
                receiver: Arc::clone(&self.receiver),
                id,
            },
            rx,
        }
    }

    /// Suspend until a matching notification resolves the wait. No timeout
    /// is enforced here; bounding the wait is the surrounding job's
    /// concern.
    async fn await_notification(
        &self,
        state: &WaitState,
        subscription: &mut Subscription,
    ) -> Result<QualityGateOutcome, WaitError> {
        info!(task_id = %state.ce_task_id, "Waiting for quality server webhook");

        while let Some(notification) = subscription.rx.recv().await {
            if let Verdict::Resolved(outcome) =
                self.handle_notification(state, &notification).await?
            {
                return Ok(outcome);
            }
            // Non-terminal notification: keep waiting.
        }

        Err(WaitError::SubscriptionClosed {
            task_id: state.ce_task_id.clone(),
        })
    }

    // ------------------------------------------------------------------
    // Polling and interpretation
    // ------------------------------------------------------------------

    async fn poll_once(&self, state: &WaitState) -> Result<Verdict, WaitError> {
        let snapshot = self
            .server
            .task_status(&state.server_url, &state.ce_task_id)
            .await?;

        debug!(
            task_id = %state.ce_task_id,
            status = %snapshot.status,
            "Polled task status"
        );

        match snapshot.status {
            TaskStatus::Success => {
                let outcome = match snapshot.analysis_id.as_deref() {
                    Some(analysis_id) => {
                        self.server
                            .quality_gate_status(&state.server_url, analysis_id)
                            .await?
                    }
                    // Task succeeded but produced no analysis to gate.
                    None => QualityGateOutcome::None,
                };
                Ok(Verdict::Resolved(outcome))
            }
            TaskStatus::Failed | TaskStatus::Canceled => Err(WaitError::TaskFailed {
                task_id: state.ce_task_id.clone(),
                status: snapshot.status,
            }),
            TaskStatus::Pending | TaskStatus::InProgress => Ok(Verdict::Inconclusive),
        }
    }

    /// Verify a notification's authenticity, then interpret its status
    /// exactly like a poll result.
    async fn handle_notification(
        &self,
        state: &WaitState,
        notification: &WebhookNotification,
    ) -> Result<Verdict, WaitError> {
        self.verify_notification(state, notification).await?;

        match notification.task_status {
            TaskStatus::Success => {
                let outcome = notification
                    .quality_gate
                    .unwrap_or(QualityGateOutcome::None);
                Ok(Verdict::Resolved(outcome))
            }
            TaskStatus::Failed | TaskStatus::Canceled => Err(WaitError::TaskFailed {
                task_id: notification.task_id.clone(),
                status: notification.task_status,
            }),
            TaskStatus::Pending | TaskStatus::InProgress => Ok(Verdict::Inconclusive),
        }
    }

    async fn verify_notification(
        &self,
        state: &WaitState,
        notification: &WebhookNotification,
    ) -> Result<(), WaitError> {
        let Some(secret_id) = state.webhook_secret_id.as_deref() else {
            // Explicit weaker mode: with no secret configured for the
            // analysis, the notification is trusted unconditionally.
            debug!(
                task_id = %notification.task_id,
                "No webhook secret configured; accepting notification without verification"
            );
            return Ok(());
        };

        let secret = self
            .credentials
            .webhook_secret(secret_id)
            .await?
            .ok_or_else(|| WaitError::CredentialNotFound {
                credential_id: secret_id.to_string(),
            })?;

        let Some(received) = notification.received_signature.as_deref() else {
            warn!(
                task_id = %notification.task_id,
                "Webhook secret is configured but the notification carries no signature"
            );
            return Err(WaitError::SignatureVerificationFailed);
        };

        if !signature::is_valid(received, &notification.raw_payload, secret.expose()) {
            warn!(
                task_id = %notification.task_id,
                "Webhook signature does not match the configured webhook secret"
            );
            return Err(WaitError::SignatureVerificationFailed);
        }

        info!("The incoming webhook matched the configured webhook secret");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Resolution
    // ------------------------------------------------------------------

    async fn conclude(
        &self,
        run: &RunContext,
        state: &WaitState,
        result: Result<QualityGateOutcome, WaitError>,
    ) -> Result<QualityGateOutcome, WaitError> {
        let discard_state = match &result {
            Ok(_) => true,
            Err(e) => e.is_terminal_verdict(),
        };

        if discard_state {
            // The wait is settled; a later resume of this run should fail
            // fast instead of re-waiting. Removal failure must not mask
            // the verdict.
            if let Err(e) = self.store.remove(&run.run_id).await {
                warn!(run_id = %run.run_id, error = %e, "Failed to discard wait state");
            }
        }

        let outcome = result?;

        if state.abort_on_gate_failure && !outcome.passed() {
            warn!(
                run_id = %run.run_id,
                task_id = %state.ce_task_id,
                outcome = %outcome,
                "Quality gate did not pass"
            );
            return Err(WaitError::QualityGateFailed { outcome });
        }

        info!(
            run_id = %run.run_id,
            task_id = %state.ce_task_id,
            outcome = %outcome,
            "Quality gate wait resolved"
        );
        Ok(outcome)
    }
}

fn build_state(
    record: &AnalysisRecord,
    abort_on_gate_failure: bool,
) -> Result<WaitState, WaitError> {
    let task_id = record
        .ce_task_id
        .clone()
        .ok_or(WaitError::MissingAnalysis)?;

    if record.server_url.trim().is_empty() {
        return Err(WaitError::MissingServerUrl { task_id });
    }

    Ok(WaitState {
        version: WAIT_STATE_VERSION,
        ce_task_id: task_id,
        server_url: record.server_url.clone(),
        installation_name: record.installation_name.clone(),
        credential_id: record.credential_id.clone(),
        webhook_secret_id: record.webhook_secret_id.clone(),
        abort_on_gate_failure,
    })
}
