//! Collaborator seam for the quality server's REST API.
//!
//! The actual HTTP client is injected at runtime; the wait subsystem only
//! depends on these two synchronous-per-call operations. No automatic
//! retry loop exists here; a failed poll surfaces as an error, and the
//! only re-poll happens when a suspended step is resumed.

use crate::{QualityGateOutcome, TaskStatus};
use async_trait::async_trait;

/// Snapshot of a compute-engine task, as returned by a status poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSnapshot {
    pub task_id: String,
    pub status: TaskStatus,

    /// Id of the produced analysis; present once the task has succeeded
    /// and an analysis report was persisted.
    pub analysis_id: Option<String>,
}

/// Error raised by quality-server API calls.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Request to quality server at '{server_url}' failed: {message}")]
    Request { server_url: String, message: String },

    #[error("Quality server returned an unexpected response: {message}")]
    UnexpectedResponse { message: String },

    #[error("Quality server task '{task_id}' was not found")]
    TaskNotFound { task_id: String },
}

/// Client for the external quality server's REST API.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait QualityServerClient: Send + Sync {
    /// Fetch the current status of a compute-engine task.
    async fn task_status(
        &self,
        server_url: &str,
        task_id: &str,
    ) -> Result<TaskSnapshot, ServerError>;

    /// Fetch the quality-gate outcome of a finished analysis.
    async fn quality_gate_status(
        &self,
        server_url: &str,
        analysis_id: &str,
    ) -> Result<QualityGateOutcome, ServerError>;
}
