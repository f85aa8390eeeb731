//! Durable storage for suspended waits.
//!
//! A waiting step does not hold a thread; what survives a process restart
//! is an explicit, versioned [`WaitState`] struct written here under the
//! run id. On restart the host reloads the state and calls
//! [`crate::wait::QualityGateWaitStep::resume`].

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use async_trait::async_trait;
use tracing::debug;

#[cfg(test)]
#[path = "persistence_tests.rs"]
mod tests;

/// Current on-disk format version. Bump when [`WaitState`] changes shape.
pub const WAIT_STATE_VERSION: u32 = 1;

// ============================================================================
// Wait State
// ============================================================================

/// Everything a suspended quality-gate wait needs to be resumed after a
/// process restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitState {
    /// Format version, checked on load.
    pub version: u32,

    /// Compute-engine task id being waited for.
    pub ce_task_id: String,

    /// Base URL of the quality server.
    pub server_url: String,

    /// Configured server installation name.
    pub installation_name: String,

    /// Credential id for server API calls.
    pub credential_id: Option<String>,

    /// Credential id holding the webhook secret; absent means signature
    /// verification is skipped.
    pub webhook_secret_id: Option<String>,

    /// Whether a non-passing gate outcome fails the job.
    pub abort_on_gate_failure: bool,
}

// ============================================================================
// Store Trait
// ============================================================================

/// Error raised by wait-state storage.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("Run id '{run_id}' is not a valid storage key")]
    InvalidRunId { run_id: String },

    #[error("Wait state I/O failed for '{path}': {message}")]
    Io { path: String, message: String },

    #[error("Wait state for run '{run_id}' could not be decoded: {message}")]
    Decode { run_id: String, message: String },
}

/// Durable store for [`WaitState`], keyed by run id.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WaitStateStore: Send + Sync {
    async fn save(&self, run_id: &str, state: &WaitState) -> Result<(), PersistenceError>;

    async fn load(&self, run_id: &str) -> Result<Option<WaitState>, PersistenceError>;

    async fn remove(&self, run_id: &str) -> Result<(), PersistenceError>;
}

// ============================================================================
// File-backed Store
// ============================================================================

/// Stores each run's wait state as a JSON file under a root directory.
///
/// Writes go to a temp file first and are renamed into place, so a crash
/// mid-write never leaves a truncated state file behind.
#[derive(Debug)]
pub struct FileWaitStateStore {
    root: PathBuf,
}

impl FileWaitStateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, run_id: &str) -> Result<PathBuf, PersistenceError> {
        validate_run_id(run_id)?;
        Ok(self.root.join(format!("{run_id}.json")))
    }

    /// Run ids with persisted wait state, for resuming after a restart.
    /// A missing root directory means no waits were ever persisted.
    pub async fn pending_runs(&self) -> Result<Vec<String>, PersistenceError> {
        let mut dir = match tokio::fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error(&self.root, e)),
        };

        let mut runs = Vec::new();
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| io_error(&self.root, e))?
        {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(run_id) = name.strip_suffix(".json") {
                if validate_run_id(run_id).is_ok() {
                    runs.push(run_id.to_string());
                }
            }
        }
        runs.sort();
        Ok(runs)
    }
}

fn validate_run_id(run_id: &str) -> Result<(), PersistenceError> {
    let acceptable = !run_id.is_empty()
        && run_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && run_id != "."
        && run_id != "..";
    if acceptable {
        Ok(())
    } else {
        Err(PersistenceError::InvalidRunId {
            run_id: run_id.to_string(),
        })
    }
}

fn io_error(path: &std::path::Path, e: std::io::Error) -> PersistenceError {
    PersistenceError::Io {
        path: path.display().to_string(),
        message: e.to_string(),
    }
}

#[async_trait]
impl WaitStateStore for FileWaitStateStore {
    async fn save(&self, run_id: &str, state: &WaitState) -> Result<(), PersistenceError> {
        let path = self.path_for(run_id)?;
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| io_error(&self.root, e))?;

        let json = serde_json::to_vec_pretty(state).map_err(|e| PersistenceError::Decode {
            run_id: run_id.to_string(),
            message: e.to_string(),
        })?;

        let tmp = self.root.join(format!("{run_id}.json.tmp"));
        tokio::fs::write(&tmp, &json)
            .await
            .map_err(|e| io_error(&tmp, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| io_error(&path, e))?;

        debug!(run_id, path = %path.display(), "Persisted wait state");
        Ok(())
    }

    async fn load(&self, run_id: &str) -> Result<Option<WaitState>, PersistenceError> {
        let path = self.path_for(run_id)?;
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error(&path, e)),
        };

        let state = serde_json::from_slice(&bytes).map_err(|e| PersistenceError::Decode {
            run_id: run_id.to_string(),
            message: e.to_string(),
        })?;
        Ok(Some(state))
    }

    async fn remove(&self, run_id: &str) -> Result<(), PersistenceError> {
        let path = self.path_for(run_id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(&path, e)),
        }
    }
}

// ============================================================================
// In-memory Store
// ============================================================================

/// Map-backed store for tests and restart simulations.
#[derive(Debug, Default)]
pub struct InMemoryWaitStateStore {
    states: Mutex<HashMap<String, WaitState>>,
}

impl InMemoryWaitStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WaitStateStore for InMemoryWaitStateStore {
    async fn save(&self, run_id: &str, state: &WaitState) -> Result<(), PersistenceError> {
        validate_run_id(run_id)?;
        self.states
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(run_id.to_string(), state.clone());
        Ok(())
    }

    async fn load(&self, run_id: &str) -> Result<Option<WaitState>, PersistenceError> {
        validate_run_id(run_id)?;
        Ok(self
            .states
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(run_id)
            .cloned())
    }

    async fn remove(&self, run_id: &str) -> Result<(), PersistenceError> {
        validate_run_id(run_id)?;
        self.states
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(run_id);
        Ok(())
    }
}
