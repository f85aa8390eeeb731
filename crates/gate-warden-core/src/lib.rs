//! # Gate Warden Core
//!
//! Core logic for the Gate Warden quality-gate wait subsystem.
//!
//! A CI job triggers an analysis on an external code-quality server, then
//! must learn asynchronously whether the analysis's quality gate passed
//! before the job may continue. This crate contains the pieces that make
//! that wait reliable:
//!
//! - [`signature`]: HMAC-SHA256 verification of inbound notifications
//! - [`correlation`]: short-lived task-id to notification cache
//! - [`receiver`]: webhook decode, storage, and listener dispatch
//! - [`status_cache`]: TTL-bounded cache of resolved gate statuses
//! - [`wait`]: the resumable wait state machine tying it all together
//! - [`persistence`]: explicit versioned wait-state storage
//!
//! ## Architecture
//!
//! Business logic depends only on trait abstractions; the HTTP client used
//! to reach the quality server ([`server::QualityServerClient`]) and the
//! credential lookup ([`credentials::CredentialResolver`]) are injected at
//! runtime. The webhook listener registry is an explicit component instance
//! shared between the HTTP endpoint and waiting steps, never process-global
//! state.

pub mod correlation;
pub mod credentials;
pub mod persistence;
pub mod receiver;
pub mod server;
pub mod signature;
pub mod status_cache;
pub mod wait;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;


// ============================================================================
// Timestamps
// ============================================================================

/// UTC timestamp used throughout the subsystem.
///
/// Wraps `chrono::DateTime<Utc>` so cache-validity rules can be tested with
/// explicit instants instead of wall-clock sleeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Create timestamp for the current moment.
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Parse timestamp from RFC3339 string.
    pub fn from_rfc3339(s: &str) -> Result<Self, ParseError> {
        let dt = DateTime::parse_from_rfc3339(s)
            .map_err(|_| ParseError::InvalidFormat {
                expected: "RFC3339 datetime".to_string(),
                actual: s.to_string(),
            })?
            .with_timezone(&Utc);
        Ok(Self(dt))
    }

    /// Convert to RFC3339 string.
    pub fn to_rfc3339(&self) -> String {
        self.0.to_rfc3339()
    }

    /// Get the underlying `DateTime`.
    pub fn as_datetime(&self) -> &DateTime<Utc> {
        &self.0
    }

    /// Subtract a duration from this timestamp.
    pub fn minus(&self, duration: Duration) -> Self {
        let chrono_duration = chrono::Duration::from_std(duration).unwrap_or_default();
        Self(self.0 - chrono_duration)
    }

    /// Add a duration to this timestamp.
    pub fn plus(&self, duration: Duration) -> Self {
        let chrono_duration = chrono::Duration::from_std(duration).unwrap_or_default();
        Self(self.0 + chrono_duration)
    }

    /// Elapsed time since `other`, saturating to zero when `other` is newer.
    pub fn duration_since(&self, other: Self) -> Duration {
        self.0
            .signed_duration_since(other.0)
            .to_std()
            .unwrap_or_default()
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

// ============================================================================
// Task and Quality Gate Status
// ============================================================================

/// Processing status of an analysis task on the quality server.
///
/// The server is the authoritative source; the status is observed either
/// via a poll response or a webhook notification payload. A task that has
/// reached a terminal status never transitions back to a non-terminal one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Success,
    Failed,
    Canceled,
}

impl TaskStatus {
    /// Whether the task has finished processing (successfully or not).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Canceled)
    }

    /// Get string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::InProgress => "IN_PROGRESS",
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
            Self::Canceled => "CANCELED",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(Self::Pending),
            "IN_PROGRESS" => Ok(Self::InProgress),
            "SUCCESS" => Ok(Self::Success),
            "FAILED" => Ok(Self::Failed),
            "CANCELED" => Ok(Self::Canceled),
            _ => Err(ParseError::InvalidFormat {
                expected: "PENDING, IN_PROGRESS, SUCCESS, FAILED, or CANCELED".to_string(),
                actual: s.to_string(),
            }),
        }
    }
}

/// Result of a quality-gate evaluation.
///
/// `None` means the task succeeded but no quality gate was evaluated for
/// the analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QualityGateOutcome {
    Ok,
    Warn,
    Error,
    None,
}

impl QualityGateOutcome {
    /// Whether the gate passed outright. `WARN` and `NONE` do not count as
    /// passing when a job is configured to abort on gate failure.
    pub fn passed(&self) -> bool {
        matches!(self, Self::Ok)
    }

    /// Get string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
            Self::None => "NONE",
        }
    }
}

impl fmt::Display for QualityGateOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for QualityGateOutcome {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "OK" => Ok(Self::Ok),
            "WARN" => Ok(Self::Warn),
            "ERROR" => Ok(Self::Error),
            "NONE" => Ok(Self::None),
            _ => Err(ParseError::InvalidFormat {
                expected: "OK, WARN, ERROR, or NONE".to_string(),
                actual: s.to_string(),
            }),
        }
    }
}

// ============================================================================
// Analysis Records
// ============================================================================

/// Metadata recorded when an analysis was launched on the quality server.
///
/// One job run may produce several records, one per analysis invocation.
/// Records are immutable once written; a newer analysis supersedes an older
/// one only by appearing earlier in the run's most-recent-first list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisRecord {
    /// Name of the configured server installation the analysis ran against.
    pub installation_name: String,

    /// Base URL of the quality server.
    pub server_url: String,

    /// Opaque id of the credential used for server API calls.
    pub credential_id: Option<String>,

    /// Opaque id of the credential holding the webhook secret.
    pub webhook_secret_id: Option<String>,

    /// Compute-engine task id returned when the analysis was submitted.
    /// Absent when the scanner did not report one.
    pub ce_task_id: Option<String>,

    /// Dashboard URL for the analyzed project.
    pub dashboard_url: Option<String>,
}

impl AnalysisRecord {
    /// Select the most recent record that carries a task id.
    ///
    /// `records` must be ordered most-recent-first, as the job run records
    /// them; the first record with a task id wins.
    pub fn latest_with_task(records: &[AnalysisRecord]) -> Option<&AnalysisRecord> {
        records.iter().find(|r| r.ce_task_id.is_some())
    }
}

/// Identity of the job run a wait or cache entry belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunContext {
    /// Unique id of the job run, used to key persisted wait state.
    pub run_id: String,

    /// When the run started.
    pub started_at: Timestamp,
}

impl RunContext {
    /// Create a run context starting now.
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            started_at: Timestamp::now(),
        }
    }
}

// ============================================================================
// Error Types
// ============================================================================

/// Error type for string parsing failures.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ParseError {
    #[error("Invalid format: expected {expected}, got '{actual}'")]
    InvalidFormat { expected: String, actual: String },
}
