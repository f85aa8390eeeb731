//! TTL-bounded cache of resolved quality-gate statuses per analysis.
//!
//! One job run may reference several analyses, and UI surfaces ask for
//! their statuses in quick succession. This cache batches those bursts
//! into a single round of external calls: a combined result resolved
//! recently enough is returned unchanged, even if the run's analysis list
//! grew since it was populated. New analyses are only resolved once the
//! combined result falls out of its freshness window.
//!
//! Per-analysis entries follow a deliberately literal validity rule (see
//! [`is_entry_valid`]); its boundary behavior is pinned by tests and must
//! not be "fixed" without product-owner review.

use crate::{AnalysisRecord, QualityGateOutcome, RunContext, Timestamp};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

#[cfg(test)]
#[path = "status_cache_tests.rs"]
mod tests;

// ============================================================================
// Resolved Status
// ============================================================================

/// Quality-gate status of one analysis, as resolved against the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedStatus {
    pub installation_name: String,
    pub server_url: String,
    pub dashboard_url: Option<String>,
    pub task_id: Option<String>,

    /// Raw compute-engine status string as reported by the server, absent
    /// when the task could not be found.
    pub ce_status: Option<String>,

    /// Gate outcome, when the task completed successfully.
    pub quality_gate: Option<QualityGateOutcome>,
}

impl ResolvedStatus {
    /// Whether the underlying task has reached a terminal status.
    /// Comparison is case-insensitive; terminal results never go stale.
    pub fn is_terminal(&self) -> bool {
        self.ce_status.as_deref().is_some_and(|s| {
            s.eq_ignore_ascii_case("success")
                || s.eq_ignore_ascii_case("failed")
                || s.eq_ignore_ascii_case("canceled")
        })
    }
}

/// Resolves the current status of one analysis against the external
/// server. Returning `None` skips the analysis for this round; nothing is
/// cached for it.
pub trait StatusResolver: Send + Sync {
    fn resolve(
        &self,
        server_url: &str,
        dashboard_url: Option<&str>,
        task_id: Option<&str>,
        installation_name: &str,
        run: &RunContext,
    ) -> Option<ResolvedStatus>;
}

// ============================================================================
// Cache Entries
// ============================================================================

/// A cached resolution for one analysis tuple. Replaced, never mutated, on
/// re-resolution.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub status: ResolvedStatus,
    pub created_at: Timestamp,
}

/// Validity rule for a per-analysis entry.
///
/// A terminal entry is always valid. A non-terminal entry is valid only
/// when it was created **strictly after** `since`. The strictness is
/// intentional and pinned by tests: an entry created exactly at `since`
/// is invalid.
pub fn is_entry_valid(entry: &CacheEntry, since: Timestamp) -> bool {
    if entry.status.is_terminal() {
        return true;
    }
    entry.created_at > since
}

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
struct CacheKey {
    server_url: String,
    dashboard_url: Option<String>,
    task_id: Option<String>,
    installation_name: String,
}

impl CacheKey {
    fn for_record(record: &AnalysisRecord) -> Self {
        Self {
            server_url: record.server_url.clone(),
            dashboard_url: record.dashboard_url.clone(),
            task_id: record.ce_task_id.clone(),
            installation_name: record.installation_name.clone(),
        }
    }
}

struct BatchResult {
    statuses: Vec<ResolvedStatus>,
    created_at: Timestamp,
}

struct Inner {
    by_key: HashMap<CacheKey, CacheEntry>,
    last_batch: Option<BatchResult>,
}

// ============================================================================
// Cache
// ============================================================================

/// Per-run cache of resolved statuses.
///
/// Mutated only by whichever caller observes it invalid first; a redundant
/// re-resolution by a racing second caller is acceptable since resolution
/// is idempotent.
pub struct ProjectStatusCache {
    inner: Mutex<Inner>,
}

impl ProjectStatusCache {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                by_key: HashMap::new(),
                last_batch: None,
            }),
        }
    }

    /// Resolve the statuses of `analyses`, serving from cache where valid.
    ///
    /// `freshness_limit` bounds both the combined-result short-circuit and
    /// per-entry validity: the reference instant passed to
    /// [`is_entry_valid`] is `now - freshness_limit`.
    pub fn get(
        &self,
        resolver: &dyn StatusResolver,
        freshness_limit: Duration,
        analyses: &[AnalysisRecord],
        run: &RunContext,
    ) -> Vec<ResolvedStatus> {
        let now = Timestamp::now();
        let since = now.minus(freshness_limit);

        let mut inner = self.lock();

        // Fresh combined result: return it unchanged, even if the analysis
        // list grew since it was populated.
        if let Some(batch) = &inner.last_batch {
            if batch.created_at > since {
                debug!("Serving combined status result from cache");
                return batch.statuses.clone();
            }
        }

        let mut statuses = Vec::with_capacity(analyses.len());
        for record in analyses {
            let key = CacheKey::for_record(record);

            if let Some(entry) = inner.by_key.get(&key) {
                if is_entry_valid(entry, since) {
                    statuses.push(entry.status.clone());
                    continue;
                }
            }

            let resolved = resolver.resolve(
                &record.server_url,
                record.dashboard_url.as_deref(),
                record.ce_task_id.as_deref(),
                &record.installation_name,
                run,
            );

            if let Some(status) = resolved {
                inner.by_key.insert(
                    key,
                    CacheEntry {
                        status: status.clone(),
                        created_at: now,
                    },
                );
                statuses.push(status);
            }
        }

        inner.last_batch = Some(BatchResult {
            statuses: statuses.clone(),
            created_at: now,
        });
        statuses
    }

    /// Test affordance: force every age in the cache backward by `by`,
    /// instead of waiting out freshness windows on the wall clock.
    pub fn backdate(&self, by: Duration) {
        let mut inner = self.lock();
        if let Some(batch) = &mut inner.last_batch {
            batch.created_at = batch.created_at.minus(by);
        }
        for entry in inner.by_key.values_mut() {
            entry.created_at = entry.created_at.minus(by);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for ProjectStatusCache {
    fn default() -> Self {
        Self::new()
    }
}
