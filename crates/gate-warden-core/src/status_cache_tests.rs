//! Tests for the project status cache.
//!
//! The `is_entry_valid` boundary cases are pinned literally; the strict
//! comparison at exact boundaries is observed behavior, not an accident to
//! be smoothed over.

use super::*;
use crate::RunContext;
use std::sync::Mutex as StdMutex;

const TEN_MINUTES: Duration = Duration::from_secs(600);
const TWENTY_MINUTES: Duration = Duration::from_secs(1200);

fn status(installation: &str, task_id: &str, ce_status: Option<&str>) -> ResolvedStatus {
    ResolvedStatus {
        installation_name: installation.to_string(),
        server_url: "https://quality.example.com".to_string(),
        dashboard_url: Some(format!("https://quality.example.com/dashboard?id={installation}")),
        task_id: Some(task_id.to_string()),
        ce_status: ce_status.map(String::from),
        quality_gate: None,
    }
}

fn entry(created_at: Timestamp, ce_status: Option<&str>) -> CacheEntry {
    CacheEntry {
        status: status("default", "AYx-1", ce_status),
        created_at,
    }
}

fn record(installation: &str, task_id: &str) -> crate::AnalysisRecord {
    crate::AnalysisRecord {
        installation_name: installation.to_string(),
        server_url: "https://quality.example.com".to_string(),
        credential_id: None,
        webhook_secret_id: None,
        ce_task_id: Some(task_id.to_string()),
        dashboard_url: Some(format!("https://quality.example.com/dashboard?id={installation}")),
    }
}

/// Resolver that counts calls and answers from a scripted map keyed by
/// installation name.
struct ScriptedResolver {
    answers: StdMutex<std::collections::HashMap<String, ResolvedStatus>>,
    calls: StdMutex<Vec<String>>,
}

impl ScriptedResolver {
    fn new(answers: Vec<ResolvedStatus>) -> Self {
        Self {
            answers: StdMutex::new(
                answers
                    .into_iter()
                    .map(|s| (s.installation_name.clone(), s))
                    .collect(),
            ),
            calls: StdMutex::new(Vec::new()),
        }
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl StatusResolver for ScriptedResolver {
    fn resolve(
        &self,
        _server_url: &str,
        _dashboard_url: Option<&str>,
        _task_id: Option<&str>,
        installation_name: &str,
        _run: &RunContext,
    ) -> Option<ResolvedStatus> {
        self.calls.lock().unwrap().push(installation_name.to_string());
        self.answers.lock().unwrap().get(installation_name).cloned()
    }
}

mod entry_validity_tests {
    use super::*;

    /// Literal boundary table from observed behavior. `since` is the
    /// reference instant; only strictly-newer non-terminal entries are
    /// valid.
    #[test]
    fn test_boundary_cases() {
        let now = Timestamp::now();

        assert!(!is_entry_valid(&entry(now, None), now));
        assert!(is_entry_valid(&entry(now, None), now.minus(TEN_MINUTES)));
        assert!(is_entry_valid(
            &entry(now.minus(TEN_MINUTES), None),
            now.minus(TWENTY_MINUTES)
        ));
        assert!(!is_entry_valid(
            &entry(now.minus(TEN_MINUTES), None),
            now.minus(TEN_MINUTES)
        ));
        assert!(!is_entry_valid(&entry(now.minus(TEN_MINUTES), None), now));
    }

    /// Terminal results never go stale, whatever the reference instant.
    #[test]
    fn test_terminal_entries_are_always_valid() {
        let now = Timestamp::now();
        for ce_status in ["success", "FAILED", "Canceled"] {
            let e = entry(now.minus(TWENTY_MINUTES), Some(ce_status));
            assert!(is_entry_valid(&e, now), "terminal '{ce_status}' must stay valid");
            assert!(is_entry_valid(&e, now.minus(TEN_MINUTES)));
            assert!(is_entry_valid(&e, now.plus(TEN_MINUTES)));
        }
    }

    #[test]
    fn test_pending_status_is_not_terminal() {
        let now = Timestamp::now();
        let e = entry(now.minus(TEN_MINUTES), Some("pending"));
        assert!(!is_entry_valid(&e, now));
    }
}

mod batching_tests {
    use super::*;

    const FRESHNESS: Duration = Duration::from_secs(40);

    /// A second burst query within the freshness window returns the first
    /// combined result unchanged, even though the analysis list grew.
    #[test]
    fn test_fresh_batch_is_returned_unchanged_when_list_grows() {
        let cache = ProjectStatusCache::new();
        let run = RunContext::new("run-1");
        let resolver = ScriptedResolver::new(vec![
            status("a1", "AYx-1", Some("success")),
            status("a2", "AYx-2", Some("error")),
        ]);

        let first = cache.get(&resolver, FRESHNESS, &[record("a1", "AYx-1")], &run);
        assert_eq!(first.len(), 1);
        assert_eq!(resolver.calls(), vec!["a1"]);

        let second = cache.get(
            &resolver,
            FRESHNESS,
            &[record("a1", "AYx-1"), record("a2", "AYx-2")],
            &run,
        );
        assert_eq!(second, first, "fresh combined result must be unchanged");
        assert_eq!(resolver.calls(), vec!["a1"], "no external call for the burst");
    }

    /// Once the combined result ages out, new analyses are resolved while
    /// terminal per-entry results are reused without an external call.
    #[test]
    fn test_stale_batch_resolves_new_analyses_and_reuses_terminal_entries() {
        let cache = ProjectStatusCache::new();
        let run = RunContext::new("run-1");
        let resolver = ScriptedResolver::new(vec![
            status("a1", "AYx-1", Some("success")),
            status("a2", "AYx-2", Some("error")),
        ]);

        cache.get(&resolver, FRESHNESS, &[record("a1", "AYx-1")], &run);
        cache.backdate(FRESHNESS + Duration::from_secs(1));

        let result = cache.get(
            &resolver,
            FRESHNESS,
            &[record("a1", "AYx-1"), record("a2", "AYx-2")],
            &run,
        );

        assert_eq!(result.len(), 2);
        assert_eq!(result[0].ce_status.as_deref(), Some("success"));
        assert_eq!(result[1].ce_status.as_deref(), Some("error"));
        // a1 was terminal, so only a2 went to the server.
        assert_eq!(resolver.calls(), vec!["a1", "a2"]);
    }

    /// Non-terminal entries are re-resolved once stale; the replacement is
    /// a new entry, not a mutation of the old one.
    #[test]
    fn test_stale_nonterminal_entry_is_replaced() {
        let cache = ProjectStatusCache::new();
        let run = RunContext::new("run-1");

        let pending = ScriptedResolver::new(vec![status("a1", "AYx-1", Some("pending"))]);
        let first = cache.get(&pending, FRESHNESS, &[record("a1", "AYx-1")], &run);
        assert_eq!(first[0].ce_status.as_deref(), Some("pending"));

        cache.backdate(FRESHNESS + Duration::from_secs(1));

        let finished = ScriptedResolver::new(vec![status("a1", "AYx-1", Some("success"))]);
        let second = cache.get(&finished, FRESHNESS, &[record("a1", "AYx-1")], &run);
        assert_eq!(second[0].ce_status.as_deref(), Some("success"));
        assert_eq!(finished.calls(), vec!["a1"]);
    }

    /// A resolver returning None skips the analysis without caching.
    #[test]
    fn test_unresolvable_analysis_is_skipped() {
        let cache = ProjectStatusCache::new();
        let run = RunContext::new("run-1");
        let resolver = ScriptedResolver::new(vec![]);

        let result = cache.get(&resolver, FRESHNESS, &[record("a1", "AYx-1")], &run);
        assert!(result.is_empty());
        assert_eq!(resolver.calls(), vec!["a1"]);

        // Still attempted on the next stale round; nothing negative-cached.
        cache.backdate(FRESHNESS + Duration::from_secs(1));
        cache.get(&resolver, FRESHNESS, &[record("a1", "AYx-1")], &run);
        assert_eq!(resolver.calls(), vec!["a1", "a1"]);
    }
}
