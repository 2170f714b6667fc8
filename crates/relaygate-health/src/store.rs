use std::collections::HashMap;
use std::sync::RwLock;

use relaygate_common::GroupId;
use relaygate_state::{HealthAnalysis, HealthCheckResult, HealthCheckStats, HealthCheckType};

/// Caps how many raw observations are retained per (group, check-type,
/// subject) — results are append-only in spirit, but an unbounded history
/// would leak memory over a long-running process. Stats never truncate.
const MAX_RESULTS_PER_SUBJECT: usize = 64;

type SubjectKey = (GroupId, HealthCheckType, String);

/// In-memory home for health-scanner output: the append-only observation
/// log and its rolled-up counters. A `relaygate-storage` sink mirrors both
/// to durable tables; this store is what the scanner and any diagnostic
/// reader consult directly.
#[derive(Default)]
pub struct HealthStore {
    results: RwLock<HashMap<SubjectKey, Vec<HealthCheckResult>>>,
    stats: RwLock<HashMap<SubjectKey, HealthCheckStats>>,
    analysis: RwLock<HashMap<GroupId, HealthAnalysis>>,
}

impl HealthStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, result: HealthCheckResult) {
        let key = (result.group_id, result.check_type, result.subject.clone());
        {
            let mut stats = self.stats.write().unwrap();
            stats.entry(key.clone()).or_default().record(result.success, result.latency_ms);
        }
        let mut results = self.results.write().unwrap();
        let entry = results.entry(key).or_default();
        entry.push(result);
        if entry.len() > MAX_RESULTS_PER_SUBJECT {
            let overflow = entry.len() - MAX_RESULTS_PER_SUBJECT;
            entry.drain(0..overflow);
        }
    }

    pub fn stats_for(&self, group_id: GroupId, check_type: HealthCheckType, subject: &str) -> Option<HealthCheckStats> {
        self.stats
            .read()
            .unwrap()
            .get(&(group_id, check_type, subject.to_string()))
            .cloned()
    }

    pub fn recent_results(&self, group_id: GroupId, check_type: HealthCheckType, subject: &str) -> Vec<HealthCheckResult> {
        self.results
            .read()
            .unwrap()
            .get(&(group_id, check_type, subject.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    pub fn publish_analysis(&self, analysis: HealthAnalysis) {
        self.analysis.write().unwrap().insert(analysis.group_id, analysis);
    }

    pub fn analysis_for(&self, group_id: GroupId) -> Option<HealthAnalysis> {
        self.analysis.read().unwrap().get(&group_id).cloned()
    }

    /// Whether `check_type`'s subjects for `group_id` most recently
    /// succeeded, for folding into an analysis record. Returns `true`
    /// (vacuously healthy) when there's no observation yet — an
    /// unprobed axis shouldn't read as unhealthy.
    pub fn axis_healthy(&self, group_id: GroupId, check_type: HealthCheckType) -> bool {
        let stats = self.stats.read().unwrap();
        for ((gid, kind, _subject), s) in stats.iter() {
            if *gid == group_id && *kind == check_type && s.consecutive_failures > 0 {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::OffsetDateTime;

    fn result(group_id: GroupId, check_type: HealthCheckType, subject: &str, success: bool) -> HealthCheckResult {
        HealthCheckResult {
            group_id,
            check_type,
            subject: subject.to_string(),
            success,
            latency_ms: Some(10),
            message: None,
            observed_at: OffsetDateTime::now_utc(),
        }
    }

    #[test]
    fn recording_updates_both_results_and_stats() {
        let store = HealthStore::new();
        store.record(result(1, HealthCheckType::Provider, "g1", true));
        store.record(result(1, HealthCheckType::Provider, "g1", false));
        let stats = store.stats_for(1, HealthCheckType::Provider, "g1").unwrap();
        assert_eq!(stats.success_count, 1);
        assert_eq!(stats.failure_count, 1);
        assert_eq!(store.recent_results(1, HealthCheckType::Provider, "g1").len(), 2);
    }

    #[test]
    fn results_are_capped_per_subject() {
        let store = HealthStore::new();
        for _ in 0..(MAX_RESULTS_PER_SUBJECT + 10) {
            store.record(result(1, HealthCheckType::Key, "hash-a", true));
        }
        assert_eq!(store.recent_results(1, HealthCheckType::Key, "hash-a").len(), MAX_RESULTS_PER_SUBJECT);
    }

    #[test]
    fn axis_unhealthy_after_a_failure_until_a_success_resets_it() {
        let store = HealthStore::new();
        store.record(result(1, HealthCheckType::Key, "hash-a", false));
        assert!(!store.axis_healthy(1, HealthCheckType::Key));
        store.record(result(1, HealthCheckType::Key, "hash-a", true));
        assert!(store.axis_healthy(1, HealthCheckType::Key));
    }
}
