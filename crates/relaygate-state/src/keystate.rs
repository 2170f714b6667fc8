use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use relaygate_common::{GroupId, ProxyKeyId};
use time::OffsetDateTime;

use crate::model::{KeyUsage, KeyValidity, Validity};

const SHARD_COUNT: usize = 16;

/// Durability hook: mirrors validity/usage changes to persistent storage.
/// Implementations must be non-blocking (e.g. `try_send` into a bounded
/// channel) — the key-state store never awaits on this, matching the
/// dispatcher's "never wait on the log pipeline" rule.
pub trait KeyStateSink: Send + Sync {
    fn record_validity(&self, group_id: GroupId, key_hash: &str, validity: &KeyValidity);
    fn record_usage(&self, group_id: GroupId, key_hash: &str, usage: &KeyUsage);
}

/// Outcome of an RPM admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Ok,
    Rejected { retry_after_secs: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Subject {
    Key(GroupId, u64),
    ProxyKey(ProxyKeyId),
}

#[derive(Debug, Default)]
struct KeyCell {
    validity: KeyValidity,
    usage: KeyUsage,
}

#[derive(Debug, Default)]
struct RpmCell {
    minute: u64,
    count: u32,
}

fn current_minute() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
        / 60
}

fn shard_of(a: u64, b: u64) -> usize {
    let mixed = a.wrapping_mul(0x9E3779B97F4A7C15).wrapping_add(b);
    (mixed as usize) % SHARD_COUNT
}

fn fnv1a(s: &str) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in s.as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

/// Sharded, per-key-locked state for key validity, usage, and RPM
/// admission windows. No coarse global lock sits on the hot path
/// concurrency model.
pub struct KeyStateStore {
    key_shards: Vec<RwLock<HashMap<(GroupId, String), Arc<Mutex<KeyCell>>>>>,
    key_rpm_shards: Vec<RwLock<HashMap<(GroupId, String), Arc<Mutex<RpmCell>>>>>,
    proxy_rpm_shards: Vec<RwLock<HashMap<ProxyKeyId, Arc<Mutex<RpmCell>>>>>,
    sink: Option<Arc<dyn KeyStateSink>>,
}

impl KeyStateStore {
    pub fn new(sink: Option<Arc<dyn KeyStateSink>>) -> Self {
        Self {
            key_shards: (0..SHARD_COUNT).map(|_| RwLock::new(HashMap::new())).collect(),
            key_rpm_shards: (0..SHARD_COUNT).map(|_| RwLock::new(HashMap::new())).collect(),
            proxy_rpm_shards: (0..SHARD_COUNT).map(|_| RwLock::new(HashMap::new())).collect(),
            sink,
        }
    }

    fn key_cell(&self, group_id: GroupId, key_hash: &str) -> Arc<Mutex<KeyCell>> {
        let shard_idx = shard_of(group_id as u64, fnv1a(key_hash));
        let shard = &self.key_shards[shard_idx];
        if let Some(cell) = shard.read().unwrap().get(&(group_id, key_hash.to_string())) {
            return cell.clone();
        }
        let mut guard = shard.write().unwrap();
        guard
            .entry((group_id, key_hash.to_string()))
            .or_insert_with(|| Arc::new(Mutex::new(KeyCell::default())))
            .clone()
    }

    fn key_rpm_cell(&self, group_id: GroupId, key_hash: &str) -> Arc<Mutex<RpmCell>> {
        let shard_idx = shard_of(group_id as u64, fnv1a(key_hash));
        let shard = &self.key_rpm_shards[shard_idx];
        if let Some(cell) = shard.read().unwrap().get(&(group_id, key_hash.to_string())) {
            return cell.clone();
        }
        let mut guard = shard.write().unwrap();
        guard
            .entry((group_id, key_hash.to_string()))
            .or_insert_with(|| Arc::new(Mutex::new(RpmCell::default())))
            .clone()
    }

    fn proxy_rpm_cell(&self, proxy_key_id: ProxyKeyId) -> Arc<Mutex<RpmCell>> {
        let shard_idx = shard_of(proxy_key_id as u64, 0);
        let shard = &self.proxy_rpm_shards[shard_idx];
        if let Some(cell) = shard.read().unwrap().get(&proxy_key_id) {
            return cell.clone();
        }
        let mut guard = shard.write().unwrap();
        guard
            .entry(proxy_key_id)
            .or_insert_with(|| Arc::new(Mutex::new(RpmCell::default())))
            .clone()
    }

    /// Load a validity/usage row observed elsewhere (storage hydration on
    /// boot, or admin override) without going through `record_outcome`'s
    /// classification — used for restoring durable state after restart.
    pub fn hydrate(&self, group_id: GroupId, key_hash: &str, validity: KeyValidity, usage: KeyUsage) {
        let cell = self.key_cell(group_id, key_hash);
        let mut guard = cell.lock().unwrap();
        guard.validity = validity;
        guard.usage = usage;
    }

    pub fn validity(&self, group_id: GroupId, key_hash: &str) -> Validity {
        let cell = self.key_cell(group_id, key_hash);
        cell.lock().unwrap().validity.validity
    }

    /// Invariant: 401/403 ⇒ Invalid; 5xx leaves validity
    /// untouched; success ⇒ Valid and zeroes the error count.
    pub fn record_outcome(
        &self,
        group_id: GroupId,
        key_hash: &str,
        http_status: u16,
        error_body: Option<String>,
    ) {
        let cell = self.key_cell(group_id, key_hash);
        let snapshot = {
            let mut guard = cell.lock().unwrap();
            let v = &mut guard.validity;
            v.last_validated_at = Some(OffsetDateTime::now_utc());
            v.last_status = Some(http_status);
            match http_status {
                200..=299 => {
                    v.validity = Validity::Valid;
                    v.error_count = 0;
                    v.last_error = None;
                }
                401 | 403 => {
                    v.validity = Validity::Invalid;
                    v.error_count += 1;
                    v.last_error = error_body;
                }
                _ => {
                    // 5xx, 429, and other statuses: counters move, validity does not.
                    v.error_count += 1;
                    v.last_error = error_body;
                }
            }
            v.clone()
        };
        if let Some(sink) = &self.sink {
            sink.record_validity(group_id, key_hash, &snapshot);
        }
    }

    /// Admin override: bypasses validity inference entirely.
    pub fn force_status(&self, group_id: GroupId, key_hash: &str, valid: bool) {
        let cell = self.key_cell(group_id, key_hash);
        let snapshot = {
            let mut guard = cell.lock().unwrap();
            guard.validity.validity = if valid { Validity::Valid } else { Validity::Invalid };
            guard.validity.last_validated_at = Some(OffsetDateTime::now_utc());
            guard.validity.clone()
        };
        if let Some(sink) = &self.sink {
            sink.record_validity(group_id, key_hash, &snapshot);
        }
    }

    pub fn record_use(&self, group_id: GroupId, key_hash: &str) {
        let cell = self.key_cell(group_id, key_hash);
        let snapshot = {
            let mut guard = cell.lock().unwrap();
            guard.usage.total_uses += 1;
            guard.usage.last_used_at = Some(OffsetDateTime::now_utc());
            guard.usage.clone()
        };
        if let Some(sink) = &self.sink {
            sink.record_usage(group_id, key_hash, &snapshot);
        }
    }

    /// Sliding-window (per-UNIX-minute bucket) admission for a
    /// (group, keyHash) subject. `limit == 0` means unlimited.
    pub fn try_acquire_key_rpm(&self, group_id: GroupId, key_hash: &str, limit: u32) -> Admission {
        if limit == 0 {
            return Admission::Ok;
        }
        let cell = self.key_rpm_cell(group_id, key_hash);
        try_acquire(&cell, limit)
    }

    /// Same admission algorithm, keyed by proxy-key id instead.
    pub fn try_acquire_proxy_rpm(&self, proxy_key_id: ProxyKeyId, limit: u32) -> Admission {
        if limit == 0 {
            return Admission::Ok;
        }
        let cell = self.proxy_rpm_cell(proxy_key_id);
        try_acquire(&cell, limit)
    }
}

fn try_acquire(cell: &Arc<Mutex<RpmCell>>, limit: u32) -> Admission {
    let mut guard = cell.lock().unwrap();
    let minute = current_minute();
    if guard.minute != minute {
        guard.minute = minute;
        guard.count = 0;
    }
    if guard.count < limit {
        guard.count += 1;
        Admission::Ok
    } else {
        // Seconds remaining until the next minute bucket rolls over.
        let now_secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let retry_after_secs = 60 - (now_secs % 60);
        Admission::Rejected { retry_after_secs }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_sets_valid_and_zeroes_error_count() {
        let store = KeyStateStore::new(None);
        store.record_outcome(1, "hash-a", 500, Some("boom".into()));
        assert_eq!(store.validity(1, "hash-a"), Validity::Unknown);
        store.record_outcome(1, "hash-a", 200, None);
        assert_eq!(store.validity(1, "hash-a"), Validity::Valid);
    }

    #[test]
    fn unauthorized_marks_invalid_before_next_attempt() {
        let store = KeyStateStore::new(None);
        assert_eq!(store.validity(1, "hash-b"), Validity::Unknown);
        store.record_outcome(1, "hash-b", 401, Some("bad key".into()));
        assert_eq!(store.validity(1, "hash-b"), Validity::Invalid);
    }

    #[test]
    fn server_error_leaves_validity_untouched() {
        let store = KeyStateStore::new(None);
        store.record_outcome(1, "hash-c", 200, None);
        assert_eq!(store.validity(1, "hash-c"), Validity::Valid);
        store.record_outcome(1, "hash-c", 503, Some("unavailable".into()));
        assert_eq!(store.validity(1, "hash-c"), Validity::Valid);
    }

    #[test]
    fn rpm_admits_up_to_limit_then_rejects_within_the_same_minute() {
        let store = KeyStateStore::new(None);
        for _ in 0..5 {
            assert_eq!(store.try_acquire_key_rpm(1, "hash-d", 5), Admission::Ok);
        }
        match store.try_acquire_key_rpm(1, "hash-d", 5) {
            Admission::Rejected { retry_after_secs } => assert!(retry_after_secs <= 60),
            Admission::Ok => panic!("sixth request should have been rejected"),
        }
    }

    #[test]
    fn zero_limit_means_unlimited() {
        let store = KeyStateStore::new(None);
        for _ in 0..1000 {
            assert_eq!(store.try_acquire_key_rpm(1, "hash-e", 0), Admission::Ok);
        }
    }

    #[test]
    fn proxy_key_rpm_is_independent_of_upstream_key_rpm() {
        let store = KeyStateStore::new(None);
        assert_eq!(store.try_acquire_proxy_rpm(42, 1), Admission::Ok);
        assert_eq!(
            store.try_acquire_proxy_rpm(42, 1),
            Admission::Rejected { retry_after_secs: store_retry_hint() }
        );
        assert_eq!(store.try_acquire_key_rpm(1, "hash-f", 1), Admission::Ok);
    }

    fn store_retry_hint() -> u64 {
        let now_secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        60 - (now_secs % 60)
    }
}
