use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use relaygate_common::{GroupId, ProxyKeyId};

use crate::model::{Group, ProxyKey};

/// Immutable view of current routing configuration: for each enabled
/// group, its config, plus O(1) lookups by id and by proxy key. Live-key
/// filtering (validity-aware) happens at selection time against
/// `KeyStateStore`, not here — a snapshot only filters on
/// `enabled ∧ ¬deleted`.
#[derive(Debug, Default)]
pub struct Snapshot {
    groups_by_id: HashMap<GroupId, Arc<Group>>,
    proxy_keys_by_token: HashMap<String, Arc<ProxyKey>>,
    proxy_keys_by_id: HashMap<ProxyKeyId, Arc<ProxyKey>>,
}

impl Snapshot {
    pub fn build(groups: Vec<Group>, proxy_keys: Vec<ProxyKey>) -> Self {
        let groups_by_id = groups
            .into_iter()
            .filter(|g| g.is_routable())
            .map(|g| (g.id, Arc::new(g)))
            .collect();
        let proxy_keys: Vec<Arc<ProxyKey>> = proxy_keys.into_iter().map(Arc::new).collect();
        let proxy_keys_by_token = proxy_keys
            .iter()
            .map(|k| (k.token.clone(), k.clone()))
            .collect();
        let proxy_keys_by_id = proxy_keys.iter().map(|k| (k.id, k.clone())).collect();
        Self {
            groups_by_id,
            proxy_keys_by_token,
            proxy_keys_by_id,
        }
    }

    pub fn group_by_id(&self, id: GroupId) -> Option<&Arc<Group>> {
        self.groups_by_id.get(&id)
    }

    pub fn proxy_key_by_token(&self, token: &str) -> Option<&Arc<ProxyKey>> {
        self.proxy_keys_by_token.get(token)
    }

    pub fn proxy_key_by_id(&self, id: ProxyKeyId) -> Option<&Arc<ProxyKey>> {
        self.proxy_keys_by_id.get(&id)
    }

    /// Candidate groups permitted by `proxy_key` (empty permit set ⇒ all
    /// enabled groups), in arbitrary (id) order — ordering by policy is
    /// the dispatcher's job, not the snapshot's.
    pub fn groups_for(&self, proxy_key: &ProxyKey) -> Vec<Arc<Group>> {
        self.groups_by_id
            .values()
            .filter(|g| proxy_key.permits(g.id))
            .cloned()
            .collect()
    }

    pub fn keys_of(&self, group_id: GroupId) -> &[String] {
        self.groups_by_id
            .get(&group_id)
            .map(|g| g.keys.as_slice())
            .unwrap_or(&[])
    }

    pub fn all_groups(&self) -> impl Iterator<Item = &Arc<Group>> {
        self.groups_by_id.values()
    }
}

/// Copy-on-publish holder for the current `Snapshot`. Publishing a new
/// snapshot never affects requests already reading the old one — each
/// holds its own `Arc` for the lifetime of the call.
#[derive(Default)]
pub struct SnapshotPublisher {
    current: ArcSwap<Snapshot>,
}

impl SnapshotPublisher {
    pub fn new(initial: Snapshot) -> Self {
        Self {
            current: ArcSwap::from_pointee(initial),
        }
    }

    pub fn current(&self) -> Arc<Snapshot> {
        self.current.load_full()
    }

    pub fn publish(&self, next: Snapshot) {
        self.current.store(Arc::new(next));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relaygate_common::{BalancePolicy, GroupSelectionPolicy, ProviderKind};
    use std::time::Duration;

    fn group(id: GroupId, enabled: bool) -> Group {
        Group {
            id,
            identifier: format!("g{id}"),
            provider_kind: ProviderKind::OpenAI,
            base_url: "https://api.openai.com".into(),
            keys: vec![],
            models: vec!["gpt-4o".into()],
            aliases: Default::default(),
            balance_policy: BalancePolicy::RoundRobin,
            retry_count: 1,
            connect_timeout: Duration::from_secs(5),
            response_timeout: Duration::from_secs(30),
            rpm_limit: 0,
            test_model: None,
            forward_proxy: None,
            param_overrides: None,
            custom_headers: vec![],
            fake_streaming: false,
            enabled,
            priority: 0,
            deleted_at: None,
        }
    }

    fn proxy_key(permitted: Vec<GroupId>) -> ProxyKey {
        ProxyKey {
            id: 1,
            token: "pk-1".into(),
            name: "test".into(),
            permitted_groups: permitted,
            group_policy: GroupSelectionPolicy::RoundRobin,
            group_weights: Default::default(),
            rpm_limit: 0,
            enabled: true,
        }
    }

    #[test]
    fn disabled_groups_are_excluded_from_the_snapshot() {
        let snap = Snapshot::build(vec![group(1, true), group(2, false)], vec![]);
        assert!(snap.group_by_id(1).is_some());
        assert!(snap.group_by_id(2).is_none());
    }

    #[test]
    fn empty_permit_set_means_all_enabled_groups() {
        let snap = Snapshot::build(vec![group(1, true), group(2, true)], vec![proxy_key(vec![])]);
        let pk = snap.proxy_key_by_token("pk-1").unwrap();
        assert_eq!(snap.groups_for(pk).len(), 2);
    }

    #[test]
    fn nonempty_permit_set_restricts_candidates() {
        let snap = Snapshot::build(
            vec![group(1, true), group(2, true)],
            vec![proxy_key(vec![1])],
        );
        let pk = snap.proxy_key_by_token("pk-1").unwrap();
        let candidates = snap.groups_for(pk);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].id, 1);
    }

    #[test]
    fn publish_does_not_disturb_a_previously_loaded_snapshot() {
        let publisher = SnapshotPublisher::new(Snapshot::build(vec![group(1, true)], vec![]));
        let old = publisher.current();
        assert!(old.group_by_id(1).is_some());
        publisher.publish(Snapshot::build(vec![group(2, true)], vec![]));
        // `old` still reflects the snapshot in effect when it was loaded.
        assert!(old.group_by_id(1).is_some());
        assert!(old.group_by_id(2).is_none());
        assert!(publisher.current().group_by_id(2).is_some());
    }
}
