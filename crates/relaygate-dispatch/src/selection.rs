use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use rand::Rng;
use rand::seq::SliceRandom;
use relaygate_common::{BalancePolicy, GroupSelectionPolicy};
use relaygate_state::{Group, ProxyKey};

/// Rotating start-point for round-robin selection. One instance is kept
/// per proxy key (group ordering) and per group (key ordering) so
/// repeated requests fan out evenly instead of always starting at index
/// zero.
#[derive(Default)]
pub struct RoundRobinCursor(AtomicUsize);

impl RoundRobinCursor {
    pub fn new() -> Self {
        Self(AtomicUsize::new(0))
    }

    fn next_start(&self, len: usize) -> usize {
        if len == 0 {
            return 0;
        }
        self.0.fetch_add(1, Ordering::Relaxed) % len
    }
}

/// Picks one index out of `weights` via a single weighted draw,
/// uniform over all indices when every weight is zero.
fn pick_weighted_index(weights: &[u32]) -> usize {
    if weights.is_empty() {
        return 0;
    }
    let total: u64 = weights.iter().map(|w| *w as u64).sum();
    if total == 0 {
        return rand::rng().random_range(0..weights.len());
    }
    let mut roll = rand::rng().random_range(0..total);
    for (index, weight) in weights.iter().enumerate() {
        let weight = *weight as u64;
        if roll < weight {
            return index;
        }
        roll -= weight;
    }
    weights.len() - 1
}

/// Orders the groups a proxy key is permitted to use, according to the
/// key's `group_policy`. `Weighted` repeatedly draws without replacement
/// (grounded in the provider pool's weighted-draw pattern), so earlier
/// entries are more likely to lead but every candidate still appears.
pub fn order_groups(mut groups: Vec<Arc<Group>>, proxy_key: &ProxyKey, cursor: &RoundRobinCursor) -> Vec<Arc<Group>> {
    match proxy_key.group_policy {
        GroupSelectionPolicy::RoundRobin => {
            let start = cursor.next_start(groups.len());
            groups.rotate_left(start);
            groups
        }
        GroupSelectionPolicy::Random => {
            groups.shuffle(&mut rand::rng());
            groups
        }
        GroupSelectionPolicy::Failover => {
            groups.sort_by(|a, b| {
                proxy_key
                    .weight_of(b.id)
                    .cmp(&proxy_key.weight_of(a.id))
                    .then(a.id.cmp(&b.id))
            });
            groups
        }
        GroupSelectionPolicy::Weighted => {
            let mut remaining: Vec<(Arc<Group>, u32)> = groups
                .into_iter()
                .map(|g| {
                    let weight = proxy_key.weight_of(g.id);
                    (g, weight)
                })
                .collect();
            let mut ordered = Vec::with_capacity(remaining.len());
            while !remaining.is_empty() {
                let weights: Vec<u32> = remaining.iter().map(|(_, w)| *w).collect();
                let index = pick_weighted_index(&weights);
                let (group, _) = remaining.swap_remove(index);
                ordered.push(group);
            }
            ordered
        }
    }
}

/// Orders the keys within a single group, according to the group's
/// `balance_policy`. Keys carry no individual weight, so `Weighted` is
/// not a member of `BalancePolicy` (per-key balancing
/// is uniform-or-ordered, weighting only applies across groups).
pub fn order_keys(mut keys: Vec<String>, policy: BalancePolicy, cursor: &RoundRobinCursor) -> Vec<String> {
    match policy {
        BalancePolicy::RoundRobin => {
            let start = cursor.next_start(keys.len());
            keys.rotate_left(start);
            keys
        }
        BalancePolicy::Random => {
            keys.shuffle(&mut rand::rng());
            keys
        }
        BalancePolicy::Failover => keys,
    }
}
