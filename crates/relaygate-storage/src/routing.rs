use std::sync::Arc;
use std::time::Duration;

use relaygate_state::{KeyStateStore, Snapshot, SnapshotPublisher};
use tokio::time::MissedTickBehavior;

use crate::storage::{Storage, StorageResult};

/// Loads the current routing rows and publishes a fresh `Snapshot`. Used
/// both for the initial load and for each poll tick.
pub async fn load_and_publish(storage: &Storage, publisher: &SnapshotPublisher) -> StorageResult<()> {
    let (groups, proxy_keys) = storage.load_routing_rows().await?;
    publisher.publish(Snapshot::build(groups, proxy_keys));
    Ok(())
}

/// Replays every persisted key-validity/usage row into a freshly built
/// `KeyStateStore`, so restart doesn't forget which keys were already
/// known bad.
pub async fn hydrate_key_state(storage: &Storage, store: &KeyStateStore) -> StorageResult<()> {
    for (group_id, key_hash, validity) in storage.load_key_validity().await? {
        store.hydrate(group_id, &key_hash, validity, relaygate_state::KeyUsage::default());
    }
    for (group_id, key_hash, usage) in storage.load_key_usage().await? {
        let validity = relaygate_state::KeyValidity {
            validity: store.validity(group_id, &key_hash),
            ..Default::default()
        };
        store.hydrate(group_id, &key_hash, validity, usage);
    }
    Ok(())
}

/// Background poller standing in for config hot-reload: re-reads
/// `groups`/`proxy_keys` on a fixed interval and republishes. Grounded in
/// the teacher's `ConfigEvent::ReplaceSnapshot` model, generalized from
/// push-on-write to pull-on-interval since relaygate has no admin-write
/// path of its own.
pub fn spawn_snapshot_poller(storage: Storage, publisher: Arc<SnapshotPublisher>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = load_and_publish(&storage, &publisher).await {
                tracing::warn!(error = %err, "routing snapshot poll failed, keeping previous snapshot");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;
    use relaygate_common::{BalancePolicy, GroupSelectionPolicy, ProviderKind};
    use relaygate_state::{Group, ProxyKey};
    use std::collections::HashMap;

    fn group(id: i64) -> Group {
        Group {
            id,
            identifier: format!("g{id}"),
            provider_kind: ProviderKind::OpenAI,
            base_url: "https://api.openai.com".into(),
            keys: vec!["sk-a".into()],
            models: vec!["gpt-4o".into()],
            aliases: HashMap::new(),
            balance_policy: BalancePolicy::RoundRobin,
            retry_count: 2,
            connect_timeout: Duration::from_secs(5),
            response_timeout: Duration::from_secs(30),
            rpm_limit: 0,
            test_model: None,
            forward_proxy: None,
            param_overrides: None,
            custom_headers: vec![],
            fake_streaming: false,
            enabled: true,
            priority: 0,
            deleted_at: None,
        }
    }

    fn proxy_key(id: i64) -> ProxyKey {
        ProxyKey {
            id,
            token: format!("pk-{id}"),
            name: "k".into(),
            permitted_groups: vec![],
            group_policy: GroupSelectionPolicy::RoundRobin,
            group_weights: HashMap::new(),
            rpm_limit: 0,
            enabled: true,
        }
    }

    // Bypasses `Storage::connect`'s shared-cache DSN lookup (see
    // `sinks::tests::test_storage`) so this test gets its own database.
    async fn isolated_storage() -> Storage {
        let db = sea_orm::Database::connect("sqlite::memory:").await.unwrap();
        Storage::from_connection(db)
    }

    #[tokio::test]
    async fn seeding_then_loading_round_trips_through_sqlite() {
        let storage = isolated_storage().await;
        storage.sync().await.unwrap();
        storage.seed_if_empty(&[group(1)], &[proxy_key(1)]).await.unwrap();

        let publisher = SnapshotPublisher::default();
        load_and_publish(&storage, &publisher).await.unwrap();
        let snap = publisher.current();
        assert!(snap.group_by_id(1).is_some());
        assert!(snap.proxy_key_by_token("pk-1").is_some());
    }

    #[tokio::test]
    async fn reseeding_does_not_duplicate_existing_rows() {
        let storage = isolated_storage().await;
        storage.sync().await.unwrap();
        storage.seed_if_empty(&[group(1)], &[proxy_key(1)]).await.unwrap();
        storage.seed_if_empty(&[group(2)], &[proxy_key(2)]).await.unwrap();

        let (groups, proxy_keys) = storage.load_routing_rows().await.unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(proxy_keys.len(), 1);
        assert_eq!(groups[0].id, 1);
    }
}
