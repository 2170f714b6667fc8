use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use bytes::Bytes;
use http_body_util::BodyExt;
use relaygate_common::{BalancePolicy, GroupSelectionPolicy, ProviderKind};
use relaygate_dispatch::{
    Dispatcher, HttpMethod, UpstreamBody, UpstreamClient, UpstreamFailure, UpstreamHttpRequest,
    UpstreamHttpResponse,
};
use relaygate_log::{LogEvent, LogPipeline, LogPipelineConfig, LogSink};
use relaygate_router::{AppState, RouterConfig, build_router};
use relaygate_state::{Group, KeyStateStore, ProxyKey, Snapshot, SnapshotPublisher};
use tower::ServiceExt;

struct NullLogSink;

#[async_trait::async_trait]
impl LogSink for NullLogSink {
    async fn write_batch(&self, _batch: &[LogEvent]) -> Result<(), String> {
        Ok(())
    }
}

struct ScriptedClient {
    status: u16,
    body: &'static [u8],
}

impl UpstreamClient for ScriptedClient {
    fn send<'a>(
        &'a self,
        _req: UpstreamHttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamHttpResponse, UpstreamFailure>> + Send + 'a>> {
        let status = self.status;
        let body = self.body;
        Box::pin(async move {
            Ok(UpstreamHttpResponse {
                status,
                headers: vec![("content-type".into(), "application/json".into())],
                body: UpstreamBody::Bytes(Bytes::from_static(body)),
            })
        })
    }
}

/// Returns one scripted `(status, body)` response per call, by call index,
/// and records which base URL each call landed on so a test can tell which
/// group actually served each attempt.
struct SequencedClient {
    responses: Vec<(u16, &'static [u8])>,
    urls: std::sync::Mutex<Vec<String>>,
}

impl SequencedClient {
    fn new(responses: Vec<(u16, &'static [u8])>) -> Self {
        Self { responses, urls: std::sync::Mutex::new(Vec::new()) }
    }
}

impl UpstreamClient for SequencedClient {
    fn send<'a>(
        &'a self,
        req: UpstreamHttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamHttpResponse, UpstreamFailure>> + Send + 'a>> {
        Box::pin(async move {
            let index = {
                let mut urls = self.urls.lock().unwrap();
                urls.push(req.url.clone());
                urls.len() - 1
            };
            let (status, body) = self.responses[index.min(self.responses.len() - 1)];
            Ok(UpstreamHttpResponse {
                status,
                headers: vec![("content-type".into(), "application/json".into())],
                body: UpstreamBody::Bytes(Bytes::from_static(body)),
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
        keys: vec!["sk-test".into()],
        models: vec!["gpt-4o".into()],
        aliases: HashMap::new(),
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
        enabled: true,
        priority: 0,
        deleted_at: None,
    }
}

fn proxy_key() -> ProxyKey {
    ProxyKey {
        id: 1,
        token: "pk-live-123".into(),
        name: "test key".into(),
        permitted_groups: vec![],
        group_policy: GroupSelectionPolicy::RoundRobin,
        group_weights: HashMap::new(),
        rpm_limit: 0,
        enabled: true,
    }
}

fn app(client: Arc<dyn UpstreamClient>) -> axum::Router {
    app_with(vec![group()], proxy_key(), client)
}

fn app_with(groups: Vec<Group>, key: ProxyKey, client: Arc<dyn UpstreamClient>) -> axum::Router {
    let snapshot = Arc::new(SnapshotPublisher::new(Snapshot::build(groups, vec![key])));
    let key_state = Arc::new(KeyStateStore::new(None));
    let log = Arc::new(LogPipeline::spawn(Arc::new(NullLogSink), LogPipelineConfig::default()));
    let dispatcher = Arc::new(Dispatcher::new(snapshot.clone(), key_state, log, client));
    let state = AppState { dispatcher, snapshot, config: RouterConfig::default() };
    build_router(state)
}

#[tokio::test]
async fn missing_proxy_key_is_rejected_before_dispatch() {
    let client: Arc<dyn UpstreamClient> = Arc::new(ScriptedClient { status: 200, body: b"{}" });
    let req = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("content-type", "application/json")
        .body(Body::from(r#"{"model":"gpt-4o","messages":[]}"#))
        .unwrap();
    let resp = app(client).oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn authenticated_chat_completion_round_trips_the_upstream_body() {
    let client: Arc<dyn UpstreamClient> =
        Arc::new(ScriptedClient { status: 200, body: br#"{"id":"chatcmpl-1","choices":[]}"# });
    let req = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("authorization", "Bearer pk-live-123")
        .header("content-type", "application/json")
        .body(Body::from(r#"{"model":"gpt-4o","messages":[]}"#))
        .unwrap();
    let resp = app(client).oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], br#"{"id":"chatcmpl-1","choices":[]}"#);
}

#[tokio::test]
async fn unrouted_model_surfaces_as_not_found() {
    let client: Arc<dyn UpstreamClient> = Arc::new(ScriptedClient { status: 200, body: b"{}" });
    let req = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("authorization", "Bearer pk-live-123")
        .header("content-type", "application/json")
        .body(Body::from(r#"{"model":"not-a-real-model","messages":[]}"#))
        .unwrap();
    let resp = app(client).oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

/// A model that some enabled group does serve, but one this proxy key's
/// non-empty permit set excludes, is a 403 (access denied) rather than a
/// 404 (nothing serves it) — spec.md §7 `Forbidden` vs `NoEligibleGroup`.
#[tokio::test]
async fn model_served_only_by_an_unpermitted_group_is_forbidden_not_not_found() {
    let mut g1 = group();
    g1.identifier = "g1".into();

    let mut g2 = group();
    g2.id = 2;
    g2.identifier = "g2".into();
    g2.models = vec!["gpt-4o-other".into()];

    let mut key = proxy_key();
    key.permitted_groups = vec![2];

    let client: Arc<dyn UpstreamClient> = Arc::new(ScriptedClient { status: 200, body: b"{}" });
    let req = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("authorization", "Bearer pk-live-123")
        .header("content-type", "application/json")
        .body(Body::from(r#"{"model":"gpt-4o","messages":[]}"#))
        .unwrap();
    let resp = app_with(vec![g1, g2], key, client).oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
}

/// Spec §8 Scenario 4: a single-key group returning 503 must retry that
/// key at most once, then cross over to the next candidate group rather
/// than burning the whole retry budget on the failing group.
#[tokio::test]
async fn server_error_crosses_over_to_the_next_group_instead_of_exhausting_budget_on_one() {
    let mut g1 = group();
    g1.identifier = "g1".into();
    g1.base_url = "https://g1.example".into();
    g1.retry_count = 2;

    let mut g2 = group();
    g2.id = 2;
    g2.identifier = "g2".into();
    g2.base_url = "https://g2.example".into();

    let mut key = proxy_key();
    key.permitted_groups = vec![1, 2];
    key.group_policy = GroupSelectionPolicy::Failover;
    key.group_weights = HashMap::from([(1, 2), (2, 1)]);

    let client: Arc<dyn UpstreamClient> = Arc::new(SequencedClient::new(vec![
        (503, b"{}"),
        (503, b"{}"),
        (200, br#"{"id":"chatcmpl-g2","choices":[]}"#),
    ]));
    let req = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("authorization", "Bearer pk-live-123")
        .header("content-type", "application/json")
        .body(Body::from(r#"{"model":"gpt-4o","messages":[]}"#))
        .unwrap();
    let resp = app_with(vec![g1, g2], key, client).oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], br#"{"id":"chatcmpl-g2","choices":[]}"#);
}

#[tokio::test]
async fn list_models_aggregates_the_callers_permitted_groups() {
    let client: Arc<dyn UpstreamClient> = Arc::new(ScriptedClient { status: 200, body: b"{}" });
    let req = Request::builder()
        .method("GET")
        .uri("/v1/models")
        .header("authorization", "Bearer pk-live-123")
        .body(Body::empty())
        .unwrap();
    let resp = app(client).oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(value["data"][0]["id"], "gpt-4o");
}
