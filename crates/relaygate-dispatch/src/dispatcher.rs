use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use relaygate_common::{DispatchErrorKind, GroupId, Headers, ProviderKind, ProxyKeyId, key_hash};
use relaygate_log::{InsertRecord, LogEvent, LogPipeline, UpdateRecord, truncate_body};
use relaygate_state::{Group, KeyStateStore, ProxyKey, SnapshotPublisher, Validity};
use serde_json::Value;
use time::OffsetDateTime;

use crate::classify::{self, RetryAction, ValidityEffect};
use crate::context::DispatchContext;
use crate::fake_stream::synthesize_sse;
use crate::http::{HttpMethod, UpstreamBody, UpstreamClient, UpstreamFailure, UpstreamHttpRequest};
use crate::param_override::apply_param_overrides;
use crate::selection::{RoundRobinCursor, order_groups, order_keys};
use crate::auth;

/// Which upstream-native endpoint the client's ingress path implies.
/// `relaygate-router` maps the HTTP route to one of these before calling
/// `dispatch`; the dispatcher never inspects the request path itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    OpenAIChatCompletions,
    OpenAIResponses,
    AnthropicMessages,
    GeminiGenerateContent,
}

impl Endpoint {
    fn provider_kind(self) -> ProviderKind {
        match self {
            Endpoint::OpenAIChatCompletions | Endpoint::OpenAIResponses => ProviderKind::OpenAI,
            Endpoint::AnthropicMessages => ProviderKind::Anthropic,
            Endpoint::GeminiGenerateContent => ProviderKind::Gemini,
        }
    }

    fn path(self, model: &str, want_stream: bool) -> String {
        match self {
            Endpoint::OpenAIChatCompletions => "/v1/chat/completions".to_string(),
            Endpoint::OpenAIResponses => "/v1/responses".to_string(),
            Endpoint::AnthropicMessages => "/v1/messages".to_string(),
            Endpoint::GeminiGenerateContent => {
                let verb = if want_stream { "streamGenerateContent" } else { "generateContent" };
                format!("/v1beta/models/{model}:{verb}")
            }
        }
    }
}

pub struct DispatchRequest {
    pub endpoint: Endpoint,
    pub requested_model: String,
    pub is_streaming: bool,
    pub body: Value,
    pub request_headers: Headers,
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
}

pub struct DispatchResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: UpstreamBody,
}

pub enum DispatchOutcome {
    Response(DispatchResponse),
    Error(DispatchErrorKind),
}

enum LastFailure {
    Http { status: u16, body: Vec<u8> },
    Transport { message: String },
    Timeout,
}

/// Per-request selection and execution core. Holds no per-request state
/// itself — `RoundRobinCursor`s are shared across requests for the same
/// proxy key / group, everything else is threaded through the call.
pub struct Dispatcher {
    snapshot: Arc<SnapshotPublisher>,
    key_state: Arc<KeyStateStore>,
    log: Arc<LogPipeline>,
    client: Arc<dyn UpstreamClient>,
    group_cursors: RwLock<HashMap<ProxyKeyId, Arc<RoundRobinCursor>>>,
    key_cursors: RwLock<HashMap<GroupId, Arc<RoundRobinCursor>>>,
}

impl Dispatcher {
    pub fn new(
        snapshot: Arc<SnapshotPublisher>,
        key_state: Arc<KeyStateStore>,
        log: Arc<LogPipeline>,
        client: Arc<dyn UpstreamClient>,
    ) -> Self {
        Self {
            snapshot,
            key_state,
            log,
            client,
            group_cursors: RwLock::new(HashMap::new()),
            key_cursors: RwLock::new(HashMap::new()),
        }
    }

    fn group_cursor(&self, proxy_key_id: ProxyKeyId) -> Arc<RoundRobinCursor> {
        if let Some(cursor) = self.group_cursors.read().unwrap().get(&proxy_key_id) {
            return cursor.clone();
        }
        self.group_cursors
            .write()
            .unwrap()
            .entry(proxy_key_id)
            .or_insert_with(|| Arc::new(RoundRobinCursor::new()))
            .clone()
    }

    fn key_cursor(&self, group_id: GroupId) -> Arc<RoundRobinCursor> {
        if let Some(cursor) = self.key_cursors.read().unwrap().get(&group_id) {
            return cursor.clone();
        }
        self.key_cursors
            .write()
            .unwrap()
            .entry(group_id)
            .or_insert_with(|| Arc::new(RoundRobinCursor::new()))
            .clone()
    }

    pub async fn dispatch(
        &self,
        ctx: &DispatchContext,
        proxy_key: &ProxyKey,
        req: DispatchRequest,
    ) -> DispatchOutcome {
        let method = "POST".to_string();
        let endpoint_label = format!("{:?}", req.endpoint);
        let (truncated_body, content_truncated) = truncate_body(req.body.to_string().as_bytes());
        self.log.enqueue(LogEvent::Insert(InsertRecord {
            request_id: ctx.request_id.clone(),
            proxy_key_id: proxy_key.id,
            group_id: None,
            provider_kind: Some(req.endpoint.provider_kind().as_str().to_string()),
            model: Some(req.requested_model.clone()),
            method: method.clone(),
            endpoint: endpoint_label.clone(),
            request_headers: req.request_headers.clone(),
            request_body: truncated_body,
            content_truncated,
            is_streaming: req.is_streaming,
            has_tools: req.body.get("tools").is_some(),
            client_ip: req.client_ip.clone(),
            user_agent: req.user_agent.clone(),
            created_at: OffsetDateTime::now_utc(),
        }));

        let started = std::time::Instant::now();
        let outcome = self.dispatch_inner(ctx, proxy_key, &req).await;

        let (status_code, response_headers, response_body, content_truncated, tokens, error_message) =
            match &outcome {
                DispatchOutcome::Response(resp) => match &resp.body {
                    UpstreamBody::Bytes(bytes) => {
                        let (truncated, was_truncated) = truncate_body(bytes);
                        let tokens = extract_token_usage(bytes);
                        (Some(resp.status), resp.headers.clone(), truncated, was_truncated, tokens, None)
                    }
                    // The body already left our hands as a forwarded stream; we log
                    // headers and status only, not a body we no longer hold.
                    UpstreamBody::Stream(_) => {
                        (Some(resp.status), resp.headers.clone(), vec![], false, (None, None, None), None)
                    }
                },
                DispatchOutcome::Error(err) => {
                    (status_for_error(err), vec![], vec![], false, (None, None, None), Some(err.to_string()))
                }
            };
        self.log.enqueue(LogEvent::Update(UpdateRecord {
            request_id: ctx.request_id.clone(),
            status_code,
            duration_ms: started.elapsed().as_millis() as u64,
            response_headers,
            response_body,
            content_truncated,
            prompt_tokens: tokens.0,
            completion_tokens: tokens.1,
            total_tokens: tokens.2,
            error_message,
        }));

        outcome
    }

    async fn dispatch_inner(
        &self,
        ctx: &DispatchContext,
        proxy_key: &ProxyKey,
        req: &DispatchRequest,
    ) -> DispatchOutcome {
        let snapshot = self.snapshot.current();
        let kind = req.endpoint.provider_kind();

        let matches_request = |g: &Arc<Group>| {
            g.provider_kind == kind && g.supports_model(g.resolve_model(&req.requested_model))
        };

        let mut candidates: Vec<Arc<Group>> =
            snapshot.groups_for(proxy_key).into_iter().filter(matches_request).collect();

        if candidates.is_empty() {
            // Distinguish "nothing anywhere serves this model/provider" (404)
            // from "something does, but this proxy key's non-empty permit
            // set excludes it" (403) — the proxy key's own permit filter
            // already ran inside `groups_for`, so re-check against every
            // enabled group to tell the two apart.
            let exists_elsewhere = snapshot.all_groups().any(matches_request);
            return DispatchOutcome::Error(if exists_elsewhere && !proxy_key.permitted_groups.is_empty() {
                DispatchErrorKind::Forbidden
            } else {
                DispatchErrorKind::NoEligibleGroup
            });
        }

        let group_cursor = self.group_cursor(proxy_key.id);
        candidates = order_groups(candidates, proxy_key, &group_cursor);

        match self.key_state.try_acquire_proxy_rpm(proxy_key.id, proxy_key.rpm_limit) {
            relaygate_state::Admission::Rejected { retry_after_secs } => {
                return DispatchOutcome::Error(DispatchErrorKind::RateLimited { retry_after_secs });
            }
            relaygate_state::Admission::Ok => {}
        }

        // Open question resolved: the global attempt budget is drawn from
        // the first candidate group in policy order, since cross-group
        // failover is the behavior this system is meant to exhibit.
        let budget = candidates[0].retry_count + 1;
        let mut attempts_used: u32 = 0;
        let mut last_failure: Option<LastFailure> = None;

        'groups: for group in &candidates {
            if attempts_used >= budget {
                break;
            }
            let live_keys: Vec<String> = group
                .keys
                .iter()
                .filter(|k| {
                    matches!(
                        self.key_state.validity(group.id, &key_hash(k)),
                        Validity::Unknown | Validity::Valid
                    )
                })
                .cloned()
                .collect();
            if live_keys.is_empty() {
                continue;
            }
            let key_cursor = self.key_cursor(group.id);
            let ordered_keys = order_keys(live_keys, group.balance_policy, &key_cursor);
            let mut key_iter = ordered_keys.into_iter().peekable();

            'keys: while let Some(key) = key_iter.next() {
                if attempts_used >= budget {
                    break 'groups;
                }
                let hash = key_hash(&key);
                if matches!(
                    self.key_state.try_acquire_key_rpm(group.id, &hash, group.rpm_limit),
                    relaygate_state::Admission::Rejected { .. }
                ) {
                    continue 'keys;
                }

                // Same-key retry is bounded to a single extra attempt: a key
                // that keeps failing 5xx/429/transport must not be allowed to
                // consume the whole global budget, or cross-group failover
                // (spec.md §8 Scenario 4) can never happen.
                let mut retried_this_key = false;

                'retry_same: loop {
                    if attempts_used >= budget {
                        break 'groups;
                    }
                    if ctx.is_cancelled() {
                        return DispatchOutcome::Error(DispatchErrorKind::Cancelled);
                    }
                    if ctx.is_expired() {
                        last_failure = Some(LastFailure::Timeout);
                        break 'groups;
                    }
                    attempts_used += 1;

                    match self.attempt(ctx, group, &key, &hash, kind, req).await {
                        AttemptResult::Success(resp) => return DispatchOutcome::Response(resp),
                        AttemptResult::Terminal { status, body } => {
                            last_failure = Some(LastFailure::Http { status, body });
                            break 'groups;
                        }
                        AttemptResult::RetrySame { status, body } => {
                            last_failure = Some(LastFailure::Http { status, body });
                            if retried_this_key {
                                continue 'keys;
                            }
                            retried_this_key = true;
                            classify::backoff_sleep(attempts_used).await;
                            continue 'retry_same;
                        }
                        AttemptResult::NextKey { status, body } => {
                            last_failure = Some(LastFailure::Http { status, body });
                            continue 'keys;
                        }
                        AttemptResult::EitherRetryOrNextKey { status, body } => {
                            last_failure = Some(LastFailure::Http { status, body });
                            if key_iter.peek().is_some() || retried_this_key {
                                continue 'keys;
                            }
                            retried_this_key = true;
                            classify::backoff_sleep(attempts_used).await;
                            continue 'retry_same;
                        }
                        AttemptResult::TransportRetry { message } => {
                            last_failure = Some(LastFailure::Transport { message });
                            if retried_this_key {
                                continue 'keys;
                            }
                            retried_this_key = true;
                            classify::backoff_sleep(attempts_used).await;
                            continue 'retry_same;
                        }
                        AttemptResult::TransportTerminal { message } => {
                            last_failure = Some(LastFailure::Transport { message });
                            break 'groups;
                        }
                        AttemptResult::Cancelled => {
                            return DispatchOutcome::Error(DispatchErrorKind::Cancelled);
                        }
                    }
                }
            }
        }

        DispatchOutcome::Error(error_for_exhaustion(last_failure))
    }

    #[allow(clippy::too_many_arguments)]
    async fn attempt(
        &self,
        ctx: &DispatchContext,
        group: &Group,
        key: &str,
        key_hash: &str,
        kind: ProviderKind,
        req: &DispatchRequest,
    ) -> AttemptResult {
        let resolved_model = group.resolve_model(&req.requested_model).to_string();
        let upstream_is_stream = req.is_streaming && !group.fake_streaming;

        let path = req.endpoint.path(&resolved_model, upstream_is_stream);
        let base_url = group.base_url.trim_end_matches('/');
        let url = format!("{base_url}{path}");

        let mut headers = group.custom_headers.clone();
        relaygate_common::header_set(&mut headers, "Content-Type", "application/json");
        let url = auth::apply_auth(kind, key, &url, &mut headers);

        let mut body = req.body.clone();
        if kind != ProviderKind::Gemini {
            if let Some(obj) = body.as_object_mut() {
                obj.insert("model".to_string(), Value::String(resolved_model.clone()));
            }
        }
        if let Some(overrides) = &group.param_overrides {
            apply_param_overrides(&mut body, overrides);
        }
        if kind != ProviderKind::Gemini {
            if let Some(obj) = body.as_object_mut() {
                obj.insert("stream".to_string(), Value::Bool(upstream_is_stream));
            }
        }

        let body_bytes = Bytes::from(body.to_string().into_bytes());
        let response_timeout = ctx.remaining().min(group.response_timeout);

        let http_req = UpstreamHttpRequest {
            method: HttpMethod::Post,
            url,
            headers,
            body: Some(body_bytes),
            is_stream: upstream_is_stream,
            connect_timeout: group.connect_timeout,
            response_timeout,
            proxy: group.forward_proxy.clone(),
        };

        let result = self.client.send(http_req).await;
        self.key_state.record_use(group.id, key_hash);

        match result {
            Ok(resp) if (200..300).contains(&resp.status) => {
                self.key_state.record_outcome(group.id, key_hash, resp.status, None);
                let body = if req.is_streaming && group.fake_streaming {
                    let collected = collect_bytes(resp.body).await;
                    let frames = synthesize_sse(kind, &collected);
                    UpstreamBody::Stream(frames_to_channel(frames))
                } else {
                    resp.body
                };
                AttemptResult::Success(DispatchResponse {
                    status: resp.status,
                    headers: resp.headers,
                    body,
                })
            }
            Ok(resp) => {
                let body = collect_bytes(resp.body).await;
                self.key_state.record_outcome(
                    group.id,
                    key_hash,
                    resp.status,
                    Some(String::from_utf8_lossy(&body).to_string()),
                );
                let outcome = classify::classify_http_status(resp.status);
                match outcome.retry {
                    RetryAction::Terminal => AttemptResult::Terminal { status: resp.status, body },
                    RetryAction::RetrySame => AttemptResult::RetrySame { status: resp.status, body },
                    RetryAction::NextKey => AttemptResult::NextKey { status: resp.status, body },
                    RetryAction::RetrySameOrNextKey => {
                        AttemptResult::EitherRetryOrNextKey { status: resp.status, body }
                    }
                }
            }
            Err(UpstreamFailure::Cancelled) => AttemptResult::Cancelled,
            Err(failure @ UpstreamFailure::Transport { .. }) => {
                let outcome = classify::classify_failure(&failure);
                let message = match &failure {
                    UpstreamFailure::Transport { message, .. } => message.clone(),
                    _ => unreachable!(),
                };
                debug_assert_eq!(outcome.validity, ValidityEffect::Unchanged);
                match outcome.retry {
                    RetryAction::RetrySame => AttemptResult::TransportRetry { message },
                    _ => AttemptResult::TransportTerminal { message },
                }
            }
            Err(UpstreamFailure::Http { status, body, .. }) => {
                AttemptResult::Terminal { status, body: body.to_vec() }
            }
        }
    }
}

enum AttemptResult {
    Success(DispatchResponse),
    Terminal { status: u16, body: Vec<u8> },
    RetrySame { status: u16, body: Vec<u8> },
    NextKey { status: u16, body: Vec<u8> },
    EitherRetryOrNextKey { status: u16, body: Vec<u8> },
    TransportRetry { message: String },
    TransportTerminal { message: String },
    Cancelled,
}

async fn collect_bytes(body: UpstreamBody) -> Vec<u8> {
    match body {
        UpstreamBody::Bytes(bytes) => bytes.to_vec(),
        UpstreamBody::Stream(mut rx) => {
            let mut out = Vec::new();
            while let Some(chunk) = rx.recv().await {
                out.extend_from_slice(&chunk);
            }
            out
        }
    }
}

fn frames_to_channel(frames: Vec<Bytes>) -> tokio::sync::mpsc::Receiver<Bytes> {
    let (tx, rx) = tokio::sync::mpsc::channel(frames.len().max(1));
    tokio::spawn(async move {
        for frame in frames {
            if tx.send(frame).await.is_err() {
                break;
            }
        }
    });
    rx
}

fn status_for_error(err: &DispatchErrorKind) -> Option<u16> {
    match err {
        DispatchErrorKind::Unauthorized => Some(401),
        DispatchErrorKind::Forbidden => Some(403),
        DispatchErrorKind::NoEligibleGroup => Some(404),
        DispatchErrorKind::RateLimited { .. } => Some(429),
        DispatchErrorKind::UpstreamRejected { status, .. } => Some(*status),
        DispatchErrorKind::UpstreamUnavailable => Some(502),
        DispatchErrorKind::Timeout => Some(504),
        DispatchErrorKind::Cancelled => None,
        DispatchErrorKind::Internal(_) => Some(500),
    }
}

/// Pulls token counts out of a non-streaming JSON response body, covering
/// the OpenAI `usage{prompt_tokens,completion_tokens,total_tokens}` shape,
/// Anthropic's `usage{input_tokens,output_tokens}`, and Gemini's
/// `usageMetadata{promptTokenCount,candidatesTokenCount,totalTokenCount}`.
/// Streaming responses never reach this — usage isn't logged for those.
fn extract_token_usage(body: &[u8]) -> (Option<u64>, Option<u64>, Option<u64>) {
    let Ok(value) = serde_json::from_slice::<Value>(body) else {
        return (None, None, None);
    };
    let as_u64 = |v: Option<&Value>| v.and_then(Value::as_u64);

    if let Some(usage) = value.get("usage") {
        let prompt = as_u64(usage.get("prompt_tokens")).or_else(|| as_u64(usage.get("input_tokens")));
        let completion = as_u64(usage.get("completion_tokens")).or_else(|| as_u64(usage.get("output_tokens")));
        let total = as_u64(usage.get("total_tokens")).or_else(|| match (prompt, completion) {
            (Some(p), Some(c)) => Some(p + c),
            _ => None,
        });
        return (prompt, completion, total);
    }
    if let Some(usage) = value.get("usageMetadata") {
        let prompt = as_u64(usage.get("promptTokenCount"));
        let completion = as_u64(usage.get("candidatesTokenCount"));
        let total = as_u64(usage.get("totalTokenCount")).or_else(|| match (prompt, completion) {
            (Some(p), Some(c)) => Some(p + c),
            _ => None,
        });
        return (prompt, completion, total);
    }
    (None, None, None)
}

fn error_for_exhaustion(last_failure: Option<LastFailure>) -> DispatchErrorKind {
    match last_failure {
        Some(LastFailure::Http { status, body }) if (400..500).contains(&status) => {
            DispatchErrorKind::UpstreamRejected { status, body }
        }
        Some(LastFailure::Http { .. }) => DispatchErrorKind::UpstreamUnavailable,
        Some(LastFailure::Transport { .. }) => DispatchErrorKind::UpstreamUnavailable,
        Some(LastFailure::Timeout) => DispatchErrorKind::Timeout,
        None => DispatchErrorKind::UpstreamUnavailable,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_openai_usage_shape() {
        let body = br#"{"usage":{"prompt_tokens":10,"completion_tokens":5,"total_tokens":15}}"#;
        assert_eq!(extract_token_usage(body), (Some(10), Some(5), Some(15)));
    }

    #[test]
    fn extracts_anthropic_usage_shape_and_derives_total() {
        let body = br#"{"usage":{"input_tokens":7,"output_tokens":3}}"#;
        assert_eq!(extract_token_usage(body), (Some(7), Some(3), Some(10)));
    }

    #[test]
    fn extracts_gemini_usage_metadata_shape() {
        let body = br#"{"usageMetadata":{"promptTokenCount":4,"candidatesTokenCount":6,"totalTokenCount":10}}"#;
        assert_eq!(extract_token_usage(body), (Some(4), Some(6), Some(10)));
    }

    #[test]
    fn missing_usage_yields_all_none() {
        assert_eq!(extract_token_usage(b"{}"), (None, None, None));
        assert_eq!(extract_token_usage(b"not json"), (None, None, None));
    }

    #[test]
    fn exhausted_5xx_failures_map_to_upstream_unavailable_not_rejected() {
        let err = error_for_exhaustion(Some(LastFailure::Http { status: 503, body: vec![] }));
        assert!(matches!(err, DispatchErrorKind::UpstreamUnavailable));
    }

    #[test]
    fn exhausted_4xx_failures_pass_through_as_upstream_rejected() {
        let err = error_for_exhaustion(Some(LastFailure::Http { status: 422, body: b"bad".to_vec() }));
        assert!(matches!(err, DispatchErrorKind::UpstreamRejected { status: 422, .. }));
    }
}
