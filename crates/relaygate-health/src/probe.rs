use std::time::{Duration, Instant};

use relaygate_common::ProviderKind;
use relaygate_dispatch::auth;
use relaygate_dispatch::{HttpMethod, UpstreamClient, UpstreamFailure, UpstreamHttpRequest};
use relaygate_state::{Group, HealthCheckResult, HealthCheckType};
use time::OffsetDateTime;

/// Raw result of one probe send, before it's folded into a `HealthCheckResult`
/// and (for key/model probes) a `KeyStateStore::record_outcome` call.
pub struct ProbeOutcome {
    pub result: HealthCheckResult,
    /// `Some(status)` when the upstream answered at all, even with an
    /// error status; `None` on a transport-level failure.
    pub http_status: Option<u16>,
    pub error_body: Option<String>,
}

fn models_list_url(kind: ProviderKind, base_url: &str) -> String {
    let base = base_url.trim_end_matches('/');
    match kind {
        ProviderKind::OpenAI | ProviderKind::Anthropic => format!("{base}/v1/models"),
        ProviderKind::Gemini => format!("{base}/v1beta/models"),
    }
}

fn model_get_url(kind: ProviderKind, base_url: &str, model: &str) -> String {
    let base = base_url.trim_end_matches('/');
    match kind {
        ProviderKind::OpenAI | ProviderKind::Anthropic => format!("{base}/v1/models/{model}"),
        ProviderKind::Gemini => format!("{base}/v1beta/models/{model}"),
    }
}

fn failure_message(failure: &UpstreamFailure) -> String {
    match failure {
        UpstreamFailure::Http { status, .. } => format!("http {status}"),
        UpstreamFailure::Transport { kind, message } => format!("{kind:?}: {message}"),
        UpstreamFailure::Cancelled => "cancelled".to_string(),
    }
}

async fn send_get(
    client: &dyn UpstreamClient,
    url: String,
    proxy: Option<String>,
    timeout: Duration,
) -> (Duration, Result<(u16, Vec<u8>), UpstreamFailure>) {
    let req = UpstreamHttpRequest {
        method: HttpMethod::Get,
        url,
        headers: vec![],
        body: None,
        is_stream: false,
        connect_timeout: timeout,
        response_timeout: timeout,
        proxy,
    };
    let started = Instant::now();
    let outcome = client.send(req).await;
    let elapsed = started.elapsed();
    match outcome {
        Ok(resp) => {
            let body = match resp.body {
                relaygate_dispatch::UpstreamBody::Bytes(bytes) => bytes.to_vec(),
                relaygate_dispatch::UpstreamBody::Stream(mut rx) => {
                    let mut out = Vec::new();
                    while let Some(chunk) = rx.recv().await {
                        out.extend_from_slice(&chunk);
                    }
                    out
                }
            };
            (elapsed, Ok((resp.status, body)))
        }
        Err(failure) => (elapsed, Err(failure)),
    }
}

/// Axis 1: provider reachability. An unauthenticated `GET` against the
/// group's models-list endpoint — any HTTP answer (even a 401) proves the
/// provider itself is reachable; only a transport failure counts against it.
pub async fn probe_provider(client: &dyn UpstreamClient, group: &Group, timeout: Duration) -> ProbeOutcome {
    let url = models_list_url(group.provider_kind, &group.base_url);
    let (elapsed, outcome) = send_get(client, url, group.forward_proxy.clone(), timeout).await;
    let latency_ms = Some(elapsed.as_millis() as u64);
    match outcome {
        Ok((status, _body)) => ProbeOutcome {
            result: HealthCheckResult {
                group_id: group.id,
                check_type: HealthCheckType::Provider,
                subject: group.identifier.clone(),
                success: true,
                latency_ms,
                message: None,
                observed_at: OffsetDateTime::now_utc(),
            },
            http_status: Some(status),
            error_body: None,
        },
        Err(failure) => {
            let message = failure_message(&failure);
            ProbeOutcome {
                result: HealthCheckResult {
                    group_id: group.id,
                    check_type: HealthCheckType::Provider,
                    subject: group.identifier.clone(),
                    success: false,
                    latency_ms,
                    message: Some(message.clone()),
                    observed_at: OffsetDateTime::now_utc(),
                },
                http_status: None,
                error_body: Some(message),
            }
        }
    }
}

/// Axis 2: per-key validity via a lightweight authenticated call. Uses the
/// group's models-list endpoint stamped with the same auth scheme the
/// dispatcher uses, so a 200 here means the key is genuinely usable.
pub async fn probe_key(client: &dyn UpstreamClient, group: &Group, key: &str, timeout: Duration) -> ProbeOutcome {
    let base_url = models_list_url(group.provider_kind, &group.base_url);
    let mut headers = Vec::new();
    let url = auth::apply_auth(group.provider_kind, key, &base_url, &mut headers);
    let subject = relaygate_common::key_hash(key);

    let req = UpstreamHttpRequest {
        method: HttpMethod::Get,
        url,
        headers,
        body: None,
        is_stream: false,
        connect_timeout: timeout,
        response_timeout: timeout,
        proxy: group.forward_proxy.clone(),
    };
    let started = Instant::now();
    let outcome = client.send(req).await;
    let latency_ms = Some(started.elapsed().as_millis() as u64);

    match outcome {
        Ok(resp) => {
            let success = (200..300).contains(&resp.status);
            ProbeOutcome {
                result: HealthCheckResult {
                    group_id: group.id,
                    check_type: HealthCheckType::Key,
                    subject: subject.clone(),
                    success,
                    latency_ms,
                    message: if success { None } else { Some(format!("http {}", resp.status)) },
                    observed_at: OffsetDateTime::now_utc(),
                },
                http_status: Some(resp.status),
                error_body: None,
            }
        }
        Err(failure) => {
            let message = failure_message(&failure);
            ProbeOutcome {
                result: HealthCheckResult {
                    group_id: group.id,
                    check_type: HealthCheckType::Key,
                    subject,
                    success: false,
                    latency_ms,
                    message: Some(message.clone()),
                    observed_at: OffsetDateTime::now_utc(),
                },
                http_status: None,
                error_body: Some(message),
            }
        }
    }
}

/// Axis 3: per-model availability. Uses the group's first live key (if
/// any) so the probe reflects what a real request would see, falling
/// back to an unauthenticated call when the group has no keys configured
/// yet (still useful to confirm the model is listed).
pub async fn probe_model(
    client: &dyn UpstreamClient,
    group: &Group,
    model: &str,
    key: Option<&str>,
    timeout: Duration,
) -> ProbeOutcome {
    let base_url = model_get_url(group.provider_kind, &group.base_url, model);
    let mut headers = Vec::new();
    let url = match key {
        Some(key) => auth::apply_auth(group.provider_kind, key, &base_url, &mut headers),
        None => base_url,
    };

    let (elapsed, outcome) = send_get(client, url, group.forward_proxy.clone(), timeout).await;
    let latency_ms = Some(elapsed.as_millis() as u64);
    match outcome {
        Ok((status, _body)) => {
            let success = (200..300).contains(&status);
            ProbeOutcome {
                result: HealthCheckResult {
                    group_id: group.id,
                    check_type: HealthCheckType::Model,
                    subject: model.to_string(),
                    success,
                    latency_ms,
                    message: if success { None } else { Some(format!("http {status}")) },
                    observed_at: OffsetDateTime::now_utc(),
                },
                http_status: Some(status),
                error_body: None,
            }
        }
        Err(failure) => {
            let message = failure_message(&failure);
            ProbeOutcome {
                result: HealthCheckResult {
                    group_id: group.id,
                    check_type: HealthCheckType::Model,
                    subject: model.to_string(),
                    success: false,
                    latency_ms,
                    message: Some(message.clone()),
                    observed_at: OffsetDateTime::now_utc(),
                },
                http_status: None,
                error_body: Some(message),
            }
        }
    }
}
