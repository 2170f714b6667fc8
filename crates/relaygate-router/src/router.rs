use std::convert::Infallible;

use axum::body::Body;
use axum::extract::{Extension, Path, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use futures_util::StreamExt;
use relaygate_common::Headers;
use relaygate_dispatch::{DispatchContext, DispatchOutcome, DispatchRequest, Endpoint, UpstreamBody};
use serde_json::{Value, json};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::auth::{AuthenticatedKey, proxy_auth};
use crate::error::error_response;
use crate::state::AppState;

/// The axum ingress surface: the OpenAI/Anthropic/Gemini request paths
/// spec.md names, all behind the `proxy_auth` layer, all funneling into
/// the dispatcher. Matches the teacher's `proxy_router` shape: one
/// middleware layer over a flat route table, no per-route auth
/// boilerplate.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(openai_chat_completions))
        .route("/v1/responses", post(openai_responses))
        .route("/v1/models", get(list_models))
        .route("/v1/messages", post(anthropic_messages))
        .route("/v1beta/models/{model}:generateContent", post(gemini_generate_content))
        .route("/v1beta/models/{model}:streamGenerateContent", post(gemini_stream_generate_content))
        .layer(axum::middleware::from_fn_with_state(state.clone(), proxy_auth))
        .with_state(state)
}

async fn openai_chat_completions(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthenticatedKey>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    dispatch_json_endpoint(state, auth, Endpoint::OpenAIChatCompletions, headers, body).await
}

async fn openai_responses(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthenticatedKey>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    dispatch_json_endpoint(state, auth, Endpoint::OpenAIResponses, headers, body).await
}

async fn anthropic_messages(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthenticatedKey>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    dispatch_json_endpoint(state, auth, Endpoint::AnthropicMessages, headers, body).await
}

async fn dispatch_json_endpoint(
    state: AppState,
    auth: AuthenticatedKey,
    endpoint: Endpoint,
    headers: HeaderMap,
    body: Value,
) -> Response {
    let requested_model = body.get("model").and_then(Value::as_str).unwrap_or_default().to_string();
    let is_streaming = body.get("stream").and_then(Value::as_bool).unwrap_or(false);
    let req = DispatchRequest {
        endpoint,
        requested_model,
        is_streaming,
        body,
        request_headers: headers_to_vec(&headers),
        client_ip: auth.client_ip.clone(),
        user_agent: auth.user_agent.clone(),
    };
    run_dispatch(state, auth, req).await
}

async fn gemini_generate_content(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthenticatedKey>,
    Path(model): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    dispatch_gemini(state, auth, model, false, headers, body).await
}

async fn gemini_stream_generate_content(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthenticatedKey>,
    Path(model): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    dispatch_gemini(state, auth, model, true, headers, body).await
}

async fn dispatch_gemini(
    state: AppState,
    auth: AuthenticatedKey,
    model: String,
    is_streaming: bool,
    headers: HeaderMap,
    body: Value,
) -> Response {
    let req = DispatchRequest {
        endpoint: Endpoint::GeminiGenerateContent,
        requested_model: model,
        is_streaming,
        body,
        request_headers: headers_to_vec(&headers),
        client_ip: auth.client_ip.clone(),
        user_agent: auth.user_agent.clone(),
    };
    run_dispatch(state, auth, req).await
}

/// Auth headers are stripped by `proxy_auth` before this ever runs, so
/// raw API keys never make it into a logged request.
fn headers_to_vec(headers: &HeaderMap) -> Headers {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value.to_str().ok().map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

async fn run_dispatch(state: AppState, auth: AuthenticatedKey, req: DispatchRequest) -> Response {
    let ctx = DispatchContext::new(
        auth.request_id.clone(),
        auth.proxy_key.id,
        state.config.request_timeout,
        CancellationToken::new(),
    );
    match state.dispatcher.dispatch(&ctx, &auth.proxy_key, req).await {
        DispatchOutcome::Response(resp) => build_upstream_response(resp.status, resp.headers, resp.body),
        DispatchOutcome::Error(err) => error_response(err),
    }
}

fn build_upstream_response(status: u16, headers: Headers, body: UpstreamBody) -> Response {
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
    let body = match body {
        UpstreamBody::Bytes(bytes) => Body::from(bytes),
        UpstreamBody::Stream(rx) => {
            let stream = ReceiverStream::new(rx).map(Ok::<Bytes, Infallible>);
            Body::from_stream(stream)
        }
    };
    let mut response = Response::new(body);
    *response.status_mut() = status;

    let out = response.headers_mut();
    for (name, value) in &headers {
        let lower = name.to_ascii_lowercase();
        // Upstream framing headers don't carry over: the body's shape
        // (single buffer vs. re-chunked stream) is decided here, not
        // upstream.
        if lower == "content-length" || lower == "transfer-encoding" {
            continue;
        }
        let (Ok(name), Ok(value)) = (HeaderName::try_from(name.as_str()), HeaderValue::from_str(value)) else {
            continue;
        };
        out.insert(name, value);
    }
    response
}

/// Local aggregation over the caller's permitted, enabled groups — this
/// never makes an upstream call, matching spec.md's "aggregated visible
/// model list for the caller's proxy key".
async fn list_models(State(state): State<AppState>, Extension(auth): Extension<AuthenticatedKey>) -> Response {
    let snapshot = state.snapshot.current();
    let mut seen = std::collections::BTreeSet::new();
    for group in snapshot.groups_for(&auth.proxy_key) {
        for model in &group.models {
            seen.insert(model.clone());
        }
    }
    let data: Vec<Value> = seen
        .into_iter()
        .map(|id| json!({ "id": id, "object": "model", "owned_by": "relaygate" }))
        .collect();
    Json(json!({ "object": "list", "data": data })).into_response()
}
