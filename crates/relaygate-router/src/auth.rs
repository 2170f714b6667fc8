use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, Request, header};
use axum::middleware::Next;
use axum::response::Response;
use relaygate_state::ProxyKey;

use crate::error::error_response;
use crate::state::AppState;

/// Request-scoped identity, attached as an extension by [`proxy_auth`] for
/// handlers to pull out instead of re-parsing headers.
#[derive(Clone)]
pub struct AuthenticatedKey {
    pub proxy_key: Arc<ProxyKey>,
    pub request_id: String,
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
}

/// Extracts the proxy key from `Authorization: Bearer <k>` or
/// `x-api-key: <k>`, resolves it against the current routing snapshot, and
/// rejects with 401 before any handler runs. Mirrors the teacher's
/// `proxy_auth` layer: auth material is stripped from the forwarded
/// request so it never reaches a handler or gets logged.
pub async fn proxy_auth(State(state): State<AppState>, mut req: Request<Body>, next: Next) -> Result<Response, Response> {
    let token = extract_token(req.headers());
    strip_auth_headers(req.headers_mut());

    let Some(token) = token else {
        return Err(error_response(relaygate_common::DispatchErrorKind::Unauthorized));
    };

    let snapshot = state.snapshot.current();
    let Some(proxy_key) = snapshot.proxy_key_by_token(&token).cloned() else {
        return Err(error_response(relaygate_common::DispatchErrorKind::Unauthorized));
    };
    if !proxy_key.enabled {
        return Err(error_response(relaygate_common::DispatchErrorKind::Unauthorized));
    }

    let client_ip = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').next().unwrap_or(v).trim().to_string());
    let user_agent = req
        .headers()
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string());
    let request_id = uuid::Uuid::now_v7().to_string();

    req.extensions_mut().insert(AuthenticatedKey {
        proxy_key,
        request_id,
        client_ip,
        user_agent,
    });

    Ok(next.run(req).await)
}

fn extract_token(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(header::AUTHORIZATION)
        && let Ok(s) = value.to_str()
    {
        let s = s.trim();
        let prefix = "Bearer ";
        if s.len() > prefix.len() && s[..prefix.len()].eq_ignore_ascii_case(prefix) {
            let token = s[prefix.len()..].trim();
            if !token.is_empty() {
                return Some(token.to_string());
            }
        }
    }
    if let Some(value) = headers.get("x-api-key")
        && let Ok(s) = value.to_str()
    {
        let s = s.trim();
        if !s.is_empty() {
            return Some(s.to_string());
        }
    }
    None
}

fn strip_auth_headers(headers: &mut HeaderMap) {
    headers.remove(header::AUTHORIZATION);
    headers.remove("x-api-key");
}
