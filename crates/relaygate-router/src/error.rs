use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use relaygate_common::DispatchErrorKind;
use serde::Serialize;

/// Synthetic error shape for locally-originated failures. Upstream
/// passthrough errors keep the upstream's own native error schema and
/// never go through this type.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub message: String,
    pub r#type: &'static str,
    pub code: &'static str,
}

fn synthetic(status: StatusCode, r#type: &'static str, code: &'static str, message: impl Into<String>) -> Response {
    let body = ErrorBody {
        error: ErrorDetail { message: message.into(), r#type, code },
    };
    (status, Json(body)).into_response()
}

/// Converts a dispatcher error into the HTTP response spec.md's error
/// table specifies. `UpstreamRejected` is the one variant that carries
/// the upstream's own body and status through unchanged rather than
/// wrapping it in `ErrorBody`.
pub fn error_response(err: DispatchErrorKind) -> Response {
    match err {
        DispatchErrorKind::Unauthorized => synthetic(
            StatusCode::UNAUTHORIZED,
            "invalid_request_error",
            "invalid_api_key",
            err.to_string(),
        ),
        DispatchErrorKind::Forbidden => synthetic(
            StatusCode::FORBIDDEN,
            "invalid_request_error",
            "forbidden",
            err.to_string(),
        ),
        DispatchErrorKind::NoEligibleGroup => synthetic(
            StatusCode::NOT_FOUND,
            "invalid_request_error",
            "model_not_found",
            err.to_string(),
        ),
        DispatchErrorKind::RateLimited { retry_after_secs } => {
            let body = ErrorBody {
                error: ErrorDetail {
                    message: err.to_string(),
                    r#type: "rate_limit_error",
                    code: "rate_limited",
                },
            };
            let mut resp = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
            if let Ok(value) = retry_after_secs.to_string().parse() {
                resp.headers_mut().insert(axum::http::header::RETRY_AFTER, value);
            }
            resp
        }
        DispatchErrorKind::UpstreamRejected { status, body } => {
            let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
            (status, body).into_response()
        }
        DispatchErrorKind::UpstreamUnavailable => synthetic(
            StatusCode::BAD_GATEWAY,
            "api_error",
            "upstream_unavailable",
            err.to_string(),
        ),
        DispatchErrorKind::Timeout => synthetic(
            StatusCode::GATEWAY_TIMEOUT,
            "api_error",
            "timeout",
            err.to_string(),
        ),
        DispatchErrorKind::Cancelled => StatusCode::OK.into_response(),
        DispatchErrorKind::Internal(cause) => {
            tracing::error!(cause, "internal dispatch error");
            synthetic(
                StatusCode::INTERNAL_SERVER_ERROR,
                "api_error",
                "internal_error",
                "internal error",
            )
        }
    }
}
