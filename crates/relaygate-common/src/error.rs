/// Error kinds surfaced to the caller. Each variant maps
/// to exactly one HTTP status at the router boundary; the mapping lives in
/// `relaygate-router` since only that crate knows about `axum`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DispatchErrorKind {
    #[error("invalid or disabled proxy key")]
    Unauthorized,
    #[error("proxy key lacks access to any eligible group")]
    Forbidden,
    #[error("no group has the requested model and provider kind")]
    NoEligibleGroup,
    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
    #[error("all retries exhausted against upstream 4xx")]
    UpstreamRejected { status: u16, body: Vec<u8> },
    #[error("all retries exhausted, upstream unavailable")]
    UpstreamUnavailable,
    #[error("response deadline exceeded")]
    Timeout,
    #[error("client cancelled the request")]
    Cancelled,
    #[error("internal error: {0}")]
    Internal(String),
}

/// Generic crate-local error for fallible operations that don't produce a
/// `DispatchErrorKind` directly (storage I/O, config parsing, ...).
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("storage error: {0}")]
    Storage(String),
    #[error("config error: {0}")]
    Config(String),
    #[error(transparent)]
    Dispatch(#[from] DispatchErrorKind),
}

pub type RelayResult<T> = Result<T, RelayError>;
