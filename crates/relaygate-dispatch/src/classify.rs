use std::time::Duration;

use crate::http::{TransportErrorKind, UpstreamFailure};

/// Whether, and how, to retry after an attempt failed.
///
/// `try_next_key` and `retry_same_key` are not mutually exclusive in the
/// underlying table (429 marks both); `Dispatcher::dispatch` resolves the
/// tie by preferring `NextKey` whenever another key remains in the
/// current group, falling back to `RetrySame` only when the group is
/// exhausted. See DESIGN.md for the rationale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    /// Do not retry; surface the failure to the caller.
    Terminal,
    /// Retry the same key, provided the retry budget allows it.
    RetrySame,
    /// Move to the next key (or group), provided one remains.
    NextKey,
    /// Either of the above is acceptable; caller breaks the tie.
    RetrySameOrNextKey,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidityEffect {
    /// Clears the error count and marks the key valid.
    MarkValid,
    /// Marks the key invalid and increments the error count.
    MarkInvalid,
    /// Leaves validity untouched; only usage counters move.
    Unchanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome {
    pub retry: RetryAction,
    pub validity: ValidityEffect,
}

/// Outcome classification table.
/// Cancellation short-circuits before this table is consulted at all.
pub fn classify_http_status(status: u16) -> Outcome {
    match status {
        200..=299 => Outcome {
            retry: RetryAction::Terminal,
            validity: ValidityEffect::MarkValid,
        },
        401 | 403 => Outcome {
            retry: RetryAction::NextKey,
            validity: ValidityEffect::MarkInvalid,
        },
        429 => Outcome {
            retry: RetryAction::RetrySameOrNextKey,
            validity: ValidityEffect::Unchanged,
        },
        400 | 404 | 422 => Outcome {
            retry: RetryAction::Terminal,
            validity: ValidityEffect::Unchanged,
        },
        500..=599 => Outcome {
            retry: RetryAction::RetrySame,
            validity: ValidityEffect::Unchanged,
        },
        _ => Outcome {
            retry: RetryAction::Terminal,
            validity: ValidityEffect::Unchanged,
        },
    }
}

pub fn classify_failure(failure: &UpstreamFailure) -> Outcome {
    match failure {
        UpstreamFailure::Http { status, .. } => classify_http_status(*status),
        UpstreamFailure::Transport { kind, .. } => match kind {
            TransportErrorKind::Timeout
            | TransportErrorKind::ReadTimeout
            | TransportErrorKind::Connect
            | TransportErrorKind::Dns
            | TransportErrorKind::Tls
            | TransportErrorKind::ConnectionReset => Outcome {
                retry: RetryAction::RetrySame,
                validity: ValidityEffect::Unchanged,
            },
            TransportErrorKind::Other => Outcome {
                retry: RetryAction::Terminal,
                validity: ValidityEffect::Unchanged,
            },
        },
        // Cancellation never mutates validity and never retries.
        UpstreamFailure::Cancelled => Outcome {
            retry: RetryAction::Terminal,
            validity: ValidityEffect::Unchanged,
        },
    }
}

/// Exponential backoff with jitter, capped at 2s, grounded in the same
/// shape used for the dispatcher's attempt loop.
pub fn retry_backoff_delay(attempt_no: u32) -> Duration {
    let step = attempt_no.saturating_sub(1).min(6);
    let base_ms = 200u64;
    let backoff = base_ms.saturating_mul(1u64 << step);
    let jitter = rand::random::<u64>() % (base_ms + 1);
    Duration::from_millis((backoff + jitter).min(2_000))
}

pub async fn backoff_sleep(attempt_no: u32) {
    let delay = retry_backoff_delay(attempt_no);
    if delay.as_millis() > 0 {
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_marks_valid_and_terminal() {
        let outcome = classify_http_status(200);
        assert_eq!(outcome.retry, RetryAction::Terminal);
        assert_eq!(outcome.validity, ValidityEffect::MarkValid);
    }

    #[test]
    fn auth_failures_mark_invalid_and_move_to_next_key() {
        for status in [401, 403] {
            let outcome = classify_http_status(status);
            assert_eq!(outcome.retry, RetryAction::NextKey);
            assert_eq!(outcome.validity, ValidityEffect::MarkInvalid);
        }
    }

    #[test]
    fn rate_limit_allows_either_retry_path_without_touching_validity() {
        let outcome = classify_http_status(429);
        assert_eq!(outcome.retry, RetryAction::RetrySameOrNextKey);
        assert_eq!(outcome.validity, ValidityEffect::Unchanged);
    }

    #[test]
    fn server_errors_retry_same_key_only() {
        let outcome = classify_http_status(503);
        assert_eq!(outcome.retry, RetryAction::RetrySame);
        assert_eq!(outcome.validity, ValidityEffect::Unchanged);
    }

    #[test]
    fn client_request_errors_are_terminal() {
        for status in [400, 404, 422] {
            let outcome = classify_http_status(status);
            assert_eq!(outcome.retry, RetryAction::Terminal);
        }
    }

    #[test]
    fn transport_timeouts_retry_same_key() {
        let outcome = classify_failure(&UpstreamFailure::Transport {
            kind: TransportErrorKind::Timeout,
            message: "timed out".into(),
        });
        assert_eq!(outcome.retry, RetryAction::RetrySame);
    }

    #[test]
    fn cancellation_is_terminal_and_leaves_validity_untouched() {
        let outcome = classify_failure(&UpstreamFailure::Cancelled);
        assert_eq!(outcome.retry, RetryAction::Terminal);
        assert_eq!(outcome.validity, ValidityEffect::Unchanged);
    }
}
