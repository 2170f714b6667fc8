use std::time::{Duration, Instant};

use relaygate_common::ProxyKeyId;
use tokio_util::sync::CancellationToken;

/// Per-request context threaded through selection, the retry loop, and
/// logging. Built once at the router boundary and never mutated.
#[derive(Clone)]
pub struct DispatchContext {
    pub request_id: String,
    pub trace_id: String,
    pub proxy_key_id: ProxyKeyId,
    pub deadline: Instant,
    pub cancellation: CancellationToken,
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
}

impl DispatchContext {
    pub fn new(
        request_id: String,
        proxy_key_id: ProxyKeyId,
        overall_timeout: Duration,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            trace_id: request_id.clone(),
            request_id,
            proxy_key_id,
            deadline: Instant::now() + overall_timeout,
            cancellation,
            client_ip: None,
            user_agent: None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }
}
