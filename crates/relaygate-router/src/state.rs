use std::sync::Arc;
use std::time::Duration;

use relaygate_dispatch::Dispatcher;
use relaygate_state::SnapshotPublisher;

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub snapshot: Arc<SnapshotPublisher>,
    pub config: RouterConfig,
}

#[derive(Debug, Clone, Copy)]
pub struct RouterConfig {
    /// Ceiling on how long a single request (across every retry/failover
    /// attempt) is allowed to run before `DispatchContext::is_expired`
    /// trips and the dispatcher gives up with `Timeout`.
    pub request_timeout: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self { request_timeout: Duration::from_secs(600) }
    }
}
