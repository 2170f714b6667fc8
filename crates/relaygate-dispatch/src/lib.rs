//! The request dispatcher (component E): selects a (group, key) pair,
//! executes the upstream round-trip, classifies the outcome, and retries
//! or fails over within a single global attempt budget.

pub mod auth;
pub mod classify;
pub mod context;
pub mod dispatcher;
pub mod fake_stream;
pub mod http;
pub mod param_override;
pub mod selection;

pub use classify::{Outcome, RetryAction, ValidityEffect};
pub use context::DispatchContext;
pub use dispatcher::{Dispatcher, DispatchOutcome, DispatchRequest, DispatchResponse, Endpoint};
pub use http::{
    HttpMethod, TransportErrorKind, UpstreamBody, UpstreamClient, UpstreamFailure,
    UpstreamHttpRequest, UpstreamHttpResponse, WreqUpstreamClient,
};
