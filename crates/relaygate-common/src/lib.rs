//! Shared types for relaygate: identifiers, provider/policy enums, header
//! helpers, key hashing, and the merged process-wide global configuration.
//!
//! This crate intentionally stays free of any async runtime or HTTP client
//! dependency so every other crate in the workspace can depend on it.

pub mod config;
pub mod error;
pub mod headers;
pub mod keyhash;

pub use config::{GlobalConfig, GlobalConfigError, GlobalConfigPatch};
pub use error::{DispatchErrorKind, RelayError, RelayResult};
pub use headers::{Headers, header_get, header_remove, header_set};
pub use keyhash::key_hash;

/// Surrogate id for a `Group` row.
pub type GroupId = i64;
/// Surrogate id for a `ProxyKey` row.
pub type ProxyKeyId = i64;

/// Upstream-native request schema a group speaks, and a client targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    OpenAI,
    Anthropic,
    Gemini,
}

impl ProviderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProviderKind::OpenAI => "openai",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Gemini => "gemini",
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Balance policy for choosing a key within a group, or a group within a
/// proxy key's permit set. Closed tagged variant, dispatched on at
/// selection time, never subtyped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalancePolicy {
    RoundRobin,
    Random,
    Failover,
}

/// Group-selection policy attached to a `ProxyKey`. `Weighted` carries no
/// payload here; weights live in `ProxyKey::group_weights`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupSelectionPolicy {
    RoundRobin,
    Weighted,
    Random,
    Failover,
}
