use std::collections::HashMap;
use std::time::Duration;

use relaygate_common::{BalancePolicy, GroupId, GroupSelectionPolicy, Headers, ProviderKind, ProxyKeyId};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// A named provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub id: GroupId,
    pub identifier: String,
    pub provider_kind: ProviderKind,
    pub base_url: String,
    /// Ordered list of raw upstream API keys. Never logged or persisted
    /// in plaintext outside this config row; only their `key_hash` shows
    /// up in `KeyValidity`/`KeyUsage`/logs.
    pub keys: Vec<String>,
    /// Models this group can serve upstream, used for candidate filtering
    /// and alias resolution targets.
    pub models: Vec<String>,
    /// Requested-model -> canonical-upstream-model rewrite map.
    pub aliases: HashMap<String, String>,
    pub balance_policy: BalancePolicy,
    pub retry_count: u32,
    pub connect_timeout: Duration,
    pub response_timeout: Duration,
    /// 0 = unlimited.
    pub rpm_limit: u32,
    pub test_model: Option<String>,
    pub forward_proxy: Option<String>,
    /// JSON object merged into outbound request bodies; a `null` value
    /// at a key deletes that key from the request.
    pub param_overrides: Option<serde_json::Value>,
    pub custom_headers: Headers,
    pub fake_streaming: bool,
    pub enabled: bool,
    pub priority: i32,
    pub deleted_at: Option<OffsetDateTime>,
}

impl Group {
    /// `enabled ∧ ¬deleted` groups are routable; others are invisible to
    /// the dispatcher.
    pub fn is_routable(&self) -> bool {
        self.enabled && self.deleted_at.is_none()
    }

    /// `resolve(resolve(m)) = resolve(m)` — alias rewrite is idempotent
    /// Requested model -> canonical upstream model, or the
    /// input unchanged if there's no alias.
    pub fn resolve_model<'a>(&'a self, requested: &'a str) -> &'a str {
        self.aliases
            .get(requested)
            .map(String::as_str)
            .unwrap_or(requested)
    }

    pub fn supports_model(&self, resolved_model: &str) -> bool {
        self.models.iter().any(|m| m == resolved_model)
    }
}

/// Client-facing credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyKey {
    pub id: ProxyKeyId,
    pub token: String,
    pub name: String,
    /// Empty set ⇒ "all enabled groups".
    pub permitted_groups: Vec<GroupId>,
    pub group_policy: GroupSelectionPolicy,
    /// Only consulted under `GroupSelectionPolicy::Weighted`; absent
    /// weight ⇒ 1. Invariant: every key here must name a group in
    /// `permitted_groups`, unless that set is empty.
    pub group_weights: HashMap<GroupId, u32>,
    /// 0 = unlimited.
    pub rpm_limit: u32,
    pub enabled: bool,
}

impl ProxyKey {
    pub fn permits(&self, group_id: GroupId) -> bool {
        self.permitted_groups.is_empty() || self.permitted_groups.contains(&group_id)
    }

    pub fn weight_of(&self, group_id: GroupId) -> u32 {
        self.group_weights.get(&group_id).copied().unwrap_or(1)
    }
}

/// Per-(group, keyHash) validity verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Validity {
    Unknown,
    Valid,
    Invalid,
}

/// Extended validity record with diagnostic fields, as read from
/// `relaygate-storage`'s `key_validation` table or the in-memory cell.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyValidity {
    pub validity: Validity,
    pub error_count: u32,
    pub last_status: Option<u16>,
    pub last_error: Option<String>,
    pub last_validated_at: Option<OffsetDateTime>,
}

impl Default for KeyValidity {
    fn default() -> Self {
        Self {
            validity: Validity::Unknown,
            error_count: 0,
            last_status: None,
            last_error: None,
            last_validated_at: None,
        }
    }
}

/// Per-(group, keyHash) usage counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeyUsage {
    pub total_uses: u64,
    pub last_used_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthCheckType {
    Provider,
    Key,
    Model,
}

/// Append-only probe observation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub group_id: GroupId,
    pub check_type: HealthCheckType,
    pub subject: String,
    pub success: bool,
    pub latency_ms: Option<u64>,
    pub message: Option<String>,
    pub observed_at: OffsetDateTime,
}

/// Rolled-up counters from repeated probe observations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthCheckStats {
    pub success_count: u64,
    pub failure_count: u64,
    pub avg_latency_ms: f64,
    pub consecutive_failures: u32,
}

impl HealthCheckStats {
    pub fn record(&mut self, success: bool, latency_ms: Option<u64>) {
        if success {
            self.success_count += 1;
            self.consecutive_failures = 0;
        } else {
            self.failure_count += 1;
            self.consecutive_failures += 1;
        }
        if let Some(latency) = latency_ms {
            let total = self.success_count + self.failure_count;
            if total == 1 {
                self.avg_latency_ms = latency as f64;
            } else {
                self.avg_latency_ms += (latency as f64 - self.avg_latency_ms) / total as f64;
            }
        }
    }
}

/// Outcome of a single axis after one scan cycle, purely for human
/// diagnosis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthAnalysis {
    pub group_id: GroupId,
    pub provider_healthy: bool,
    pub keys_healthy: bool,
    pub models_healthy: bool,
    pub inconsistent: bool,
    pub reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(aliases: &[(&str, &str)], models: &[&str]) -> Group {
        Group {
            id: 1,
            identifier: "g1".into(),
            provider_kind: ProviderKind::OpenAI,
            base_url: "https://api.openai.com".into(),
            keys: vec!["sk-1".into()],
            models: models.iter().map(|m| m.to_string()).collect(),
            aliases: aliases
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            balance_policy: BalancePolicy::RoundRobin,
            retry_count: 2,
            connect_timeout: Duration::from_secs(5),
            response_timeout: Duration::from_secs(60),
            rpm_limit: 0,
            test_model: None,
            forward_proxy: None,
            param_overrides: None,
            custom_headers: Vec::new(),
            fake_streaming: false,
            enabled: true,
            priority: 0,
            deleted_at: None,
        }
    }

    #[test]
    fn alias_resolution_is_idempotent() {
        let g = group(&[("gpt-latest", "gpt-4o")], &["gpt-4o"]);
        let once = g.resolve_model("gpt-latest");
        let twice = g.resolve_model(once);
        assert_eq!(once, "gpt-4o");
        assert_eq!(once, twice);
    }

    #[test]
    fn routable_requires_enabled_and_not_deleted() {
        let mut g = group(&[], &["gpt-4o"]);
        assert!(g.is_routable());
        g.enabled = false;
        assert!(!g.is_routable());
        g.enabled = true;
        g.deleted_at = Some(OffsetDateTime::UNIX_EPOCH);
        assert!(!g.is_routable());
    }
}
