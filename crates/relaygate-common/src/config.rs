use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum GlobalConfigError {
    #[error("missing required global config field: {0}")]
    MissingField(&'static str),
}

/// Final, merged global configuration used by the running process.
///
/// Merge order: CLI > ENV > DB, then the merged result is persisted back
/// to the DB so the next boot starts from the same values (mirrors the
/// teacher's `bootstrap` precedence).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalConfig {
    pub host: String,
    pub port: u16,
    /// Database DSN used for this process.
    pub dsn: String,
    /// Optional outbound forward proxy applied when a group has none of
    /// its own configured.
    pub default_proxy: Option<String>,
    /// Whether request/response bodies are redacted in log records.
    pub redact_sensitive_logs: bool,
}

/// Optional layer used while merging CLI/ENV/DB config sources.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GlobalConfigPatch {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub dsn: Option<String>,
    pub default_proxy: Option<String>,
    pub redact_sensitive_logs: Option<bool>,
}

impl GlobalConfigPatch {
    pub fn overlay(&mut self, other: GlobalConfigPatch) {
        if other.host.is_some() {
            self.host = other.host;
        }
        if other.port.is_some() {
            self.port = other.port;
        }
        if other.dsn.is_some() {
            self.dsn = other.dsn;
        }
        if other.default_proxy.is_some() {
            self.default_proxy = other.default_proxy;
        }
        if other.redact_sensitive_logs.is_some() {
            self.redact_sensitive_logs = other.redact_sensitive_logs;
        }
    }

    pub fn into_config(self) -> Result<GlobalConfig, GlobalConfigError> {
        Ok(GlobalConfig {
            host: self.host.unwrap_or_else(|| "0.0.0.0".to_string()),
            port: self.port.unwrap_or(8080),
            dsn: self.dsn.ok_or(GlobalConfigError::MissingField("dsn"))?,
            default_proxy: self.default_proxy,
            redact_sensitive_logs: self.redact_sensitive_logs.unwrap_or(true),
        })
    }
}

impl From<GlobalConfig> for GlobalConfigPatch {
    fn from(value: GlobalConfig) -> Self {
        Self {
            host: Some(value.host),
            port: Some(value.port),
            dsn: Some(value.dsn),
            default_proxy: value.default_proxy,
            redact_sensitive_logs: Some(value.redact_sensitive_logs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlay_prefers_later_values_when_present() {
        let mut base = GlobalConfigPatch {
            host: Some("0.0.0.0".into()),
            port: Some(8080),
            dsn: Some("sqlite://base.db".into()),
            default_proxy: None,
            redact_sensitive_logs: Some(true),
        };
        base.overlay(GlobalConfigPatch {
            port: Some(9090),
            ..Default::default()
        });
        assert_eq!(base.port, Some(9090));
        assert_eq!(base.host.as_deref(), Some("0.0.0.0"));
    }

    #[test]
    fn into_config_requires_dsn() {
        let patch = GlobalConfigPatch::default();
        assert!(matches!(
            patch.into_config(),
            Err(GlobalConfigError::MissingField("dsn"))
        ));
    }
}
