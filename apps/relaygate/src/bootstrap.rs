use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use relaygate_common::{GlobalConfig, GlobalConfigPatch};
use relaygate_dispatch::{Dispatcher, UpstreamClient, WreqUpstreamClient};
use relaygate_health::{HealthScanner, HealthScannerConfig};
use relaygate_log::{LogPipeline, LogPipelineConfig};
use relaygate_state::{KeyStateStore, SnapshotPublisher};
use relaygate_storage::{Storage, hydrate_key_state, load_and_publish, spawn_snapshot_poller};

/// Mirrors the teacher's `bootstrap::CliArgs`: every field is optional at
/// the `clap` layer so CLI/ENV absence can fall through to a default or a
/// hard error, rather than `clap` itself rejecting a missing flag.
#[derive(Debug, Clone, Parser)]
#[command(name = "relaygate", version, about = "Multi-tenant reverse proxy and request router for LLM HTTP APIs")]
pub struct CliArgs {
    /// Database DSN (sqlite or postgres, via sea-orm).
    #[arg(long, env = "RELAYGATE_DSN")]
    pub dsn: Option<String>,

    /// Bind host.
    #[arg(long, env = "RELAYGATE_HOST")]
    pub host: Option<String>,

    /// Bind port.
    #[arg(long, env = "RELAYGATE_PORT")]
    pub port: Option<String>,

    /// Outbound forward proxy applied to groups with none of their own.
    #[arg(long, env = "RELAYGATE_PROXY")]
    pub proxy: Option<String>,

    /// Redact sensitive fields in logged request/response bodies.
    #[arg(long, env = "RELAYGATE_REDACT_SENSITIVE_LOGS")]
    pub redact_sensitive_logs: Option<String>,

    /// Path to a JSON file with `{"groups": [...], "proxy_keys": [...]}`
    /// seed rows, loaded only when both tables are empty. Stands in for
    /// the out-of-scope config CRUD surface.
    #[arg(long, env = "RELAYGATE_SEED_FILE")]
    pub seed_file: Option<String>,

    /// How often the routing snapshot re-reads `groups`/`proxy_keys`.
    #[arg(long, env = "RELAYGATE_SNAPSHOT_POLL_SECS", default_value_t = 15)]
    pub snapshot_poll_secs: u64,

    /// Per-request deadline across every retry/failover attempt.
    #[arg(long, env = "RELAYGATE_REQUEST_TIMEOUT_SECS", default_value_t = 600)]
    pub request_timeout_secs: u64,
}

#[derive(serde::Deserialize)]
struct SeedFile {
    #[serde(default)]
    groups: Vec<relaygate_state::Group>,
    #[serde(default)]
    proxy_keys: Vec<relaygate_state::ProxyKey>,
}

pub struct Bootstrap {
    pub storage: Storage,
    pub dispatcher: Arc<Dispatcher>,
    pub snapshot: Arc<SnapshotPublisher>,
    pub key_state: Arc<KeyStateStore>,
    pub log: Arc<LogPipeline>,
    pub health_scanner: Arc<HealthScanner>,
    pub global: GlobalConfig,
}

pub async fn bootstrap_from_env() -> anyhow::Result<Bootstrap> {
    let args = CliArgs::parse();
    bootstrap(args).await
}

pub async fn bootstrap(args: CliArgs) -> anyhow::Result<Bootstrap> {
    let dsn = sanitize_dsn_value(args.dsn.clone());
    let host = sanitize_optional_env_value(args.host.clone());
    let port = parse_u16_env_value(args.port.clone(), "RELAYGATE_PORT")?;
    let proxy = sanitize_optional_env_value(args.proxy.clone());
    let redact_sensitive_logs =
        parse_bool_env_value(args.redact_sensitive_logs.clone(), "RELAYGATE_REDACT_SENSITIVE_LOGS")?;

    ensure_sqlite_parent_dir(&dsn)?;

    let storage = Storage::connect(&dsn).await.context("connect storage")?;
    storage.sync().await.context("schema sync")?;

    // No db-resident global_config row in this schema (see DESIGN.md): the
    // merge collapses to CLI > ENV, matching clap's own precedence.
    let mut merged = GlobalConfigPatch::default();
    merged.overlay(GlobalConfigPatch {
        host,
        port,
        dsn: Some(dsn),
        default_proxy: proxy,
        redact_sensitive_logs,
    });
    let global = merged.into_config().context("finalize merged global config")?;

    if let Some(path) = &args.seed_file {
        let seed = load_seed_file(path).context("load seed file")?;
        storage.seed_if_empty(&seed.groups, &seed.proxy_keys).await.context("seed groups/proxy_keys")?;
    }

    let snapshot = Arc::new(SnapshotPublisher::default());
    load_and_publish(&storage, &snapshot).await.context("load initial snapshot")?;

    let key_state = Arc::new(KeyStateStore::new(Some(Arc::new(storage.clone()))));
    hydrate_key_state(&storage, &key_state).await.context("hydrate key state")?;

    spawn_snapshot_poller(
        storage.clone(),
        snapshot.clone(),
        Duration::from_secs(args.snapshot_poll_secs.max(1)),
    );

    let log = Arc::new(LogPipeline::spawn(Arc::new(storage.clone()), LogPipelineConfig::default()));

    let client: Arc<dyn UpstreamClient> = Arc::new(WreqUpstreamClient::new(Duration::from_secs(60)));
    let dispatcher = Arc::new(Dispatcher::new(snapshot.clone(), key_state.clone(), log.clone(), client));

    let health_scanner = HealthScanner::spawn(
        snapshot.clone(),
        key_state.clone(),
        Some(Arc::new(storage.clone())),
        HealthScannerConfig::default(),
    );

    Ok(Bootstrap { storage, dispatcher, snapshot, key_state, log, health_scanner, global })
}

fn load_seed_file(path: &str) -> anyhow::Result<SeedFile> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("read seed file {path}"))?;
    serde_json::from_str(&raw).with_context(|| format!("parse seed file {path}"))
}

fn sanitize_optional_env_value(value: Option<String>) -> Option<String> {
    let trimmed = value?.trim().to_string();
    if trimmed.is_empty() {
        return None;
    }
    // Some PaaS systems inject unresolved placeholders like `${VAR}`;
    // treat them as "not set" so startup doesn't fail on parsing.
    if trimmed.starts_with("${") && trimmed.ends_with('}') {
        return None;
    }
    Some(trimmed)
}

fn sanitize_dsn_value(value: Option<String>) -> String {
    sanitize_optional_env_value(value).unwrap_or_else(default_dsn)
}

fn default_dsn() -> String {
    if let Some(data_dir) = sanitize_optional_env_value(std::env::var("RELAYGATE_DATA_DIR").ok()) {
        let dir = data_dir.trim_end_matches('/');
        return format!("sqlite://{dir}/relaygate.db?mode=rwc");
    }
    "sqlite://relaygate.db?mode=rwc".to_string()
}

fn ensure_sqlite_parent_dir(dsn: &str) -> anyhow::Result<()> {
    let Some(db_path) = sqlite_file_path_from_dsn(dsn) else {
        return Ok(());
    };
    let Some(parent) = db_path.parent() else {
        return Ok(());
    };
    if parent.as_os_str().is_empty() {
        return Ok(());
    }
    std::fs::create_dir_all(parent).with_context(|| format!("create sqlite parent dir {}", parent.display()))?;
    Ok(())
}

fn sqlite_file_path_from_dsn(dsn: &str) -> Option<PathBuf> {
    let rest = dsn.strip_prefix("sqlite:")?;
    let path_part = rest.split(['?', '#']).next()?.trim();
    if path_part.is_empty() {
        return None;
    }
    let mut normalized = path_part;
    if let Some(stripped) = normalized.strip_prefix("//") {
        normalized = stripped;
    }
    if normalized.to_ascii_lowercase() == ":memory:" {
        return None;
    }
    Some(PathBuf::from(normalized))
}

fn parse_u16_env_value(value: Option<String>, env_name: &str) -> anyhow::Result<Option<u16>> {
    let Some(raw) = sanitize_optional_env_value(value) else {
        return Ok(None);
    };
    let parsed = raw.parse::<u16>().with_context(|| format!("invalid {env_name} value: {raw}"))?;
    Ok(Some(parsed))
}

fn parse_bool_env_value(value: Option<String>, env_name: &str) -> anyhow::Result<Option<bool>> {
    let Some(raw) = sanitize_optional_env_value(value) else {
        return Ok(None);
    };
    let parsed = match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => return Err(anyhow::anyhow!("invalid {env_name} value: {raw}")),
    };
    Ok(Some(parsed))
}

#[cfg(test)]
mod tests {
    use super::sqlite_file_path_from_dsn;

    #[test]
    fn sqlite_dsn_resolves_relative_path() {
        let path = sqlite_file_path_from_dsn("sqlite://relaygate.db?mode=rwc").unwrap();
        assert_eq!(path.to_string_lossy(), "relaygate.db");
    }

    #[test]
    fn sqlite_dsn_resolves_absolute_path() {
        let path = sqlite_file_path_from_dsn("sqlite://app/data/relaygate.db?mode=rwc").unwrap();
        assert_eq!(path.to_string_lossy(), "/app/data/relaygate.db");
    }

    #[test]
    fn sqlite_memory_dsn_is_ignored() {
        assert!(sqlite_file_path_from_dsn("sqlite::memory:").is_none());
        assert!(sqlite_file_path_from_dsn("sqlite://:memory:").is_none());
    }
}
