use std::collections::HashMap;
use std::time::Duration;

use relaygate_common::{BalancePolicy, GroupSelectionPolicy, Headers, ProviderKind};
use relaygate_state::{Group, ProxyKey, Validity};
use sea_orm::sea_query::OnConflict;
use sea_orm::{ActiveValue, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter, Schema};
use time::OffsetDateTime;

use crate::db::connect_shared;
use crate::entities;

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Db(#[from] DbErr),
    #[error("invalid provider kind {0:?} in row {1}")]
    BadProviderKind(String, i64),
    #[error("invalid balance policy {0:?} in row {1}")]
    BadBalancePolicy(String, i64),
    #[error("invalid group-selection policy {0:?} in row {1}")]
    BadGroupSelectionPolicy(String, i64),
    #[error("malformed json in row {0}: {1}")]
    BadJson(i64, serde_json::Error),
}

fn provider_kind_str(kind: ProviderKind) -> &'static str {
    kind.as_str()
}

fn parse_provider_kind(raw: &str, row_id: i64) -> StorageResult<ProviderKind> {
    match raw {
        "openai" => Ok(ProviderKind::OpenAI),
        "anthropic" => Ok(ProviderKind::Anthropic),
        "gemini" => Ok(ProviderKind::Gemini),
        other => Err(StorageError::BadProviderKind(other.to_string(), row_id)),
    }
}

fn balance_policy_str(policy: BalancePolicy) -> &'static str {
    match policy {
        BalancePolicy::RoundRobin => "round_robin",
        BalancePolicy::Random => "random",
        BalancePolicy::Failover => "failover",
    }
}

fn parse_balance_policy(raw: &str, row_id: i64) -> StorageResult<BalancePolicy> {
    match raw {
        "round_robin" => Ok(BalancePolicy::RoundRobin),
        "random" => Ok(BalancePolicy::Random),
        "failover" => Ok(BalancePolicy::Failover),
        other => Err(StorageError::BadBalancePolicy(other.to_string(), row_id)),
    }
}

fn group_policy_str(policy: GroupSelectionPolicy) -> &'static str {
    match policy {
        GroupSelectionPolicy::RoundRobin => "round_robin",
        GroupSelectionPolicy::Weighted => "weighted",
        GroupSelectionPolicy::Random => "random",
        GroupSelectionPolicy::Failover => "failover",
    }
}

fn parse_group_policy(raw: &str, row_id: i64) -> StorageResult<GroupSelectionPolicy> {
    match raw {
        "round_robin" => Ok(GroupSelectionPolicy::RoundRobin),
        "weighted" => Ok(GroupSelectionPolicy::Weighted),
        "random" => Ok(GroupSelectionPolicy::Random),
        "failover" => Ok(GroupSelectionPolicy::Failover),
        other => Err(StorageError::BadGroupSelectionPolicy(other.to_string(), row_id)),
    }
}

fn headers_from_json(value: &serde_json::Value, row_id: i64) -> StorageResult<Headers> {
    serde_json::from_value(value.clone()).map_err(|e| StorageError::BadJson(row_id, e))
}

fn group_from_row(row: entities::groups::Model) -> StorageResult<Group> {
    let keys: Vec<String> =
        serde_json::from_value(row.api_keys_json.clone()).map_err(|e| StorageError::BadJson(row.id, e))?;
    let models: Vec<String> =
        serde_json::from_value(row.models_json.clone()).map_err(|e| StorageError::BadJson(row.id, e))?;
    let aliases: HashMap<String, String> =
        serde_json::from_value(row.aliases_json.clone()).map_err(|e| StorageError::BadJson(row.id, e))?;
    let custom_headers = headers_from_json(&row.headers_json, row.id)?;

    Ok(Group {
        id: row.id,
        identifier: row.name,
        provider_kind: parse_provider_kind(&row.provider_kind, row.id)?,
        base_url: row.base_url,
        keys,
        models,
        aliases,
        balance_policy: parse_balance_policy(&row.balance_policy, row.id)?,
        retry_count: row.retry_count.max(0) as u32,
        connect_timeout: Duration::from_millis(row.connect_timeout_ms.max(0) as u64),
        response_timeout: Duration::from_millis(row.response_timeout_ms.max(0) as u64),
        rpm_limit: row.rpm_limit.max(0) as u32,
        test_model: row.test_model,
        forward_proxy: row.forward_proxy,
        param_overrides: row.param_overrides_json,
        custom_headers,
        fake_streaming: row.fake_streaming,
        enabled: row.enabled,
        priority: row.priority,
        deleted_at: row.deleted_at,
    })
}

fn group_to_active(group: &Group) -> StorageResult<entities::groups::ActiveModel> {
    Ok(entities::groups::ActiveModel {
        id: ActiveValue::Set(group.id),
        name: ActiveValue::Set(group.identifier.clone()),
        provider_kind: ActiveValue::Set(provider_kind_str(group.provider_kind).to_string()),
        base_url: ActiveValue::Set(group.base_url.clone()),
        api_keys_json: ActiveValue::Set(serde_json::to_value(&group.keys).map_err(|e| StorageError::BadJson(group.id, e))?),
        models_json: ActiveValue::Set(serde_json::to_value(&group.models).map_err(|e| StorageError::BadJson(group.id, e))?),
        aliases_json: ActiveValue::Set(serde_json::to_value(&group.aliases).map_err(|e| StorageError::BadJson(group.id, e))?),
        param_overrides_json: ActiveValue::Set(group.param_overrides.clone()),
        headers_json: ActiveValue::Set(
            serde_json::to_value(&group.custom_headers).map_err(|e| StorageError::BadJson(group.id, e))?,
        ),
        balance_policy: ActiveValue::Set(balance_policy_str(group.balance_policy).to_string()),
        retry_count: ActiveValue::Set(group.retry_count as i32),
        connect_timeout_ms: ActiveValue::Set(group.connect_timeout.as_millis() as i64),
        response_timeout_ms: ActiveValue::Set(group.response_timeout.as_millis() as i64),
        rpm_limit: ActiveValue::Set(group.rpm_limit as i32),
        test_model: ActiveValue::Set(group.test_model.clone()),
        forward_proxy: ActiveValue::Set(group.forward_proxy.clone()),
        fake_streaming: ActiveValue::Set(group.fake_streaming),
        enabled: ActiveValue::Set(group.enabled),
        priority: ActiveValue::Set(group.priority),
        deleted_at: ActiveValue::Set(group.deleted_at),
        updated_at: ActiveValue::Set(OffsetDateTime::now_utc()),
        ..Default::default()
    })
}

fn proxy_key_from_row(row: entities::proxy_keys::Model) -> StorageResult<ProxyKey> {
    let permitted_groups: Vec<i64> =
        serde_json::from_value(row.allowed_groups_json.clone()).map_err(|e| StorageError::BadJson(row.id, e))?;
    let weights_by_string: HashMap<String, u32> =
        serde_json::from_value(row.group_weights_json.clone()).map_err(|e| StorageError::BadJson(row.id, e))?;
    let group_weights = weights_by_string
        .into_iter()
        .filter_map(|(k, v)| k.parse::<i64>().ok().map(|id| (id, v)))
        .collect();

    Ok(ProxyKey {
        id: row.id,
        token: row.token,
        name: row.name,
        permitted_groups,
        group_policy: parse_group_policy(&row.group_balance_policy, row.id)?,
        group_weights,
        rpm_limit: row.rpm_limit.max(0) as u32,
        enabled: row.enabled,
    })
}

/// Wraps a sea-orm connection and owns schema sync, the seed/reload
/// surface, and the row <-> domain-type conversions every sink needs.
#[derive(Clone)]
pub struct Storage {
    db: DatabaseConnection,
}

impl Storage {
    pub async fn connect(dsn: &str) -> StorageResult<Self> {
        let db = connect_shared(dsn).await?;
        Ok(Self { db })
    }

    pub fn from_connection(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    /// Registers and syncs every table relaygate owns. Matches the
    /// teacher's pattern of calling `Schema::sync` at boot rather than
    /// shipping a migration CLI.
    pub async fn sync(&self) -> StorageResult<()> {
        Schema::new(self.db.get_database_backend())
            .builder()
            .register(entities::Groups)
            .register(entities::ProxyKeys)
            .register(entities::KeyValidation)
            .register(entities::KeyUsageStats)
            .register(entities::RequestLogs)
            .register(entities::HealthCheckResults)
            .register(entities::HealthCheckStats)
            .sync(&self.db)
            .await?;
        Ok(())
    }

    /// Seeds `groups`/`proxy_keys` from in-process defaults the first
    /// time the tables are empty, then leaves existing rows untouched on
    /// subsequent boots. Stands in for a persistent config CRUD surface,
    /// which is explicitly out of scope.
    pub async fn seed_if_empty(&self, groups: &[Group], proxy_keys: &[ProxyKey]) -> StorageResult<()> {
        if entities::Groups::find().one(&self.db).await?.is_none() {
            for group in groups {
                self.upsert_group(group).await?;
            }
        }
        if entities::ProxyKeys::find().one(&self.db).await?.is_none() {
            for proxy_key in proxy_keys {
                self.upsert_proxy_key(proxy_key).await?;
            }
        }
        Ok(())
    }

    pub async fn upsert_group(&self, group: &Group) -> StorageResult<()> {
        use entities::groups::Column;
        let active = group_to_active(group)?;
        entities::Groups::insert(active)
            .on_conflict(
                OnConflict::column(Column::Id)
                    .update_columns([
                        Column::Name,
                        Column::ProviderKind,
                        Column::BaseUrl,
                        Column::ApiKeysJson,
                        Column::ModelsJson,
                        Column::AliasesJson,
                        Column::ParamOverridesJson,
                        Column::HeadersJson,
                        Column::BalancePolicy,
                        Column::RetryCount,
                        Column::ConnectTimeoutMs,
                        Column::ResponseTimeoutMs,
                        Column::RpmLimit,
                        Column::TestModel,
                        Column::ForwardProxy,
                        Column::FakeStreaming,
                        Column::Enabled,
                        Column::Priority,
                        Column::DeletedAt,
                        Column::UpdatedAt,
                    ])
                    .to_owned(),
            )
            .exec(&self.db)
            .await?;
        Ok(())
    }

    pub async fn upsert_proxy_key(&self, proxy_key: &ProxyKey) -> StorageResult<()> {
        use entities::proxy_keys::Column;
        let weights_by_string: HashMap<String, u32> = proxy_key
            .group_weights
            .iter()
            .map(|(id, w)| (id.to_string(), *w))
            .collect();
        let active = entities::proxy_keys::ActiveModel {
            id: ActiveValue::Set(proxy_key.id),
            name: ActiveValue::Set(proxy_key.name.clone()),
            token: ActiveValue::Set(proxy_key.token.clone()),
            description: ActiveValue::Set(None),
            allowed_groups_json: ActiveValue::Set(
                serde_json::to_value(&proxy_key.permitted_groups).map_err(|e| StorageError::BadJson(proxy_key.id, e))?,
            ),
            group_balance_policy: ActiveValue::Set(group_policy_str(proxy_key.group_policy).to_string()),
            group_weights_json: ActiveValue::Set(
                serde_json::to_value(&weights_by_string).map_err(|e| StorageError::BadJson(proxy_key.id, e))?,
            ),
            rpm_limit: ActiveValue::Set(proxy_key.rpm_limit as i32),
            enabled: ActiveValue::Set(proxy_key.enabled),
            ..Default::default()
        };
        entities::ProxyKeys::insert(active)
            .on_conflict(
                OnConflict::column(Column::Id)
                    .update_columns([
                        Column::Name,
                        Column::Token,
                        Column::AllowedGroupsJson,
                        Column::GroupBalancePolicy,
                        Column::GroupWeightsJson,
                        Column::RpmLimit,
                        Column::Enabled,
                    ])
                    .to_owned(),
            )
            .exec(&self.db)
            .await?;
        Ok(())
    }

    /// The read interface the dispatcher depends on: every routable
    /// group and every proxy key, as domain types ready for
    /// `Snapshot::build`.
    pub async fn load_routing_rows(&self) -> StorageResult<(Vec<Group>, Vec<ProxyKey>)> {
        let group_rows = entities::Groups::find().all(&self.db).await?;
        let groups = group_rows
            .into_iter()
            .map(group_from_row)
            .collect::<StorageResult<Vec<_>>>()?;

        let proxy_key_rows = entities::ProxyKeys::find()
            .filter(entities::proxy_keys::Column::Enabled.eq(true))
            .all(&self.db)
            .await?;
        let proxy_keys = proxy_key_rows
            .into_iter()
            .map(proxy_key_from_row)
            .collect::<StorageResult<Vec<_>>>()?;

        Ok((groups, proxy_keys))
    }

    /// Every persisted key-validity row, for hydrating
    /// `KeyStateStore` on boot.
    pub async fn load_key_validity(&self) -> StorageResult<Vec<(i64, String, relaygate_state::KeyValidity)>> {
        let rows = entities::KeyValidation::find().all(&self.db).await?;
        Ok(rows
            .into_iter()
            .map(|row| {
                let validity = match row.is_valid {
                    None => Validity::Unknown,
                    Some(true) => Validity::Valid,
                    Some(false) => Validity::Invalid,
                };
                let key_validity = relaygate_state::KeyValidity {
                    validity,
                    error_count: row.error_count.max(0) as u32,
                    last_status: row.last_status_code.map(|s| s as u16),
                    last_error: row.last_error,
                    last_validated_at: row.last_validated_at,
                };
                (row.group_id, row.api_key_hash, key_validity)
            })
            .collect())
    }

    /// Every persisted key-usage row, for hydrating `KeyStateStore` on
    /// boot alongside `load_key_validity`.
    pub async fn load_key_usage(&self) -> StorageResult<Vec<(i64, String, relaygate_state::KeyUsage)>> {
        let rows = entities::KeyUsageStats::find().all(&self.db).await?;
        Ok(rows
            .into_iter()
            .map(|row| {
                let usage = relaygate_state::KeyUsage {
                    total_uses: row.usage_count.max(0) as u64,
                    last_used_at: row.last_used_at,
                };
                (row.group_id, row.api_key_hash, usage)
            })
            .collect())
    }
}
