use async_trait::async_trait;
use relaygate_common::GroupId;
use relaygate_health::HealthSink;
use relaygate_log::{InsertRecord, LogEvent, LogSink, UpdateRecord};
use relaygate_state::{HealthCheckResult, KeyStateSink, KeyUsage, KeyValidity, Validity};
use sea_orm::sea_query::OnConflict;
use sea_orm::{ActiveValue, ColumnTrait, EntityTrait, QueryFilter};
use time::OffsetDateTime;

use crate::entities;
use crate::storage::Storage;

/// Durable mirror for the log pipeline (component C). Insert and Update
/// share one table; Insert does a plain append, Update is a targeted
/// column write keyed by `request_id` (never a full-row upsert, since the
/// two halves don't carry the same columns).
#[async_trait]
impl LogSink for Storage {
    async fn write_batch(&self, batch: &[LogEvent]) -> Result<(), String> {
        for event in batch {
            let result = match event {
                LogEvent::Insert(record) => write_insert(self, record).await,
                LogEvent::Update(record) => write_update(self, record).await,
            };
            result.map_err(|e| e.to_string())?;
        }
        Ok(())
    }
}

async fn write_insert(storage: &Storage, record: &InsertRecord) -> Result<(), sea_orm::DbErr> {
    let headers_json = serde_json::to_value(&record.request_headers).unwrap_or(serde_json::Value::Null);
    let active = entities::request_logs::ActiveModel {
        request_id: ActiveValue::Set(record.request_id.clone()),
        proxy_key_id: ActiveValue::Set(record.proxy_key_id),
        group_id: ActiveValue::Set(record.group_id),
        provider_kind: ActiveValue::Set(record.provider_kind.clone()),
        model: ActiveValue::Set(record.model.clone()),
        method: ActiveValue::Set(record.method.clone()),
        endpoint: ActiveValue::Set(record.endpoint.clone()),
        request_headers_json: ActiveValue::Set(headers_json),
        request_body: ActiveValue::Set(record.request_body.clone()),
        request_truncated: ActiveValue::Set(record.content_truncated),
        response_headers_json: ActiveValue::Set(None),
        response_body: ActiveValue::Set(None),
        response_truncated: ActiveValue::Set(false),
        status_code: ActiveValue::Set(None),
        duration_ms: ActiveValue::Set(None),
        prompt_tokens: ActiveValue::Set(None),
        completion_tokens: ActiveValue::Set(None),
        total_tokens: ActiveValue::Set(None),
        error_message: ActiveValue::Set(None),
        client_ip: ActiveValue::Set(record.client_ip.clone()),
        user_agent: ActiveValue::Set(record.user_agent.clone()),
        has_tools: ActiveValue::Set(record.has_tools),
        is_streaming: ActiveValue::Set(record.is_streaming),
        created_at: ActiveValue::Set(record.created_at),
        updated_at: ActiveValue::Set(None),
        ..Default::default()
    };
    entities::RequestLogs::insert(active)
        .on_conflict(
            OnConflict::column(entities::request_logs::Column::RequestId)
                .do_nothing()
                .to_owned(),
        )
        .exec(storage.connection())
        .await?;
    Ok(())
}

async fn write_update(storage: &Storage, record: &UpdateRecord) -> Result<(), sea_orm::DbErr> {
    let existing = entities::RequestLogs::find()
        .filter(entities::request_logs::Column::RequestId.eq(record.request_id.clone()))
        .one(storage.connection())
        .await?;
    let Some(existing) = existing else {
        // The Insert half raced with a retry and hasn't landed yet, or was
        // dropped by a full queue upstream — nothing to correlate against.
        return Ok(());
    };

    let response_headers_json = serde_json::to_value(&record.response_headers).ok();
    let mut active: entities::request_logs::ActiveModel = existing.into();
    active.response_headers_json = ActiveValue::Set(response_headers_json);
    active.response_body = ActiveValue::Set(Some(record.response_body.clone()));
    active.response_truncated = ActiveValue::Set(record.content_truncated);
    active.status_code = ActiveValue::Set(record.status_code.map(|s| s as i32));
    active.duration_ms = ActiveValue::Set(Some(record.duration_ms as i64));
    active.prompt_tokens = ActiveValue::Set(record.prompt_tokens.map(|v| v as i64));
    active.completion_tokens = ActiveValue::Set(record.completion_tokens.map(|v| v as i64));
    active.total_tokens = ActiveValue::Set(record.total_tokens.map(|v| v as i64));
    active.error_message = ActiveValue::Set(record.error_message.clone());
    active.updated_at = ActiveValue::Set(Some(OffsetDateTime::now_utc()));
    entities::RequestLogs::update(active).exec(storage.connection()).await?;
    Ok(())
}

/// Durable mirror for the key-state store (component B).
impl KeyStateSink for Storage {
    fn record_validity(&self, group_id: GroupId, key_hash: &str, validity: &KeyValidity) {
        let storage = self.clone();
        let key_hash = key_hash.to_string();
        let validity = validity.clone();
        tokio::spawn(async move {
            if let Err(err) = upsert_validity(&storage, group_id, &key_hash, &validity).await {
                tracing::warn!(error = %err, group_id, "key validity durable write failed");
            }
        });
    }

    fn record_usage(&self, group_id: GroupId, key_hash: &str, usage: &KeyUsage) {
        let storage = self.clone();
        let key_hash = key_hash.to_string();
        let usage = usage.clone();
        tokio::spawn(async move {
            if let Err(err) = upsert_usage(&storage, group_id, &key_hash, &usage).await {
                tracing::warn!(error = %err, group_id, "key usage durable write failed");
            }
        });
    }
}

async fn upsert_validity(storage: &Storage, group_id: GroupId, key_hash: &str, validity: &KeyValidity) -> Result<(), sea_orm::DbErr> {
    use entities::key_validation::Column;
    let is_valid = match validity.validity {
        Validity::Unknown => None,
        Validity::Valid => Some(true),
        Validity::Invalid => Some(false),
    };
    let active = entities::key_validation::ActiveModel {
        group_id: ActiveValue::Set(group_id),
        api_key_hash: ActiveValue::Set(key_hash.to_string()),
        provider_kind: ActiveValue::Set(String::new()),
        is_valid: ActiveValue::Set(is_valid),
        error_count: ActiveValue::Set(validity.error_count as i32),
        last_error: ActiveValue::Set(validity.last_error.clone()),
        last_status_code: ActiveValue::Set(validity.last_status.map(|s| s as i32)),
        last_validated_at: ActiveValue::Set(validity.last_validated_at),
        created_at: ActiveValue::Set(OffsetDateTime::now_utc()),
        ..Default::default()
    };
    entities::KeyValidation::insert(active)
        .on_conflict(
            OnConflict::columns([Column::GroupId, Column::ApiKeyHash])
                .update_columns([
                    Column::IsValid,
                    Column::ErrorCount,
                    Column::LastError,
                    Column::LastStatusCode,
                    Column::LastValidatedAt,
                ])
                .to_owned(),
        )
        .exec(storage.connection())
        .await?;
    Ok(())
}

async fn upsert_usage(storage: &Storage, group_id: GroupId, key_hash: &str, usage: &KeyUsage) -> Result<(), sea_orm::DbErr> {
    use entities::key_usage_stats::Column;
    let active = entities::key_usage_stats::ActiveModel {
        group_id: ActiveValue::Set(group_id),
        api_key_hash: ActiveValue::Set(key_hash.to_string()),
        usage_count: ActiveValue::Set(usage.total_uses as i64),
        last_used_at: ActiveValue::Set(usage.last_used_at),
        created_at: ActiveValue::Set(OffsetDateTime::now_utc()),
        updated_at: ActiveValue::Set(OffsetDateTime::now_utc()),
        ..Default::default()
    };
    entities::KeyUsageStats::insert(active)
        .on_conflict(
            OnConflict::columns([Column::GroupId, Column::ApiKeyHash])
                .update_columns([Column::UsageCount, Column::LastUsedAt, Column::UpdatedAt])
                .to_owned(),
        )
        .exec(storage.connection())
        .await?;
    Ok(())
}

/// Durable mirror for the health scanner (component D).
#[async_trait]
impl HealthSink for Storage {
    async fn write_results(&self, batch: &[HealthCheckResult]) {
        for result in batch {
            if let Err(err) = insert_health_result(self, result).await {
                tracing::warn!(error = %err, group_id = result.group_id, "health result durable write failed");
            }
        }
    }
}

async fn insert_health_result(storage: &Storage, result: &HealthCheckResult) -> Result<(), sea_orm::DbErr> {
    let check_type = match result.check_type {
        relaygate_state::HealthCheckType::Provider => "provider",
        relaygate_state::HealthCheckType::Key => "key",
        relaygate_state::HealthCheckType::Model => "model",
    };
    let active = entities::health_check_results::ActiveModel {
        group_id: ActiveValue::Set(result.group_id),
        check_type: ActiveValue::Set(check_type.to_string()),
        subject: ActiveValue::Set(result.subject.clone()),
        success: ActiveValue::Set(result.success),
        latency_ms: ActiveValue::Set(result.latency_ms.map(|v| v as i64)),
        message: ActiveValue::Set(result.message.clone()),
        observed_at: ActiveValue::Set(result.observed_at),
        ..Default::default()
    };
    entities::HealthCheckResults::insert(active).exec(storage.connection()).await?;

    upsert_health_stats(storage, result).await
}

async fn upsert_health_stats(storage: &Storage, result: &HealthCheckResult) -> Result<(), sea_orm::DbErr> {
    use entities::health_check_stats::Column;
    let check_type = match result.check_type {
        relaygate_state::HealthCheckType::Provider => "provider",
        relaygate_state::HealthCheckType::Key => "key",
        relaygate_state::HealthCheckType::Model => "model",
    };
    let existing = entities::HealthCheckStats::find()
        .filter(Column::GroupId.eq(result.group_id))
        .filter(Column::CheckType.eq(check_type))
        .filter(Column::Subject.eq(result.subject.clone()))
        .one(storage.connection())
        .await?;

    let (success_count, failure_count, avg_latency_ms, consecutive_failures) = match &existing {
        Some(row) => {
            let total = row.success_count + row.failure_count + 1;
            let latency = result.latency_ms.unwrap_or(0) as f64;
            let avg = if total > 0 {
                row.avg_latency_ms + (latency - row.avg_latency_ms) / total as f64
            } else {
                latency
            };
            if result.success {
                (row.success_count + 1, row.failure_count, avg, 0)
            } else {
                (row.success_count, row.failure_count + 1, avg, row.consecutive_failures + 1)
            }
        }
        None => {
            let latency = result.latency_ms.unwrap_or(0) as f64;
            if result.success {
                (1, 0, latency, 0)
            } else {
                (0, 1, latency, 1)
            }
        }
    };

    let mut active = entities::health_check_stats::ActiveModel {
        group_id: ActiveValue::Set(result.group_id),
        check_type: ActiveValue::Set(check_type.to_string()),
        subject: ActiveValue::Set(result.subject.clone()),
        success_count: ActiveValue::Set(success_count),
        failure_count: ActiveValue::Set(failure_count),
        avg_latency_ms: ActiveValue::Set(avg_latency_ms),
        consecutive_failures: ActiveValue::Set(consecutive_failures),
        updated_at: ActiveValue::Set(result.observed_at),
        ..Default::default()
    };
    if let Some(row) = existing {
        active.id = ActiveValue::Set(row.id);
    }

    entities::HealthCheckStats::insert(active)
        .on_conflict(
            OnConflict::columns([Column::GroupId, Column::CheckType, Column::Subject])
                .update_columns([
                    Column::SuccessCount,
                    Column::FailureCount,
                    Column::AvgLatencyMs,
                    Column::ConsecutiveFailures,
                    Column::UpdatedAt,
                ])
                .to_owned(),
        )
        .exec(storage.connection())
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use relaygate_log::InsertRecord;
    use relaygate_state::HealthCheckType;
    use std::time::Duration;
    use tokio::time::sleep;

    // `Storage::connect` routes through `db::connect_shared`'s single-slot
    // cache, so every call with the same DSN hands back the same
    // connection; tests need their own private database, so open one
    // directly instead.
    async fn test_storage() -> Storage {
        let db = sea_orm::Database::connect("sqlite::memory:").await.unwrap();
        let storage = Storage::from_connection(db);
        storage.sync().await.unwrap();
        storage
    }

    #[tokio::test]
    async fn insert_then_update_correlate_by_request_id() {
        let storage = test_storage().await;
        let insert = InsertRecord {
            request_id: "req-1".into(),
            proxy_key_id: 1,
            group_id: Some(1),
            provider_kind: Some("openai".into()),
            model: Some("gpt-4o".into()),
            method: "POST".into(),
            endpoint: "/v1/chat/completions".into(),
            request_headers: vec![],
            request_body: b"{}".to_vec(),
            content_truncated: false,
            is_streaming: false,
            has_tools: false,
            client_ip: None,
            user_agent: None,
            created_at: OffsetDateTime::now_utc(),
        };
        write_insert(&storage, &insert).await.unwrap();

        let update = relaygate_log::UpdateRecord {
            request_id: "req-1".into(),
            status_code: Some(200),
            duration_ms: 42,
            response_headers: vec![],
            response_body: b"{\"ok\":true}".to_vec(),
            content_truncated: false,
            prompt_tokens: Some(10),
            completion_tokens: Some(5),
            total_tokens: Some(15),
            error_message: None,
        };
        write_update(&storage, &update).await.unwrap();

        let row = entities::RequestLogs::find()
            .filter(entities::request_logs::Column::RequestId.eq("req-1"))
            .one(storage.connection())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status_code, Some(200));
        assert_eq!(row.total_tokens, Some(15));
    }

    #[tokio::test]
    async fn update_with_no_matching_insert_is_a_noop() {
        let storage = test_storage().await;
        let update = relaygate_log::UpdateRecord {
            request_id: "missing".into(),
            status_code: Some(500),
            duration_ms: 1,
            response_headers: vec![],
            response_body: vec![],
            content_truncated: false,
            prompt_tokens: None,
            completion_tokens: None,
            total_tokens: None,
            error_message: Some("boom".into()),
        };
        write_update(&storage, &update).await.unwrap();
        let count = entities::RequestLogs::find().all(storage.connection()).await.unwrap().len();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn key_state_sink_durably_records_validity() {
        let storage = test_storage().await;
        let validity = KeyValidity {
            validity: Validity::Invalid,
            error_count: 1,
            last_status: Some(401),
            last_error: Some("bad key".into()),
            last_validated_at: Some(OffsetDateTime::now_utc()),
        };
        storage.record_validity(1, "hash-a", &validity);
        sleep(Duration::from_millis(50)).await;

        let row = entities::KeyValidation::find()
            .filter(entities::key_validation::Column::ApiKeyHash.eq("hash-a"))
            .one(storage.connection())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.is_valid, Some(false));
        assert_eq!(row.last_status_code, Some(401));
    }

    #[tokio::test]
    async fn health_sink_accumulates_stats_across_results() {
        let storage = test_storage().await;
        let result_ok = HealthCheckResult {
            group_id: 1,
            check_type: HealthCheckType::Provider,
            subject: "g1".into(),
            success: true,
            latency_ms: Some(20),
            message: None,
            observed_at: OffsetDateTime::now_utc(),
        };
        let result_fail = HealthCheckResult {
            success: false,
            message: Some("http 503".into()),
            ..result_ok.clone()
        };
        storage.write_results(&[result_ok, result_fail]).await;

        let stats = entities::HealthCheckStats::find().all(storage.connection()).await.unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].success_count, 1);
        assert_eq!(stats[0].failure_count, 1);
        assert_eq!(stats[0].consecutive_failures, 1);
    }
}
