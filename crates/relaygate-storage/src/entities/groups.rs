use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "groups")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[sea_orm(unique_key = "group_name")]
    pub name: String,
    pub provider_kind: String,
    pub base_url: String,
    pub api_keys_json: Json,
    pub models_json: Json,
    pub aliases_json: Json,
    pub param_overrides_json: Option<Json>,
    pub headers_json: Json,
    pub balance_policy: String,
    pub retry_count: i32,
    pub connect_timeout_ms: i64,
    pub response_timeout_ms: i64,
    pub rpm_limit: i32,
    pub test_model: Option<String>,
    pub forward_proxy: Option<String>,
    pub fake_streaming: bool,
    pub enabled: bool,
    pub priority: i32,
    pub deleted_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    #[sea_orm(has_many)]
    pub key_validations: HasMany<super::key_validation::Entity>,
    #[sea_orm(has_many)]
    pub key_usage_stats: HasMany<super::key_usage_stats::Entity>,
    #[sea_orm(has_many)]
    pub health_check_results: HasMany<super::health_check_results::Entity>,
    #[sea_orm(has_many)]
    pub health_check_stats: HasMany<super::health_check_stats::Entity>,
}

impl ActiveModelBehavior for ActiveModel {}
