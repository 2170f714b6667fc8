use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "request_logs")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[sea_orm(unique_key = "request_logs_request_id")]
    pub request_id: String,
    pub proxy_key_id: i64,
    pub group_id: Option<i64>,
    pub provider_kind: Option<String>,
    pub model: Option<String>,
    pub method: String,
    pub endpoint: String,
    pub request_headers_json: Json,
    pub request_body: Vec<u8>,
    pub request_truncated: bool,
    pub response_headers_json: Option<Json>,
    pub response_body: Option<Vec<u8>>,
    pub response_truncated: bool,
    pub status_code: Option<i32>,
    pub duration_ms: Option<i64>,
    pub prompt_tokens: Option<i64>,
    pub completion_tokens: Option<i64>,
    pub total_tokens: Option<i64>,
    pub error_message: Option<String>,
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
    pub has_tools: bool,
    pub is_streaming: bool,
    pub created_at: OffsetDateTime,
    pub updated_at: Option<OffsetDateTime>,
}

impl ActiveModelBehavior for ActiveModel {}
