use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "proxy_keys")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub name: String,
    #[sea_orm(unique_key = "proxy_key_token")]
    pub token: String,
    pub description: Option<String>,
    /// JSON array of group ids; empty ⇒ "all enabled groups".
    pub allowed_groups_json: Json,
    pub group_balance_policy: String,
    /// JSON object, group id (as string key) -> integer weight.
    pub group_weights_json: Json,
    pub rpm_limit: i32,
    pub enabled: bool,
    pub usage_count: i64,
    pub last_used_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
}

impl ActiveModelBehavior for ActiveModel {}
