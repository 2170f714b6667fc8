use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "key_validation")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[sea_orm(unique_key = "key_validation_subject")]
    pub group_id: i64,
    #[sea_orm(unique_key = "key_validation_subject")]
    pub api_key_hash: String,
    pub provider_kind: String,
    /// `None` = `Validity::Unknown`, `Some(true)` = `Valid`, `Some(false)` = `Invalid`.
    pub is_valid: Option<bool>,
    pub error_count: i32,
    pub last_error: Option<String>,
    pub last_status_code: Option<i32>,
    pub last_validated_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    #[sea_orm(belongs_to, from = "group_id", to = "id", on_delete = "Cascade")]
    pub group: HasOne<super::groups::Entity>,
}

impl ActiveModelBehavior for ActiveModel {}
