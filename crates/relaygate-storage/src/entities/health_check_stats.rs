use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "health_check_stats")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[sea_orm(unique_key = "health_stats_subject")]
    pub group_id: i64,
    #[sea_orm(unique_key = "health_stats_subject")]
    pub check_type: String,
    #[sea_orm(unique_key = "health_stats_subject")]
    pub subject: String,
    pub success_count: i64,
    pub failure_count: i64,
    pub avg_latency_ms: f64,
    pub consecutive_failures: i32,
    pub updated_at: OffsetDateTime,
    #[sea_orm(belongs_to, from = "group_id", to = "id", on_delete = "Cascade")]
    pub group: HasOne<super::groups::Entity>,
}

impl ActiveModelBehavior for ActiveModel {}
