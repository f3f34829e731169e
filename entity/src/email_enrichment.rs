use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// AI-derived metadata for one message. One row per
/// `(user_id, outlook_message_id)`, upserted whole on that conflict key
/// rather than merged field by field.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "email_enrichment")]
#[serde(rename_all = "camelCase")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub user_id: String,
    pub outlook_message_id: String,
    pub priority_score: i32,
    pub priority_reason: Option<String>,
    pub sentiment: String,
    pub category: String,
    pub cluster_label: Option<String>,
    pub summary: Option<String>,
    /// List of `{task, deadline, priority}` objects.
    pub action_items: Option<Json>,
    /// List of `{date, description, type}` objects.
    pub key_dates: Option<Json>,
    pub suggested_tags: Option<Json>,
    pub needs_reply: bool,
    pub estimated_read_minutes: Option<i32>,
    pub analysis_version: String,
    pub model_id: Option<String>,
    pub analyzed_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
