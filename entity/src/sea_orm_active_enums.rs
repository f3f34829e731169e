use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Per-message enrichment lifecycle. Rows enter as `Pending`, are claimed to
/// `Processing` by the analyze route, and settle as `Enriched` or `Failed`.
/// Failed rows are only retried when something external re-queues them.
#[derive(Debug, Clone, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "Enum", enum_name = "ai_status")]
#[serde(rename_all = "snake_case")]
pub enum AiStatus {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "processing")]
    Processing,
    #[sea_orm(string_value = "enriched")]
    Enriched,
    #[sea_orm(string_value = "failed")]
    Failed,
}
