use chrono::Utc;
use entity::email_enrichment;
use entity::prelude::*;
use sea_orm::sea_query::OnConflict;
use sea_orm::{ActiveValue::Set, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter};

use crate::error::AppResult;
use crate::prompt::combined::EmailAnalysis;
use crate::server_config::cfg;

pub struct EnrichmentCtrl;

impl EnrichmentCtrl {
    pub async fn get_all_by_user(
        conn: &DatabaseConnection,
        user_id: &str,
    ) -> AppResult<Vec<email_enrichment::Model>> {
        let rows = EmailEnrichment::find()
            .filter(email_enrichment::Column::UserId.eq(user_id))
            .all(conn)
            .await?;

        Ok(rows)
    }

    pub async fn get_by_message_ids(
        conn: &DatabaseConnection,
        user_id: &str,
        outlook_message_ids: &[String],
    ) -> AppResult<Vec<email_enrichment::Model>> {
        if outlook_message_ids.is_empty() {
            return Ok(Vec::new());
        }

        let rows = EmailEnrichment::find()
            .filter(email_enrichment::Column::UserId.eq(user_id))
            .filter(email_enrichment::Column::OutlookMessageId.is_in(outlook_message_ids))
            .all(conn)
            .await?;

        Ok(rows)
    }

    /// Persist analysis results, replacing any prior row for the same
    /// `(user_id, outlook_message_id)` wholesale.
    pub async fn upsert_many(
        conn: &DatabaseConnection,
        user_id: &str,
        analyses: &[(String, EmailAnalysis)],
    ) -> AppResult<u64> {
        if analyses.is_empty() {
            return Ok(0);
        }

        let models: Vec<email_enrichment::ActiveModel> = analyses
            .iter()
            .map(|(message_id, analysis)| build_active_model(user_id, message_id, analysis))
            .collect();
        let count = models.len() as u64;

        EmailEnrichment::insert_many(models)
            .on_conflict(
                OnConflict::columns([
                    email_enrichment::Column::UserId,
                    email_enrichment::Column::OutlookMessageId,
                ])
                .update_columns([
                    email_enrichment::Column::PriorityScore,
                    email_enrichment::Column::PriorityReason,
                    email_enrichment::Column::Sentiment,
                    email_enrichment::Column::Category,
                    email_enrichment::Column::ClusterLabel,
                    email_enrichment::Column::Summary,
                    email_enrichment::Column::ActionItems,
                    email_enrichment::Column::KeyDates,
                    email_enrichment::Column::SuggestedTags,
                    email_enrichment::Column::NeedsReply,
                    email_enrichment::Column::EstimatedReadMinutes,
                    email_enrichment::Column::AnalysisVersion,
                    email_enrichment::Column::ModelId,
                    email_enrichment::Column::AnalyzedAt,
                ])
                .to_owned(),
            )
            .exec(conn)
            .await?;

        Ok(count)
    }
}

fn build_active_model(
    user_id: &str,
    outlook_message_id: &str,
    analysis: &EmailAnalysis,
) -> email_enrichment::ActiveModel {
    email_enrichment::ActiveModel {
        user_id: Set(user_id.to_string()),
        outlook_message_id: Set(outlook_message_id.to_string()),
        priority_score: Set(analysis.priority),
        priority_reason: Set(analysis.priority_reason.clone()),
        sentiment: Set(analysis.sentiment.clone()),
        category: Set(analysis.category.clone()),
        cluster_label: Set(analysis.cluster.clone()),
        summary: Set(analysis.summary.clone()),
        action_items: Set(serde_json::to_value(&analysis.action_items).ok()),
        key_dates: Set(serde_json::to_value(&analysis.key_dates).ok()),
        suggested_tags: Set(serde_json::to_value(&analysis.suggested_tags).ok()),
        needs_reply: Set(analysis.needs_reply),
        estimated_read_minutes: Set(analysis.estimated_read_minutes),
        analysis_version: Set(cfg.model.analysis_version.clone()),
        model_id: Set(analysis.model_id.clone()),
        analyzed_at: Set(Utc::now().fixed_offset()),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analysis() -> EmailAnalysis {
        EmailAnalysis {
            priority: 82,
            priority_reason: Some("deadline tomorrow".to_string()),
            sentiment: "urgent".to_string(),
            category: "work".to_string(),
            cluster: Some("project-x".to_string()),
            summary: Some("Asks for the report by Friday.".to_string()),
            action_items: Vec::new(),
            key_dates: Vec::new(),
            suggested_tags: vec!["report".to_string()],
            needs_reply: true,
            estimated_read_minutes: Some(2),
            model_id: Some("claude-3-5-sonnet-20240620".to_string()),
        }
    }

    #[test]
    fn test_build_active_model_maps_fields() {
        let model = build_active_model("user-1", "m1", &analysis());

        assert_eq!(model.user_id.as_ref(), "user-1");
        assert_eq!(model.outlook_message_id.as_ref(), "m1");
        assert_eq!(*model.priority_score.as_ref(), 82);
        assert_eq!(model.sentiment.as_ref(), "urgent");
        assert!(*model.needs_reply.as_ref());
        assert_eq!(model.analysis_version.as_ref(), &cfg.model.analysis_version);

        let tags = model.suggested_tags.as_ref().clone().unwrap();
        assert_eq!(tags, serde_json::json!(["report"]));
    }

    #[cfg(feature = "mock")]
    #[tokio::test]
    async fn test_upsert_many_empty_input_is_noop() {
        use sea_orm::{DatabaseBackend, MockDatabase};

        let conn = MockDatabase::new(DatabaseBackend::Postgres).into_connection();
        let count = EnrichmentCtrl::upsert_many(&conn, "user-1", &[]).await.unwrap();

        assert_eq!(count, 0);
        assert!(conn.into_transaction_log().is_empty());
    }
}
