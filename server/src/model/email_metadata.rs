use entity::prelude::*;
use entity::{email_metadata, sea_orm_active_enums::AiStatus};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveEnum, ColumnTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, QuerySelect, QueryTrait,
};

use crate::error::AppResult;
use crate::util::truncate_chars;

pub struct EmailMetadataCtrl;

// ai_last_error is diagnostic, not an audit log
const MAX_STORED_ERROR_CHARS: usize = 500;

impl EmailMetadataCtrl {
    pub async fn get_all_by_user(
        conn: &DatabaseConnection,
        user_id: &str,
    ) -> AppResult<Vec<email_metadata::Model>> {
        let rows = EmailMetadata::find()
            .filter(email_metadata::Column::UserId.eq(user_id))
            .order_by_desc(email_metadata::Column::ReceivedAt)
            .all(conn)
            .await?;

        Ok(rows)
    }

    pub async fn find_owned(
        conn: &DatabaseConnection,
        user_id: &str,
        outlook_message_id: &str,
    ) -> AppResult<Option<email_metadata::Model>> {
        let row = EmailMetadata::find()
            .filter(email_metadata::Column::UserId.eq(user_id))
            .filter(email_metadata::Column::OutlookMessageId.eq(outlook_message_id))
            .one(conn)
            .await?;

        Ok(row)
    }

    pub async fn count_by_status(
        conn: &DatabaseConnection,
        user_id: &str,
        status: AiStatus,
    ) -> AppResult<u64> {
        let count = EmailMetadata::find()
            .filter(email_metadata::Column::UserId.eq(user_id))
            .filter(email_metadata::Column::AiStatus.eq(status))
            .count(conn)
            .await?;

        Ok(count)
    }

    /// Atomically claim up to `limit` pending rows for this user by flipping
    /// them to `Processing`, optionally restricted to an explicit message id
    /// list. The update re-checks the status so a row another request claimed
    /// between the select and the update is skipped, and only rows actually
    /// flipped are returned.
    pub async fn claim_pending(
        conn: &DatabaseConnection,
        user_id: &str,
        limit: u64,
        outlook_message_ids: Option<&[String]>,
    ) -> AppResult<Vec<email_metadata::Model>> {
        let candidates = EmailMetadata::find()
            .filter(email_metadata::Column::UserId.eq(user_id))
            .filter(email_metadata::Column::AiStatus.eq(AiStatus::Pending))
            .apply_if(outlook_message_ids, |query, ids| {
                query.filter(email_metadata::Column::OutlookMessageId.is_in(ids))
            })
            .order_by_desc(email_metadata::Column::ReceivedAt)
            .limit(limit)
            .all(conn)
            .await?;

        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let candidate_ids: Vec<i32> = candidates.iter().map(|row| row.id).collect();

        let claimed = EmailMetadata::update_many()
            .col_expr(
                email_metadata::Column::AiStatus,
                AiStatus::Processing.as_enum(),
            )
            .col_expr(
                email_metadata::Column::UpdatedAt,
                Expr::current_timestamp().into(),
            )
            .filter(email_metadata::Column::Id.is_in(candidate_ids))
            .filter(email_metadata::Column::AiStatus.eq(AiStatus::Pending))
            .exec_with_returning(conn)
            .await?;

        Ok(claimed)
    }

    pub async fn mark_enriched(conn: &DatabaseConnection, id: i32) -> AppResult<()> {
        EmailMetadata::update_many()
            .col_expr(
                email_metadata::Column::AiStatus,
                AiStatus::Enriched.as_enum(),
            )
            .col_expr(
                email_metadata::Column::AiLastError,
                Expr::value(Option::<String>::None),
            )
            .col_expr(
                email_metadata::Column::UpdatedAt,
                Expr::current_timestamp().into(),
            )
            .filter(email_metadata::Column::Id.eq(id))
            .exec(conn)
            .await?;

        Ok(())
    }

    /// Record a failed attempt: bump the retry counter and keep only the
    /// latest error message.
    pub async fn mark_failed(conn: &DatabaseConnection, id: i32, error: &str) -> AppResult<()> {
        EmailMetadata::update_many()
            .col_expr(email_metadata::Column::AiStatus, AiStatus::Failed.as_enum())
            .col_expr(
                email_metadata::Column::AiLastError,
                Expr::value(Some(truncate_chars(error, MAX_STORED_ERROR_CHARS))),
            )
            .col_expr(
                email_metadata::Column::AiRetryCount,
                Expr::col(email_metadata::Column::AiRetryCount).add(1),
            )
            .col_expr(
                email_metadata::Column::UpdatedAt,
                Expr::current_timestamp().into(),
            )
            .filter(email_metadata::Column::Id.eq(id))
            .exec(conn)
            .await?;

        Ok(())
    }

    /// Mirror a provider-side read-state change into local rows. Returns the
    /// number of rows touched.
    pub async fn mark_read_local(
        conn: &DatabaseConnection,
        user_id: &str,
        outlook_message_ids: &[String],
        is_read: bool,
    ) -> AppResult<u64> {
        if outlook_message_ids.is_empty() {
            return Ok(0);
        }

        let result = EmailMetadata::update_many()
            .col_expr(email_metadata::Column::IsRead, Expr::value(is_read))
            .col_expr(
                email_metadata::Column::UpdatedAt,
                Expr::current_timestamp().into(),
            )
            .filter(email_metadata::Column::UserId.eq(user_id))
            .filter(email_metadata::Column::OutlookMessageId.is_in(outlook_message_ids))
            .exec(conn)
            .await?;

        Ok(result.rows_affected)
    }
}

#[cfg(all(test, feature = "mock"))]
mod tests {
    use chrono::Utc;
    use sea_orm::{DatabaseBackend, MockDatabase, MockExecResult};

    use super::*;

    fn pending_row(id: i32, message_id: &str) -> email_metadata::Model {
        let now = Utc::now().fixed_offset();
        email_metadata::Model {
            id,
            user_id: "user-1".to_string(),
            outlook_message_id: message_id.to_string(),
            sender_name: None,
            sender_email: None,
            subject: Some("subject".to_string()),
            body_preview: None,
            importance: None,
            received_at: now,
            is_read: false,
            has_attachments: false,
            ai_status: AiStatus::Pending,
            ai_last_error: None,
            ai_retry_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_claim_pending_no_candidates_skips_update() {
        let conn = MockDatabase::new(DatabaseBackend::Postgres)
            .append_query_results::<email_metadata::Model, _, _>([Vec::new()])
            .into_connection();

        let claimed = EmailMetadataCtrl::claim_pending(&conn, "user-1", 25, None)
            .await
            .unwrap();

        assert!(claimed.is_empty());
        // only the candidate select ran
        assert_eq!(conn.into_transaction_log().len(), 1);
    }

    #[tokio::test]
    async fn test_claim_pending_returns_flipped_rows() {
        let returned = vec![pending_row(1, "m1"), pending_row(2, "m2")];
        let conn = MockDatabase::new(DatabaseBackend::Postgres)
            .append_query_results([returned.clone()])
            .append_query_results([returned.clone()])
            .into_connection();

        let claimed = EmailMetadataCtrl::claim_pending(&conn, "user-1", 25, None)
            .await
            .unwrap();

        assert_eq!(claimed.len(), 2);
        assert_eq!(claimed[0].outlook_message_id, "m1");
    }

    #[tokio::test]
    async fn test_mark_failed_bumps_retry_count_and_stores_error() {
        let conn = MockDatabase::new(DatabaseBackend::Postgres)
            .append_exec_results([MockExecResult {
                last_insert_id: 0,
                rows_affected: 1,
            }])
            .into_connection();

        EmailMetadataCtrl::mark_failed(&conn, 7, "model timed out")
            .await
            .unwrap();

        let log = conn.into_transaction_log();
        assert_eq!(log.len(), 1);
        let statement = format!("{:?}", log[0]);
        assert!(statement.contains("failed"));
        assert!(statement.contains("ai_last_error"));
        assert!(statement.contains("model timed out"));
        // the counter is bumped in place, not overwritten with a literal
        assert!(statement.contains("ai_retry_count"));
        assert!(statement.contains("+ 1"));
    }

    #[tokio::test]
    async fn test_mark_failed_keeps_only_latest_error() {
        let exec = MockExecResult {
            last_insert_id: 0,
            rows_affected: 1,
        };
        let conn = MockDatabase::new(DatabaseBackend::Postgres)
            .append_exec_results([exec.clone(), exec])
            .into_connection();

        EmailMetadataCtrl::mark_failed(&conn, 7, "first error").await.unwrap();
        EmailMetadataCtrl::mark_failed(&conn, 7, "second error").await.unwrap();

        let log = conn.into_transaction_log();
        assert_eq!(log.len(), 2);
        let second = format!("{:?}", log[1]);
        assert!(second.contains("second error"));
        assert!(!second.contains("first error"));
    }

    #[tokio::test]
    async fn test_mark_read_local_empty_input_is_noop() {
        let conn = MockDatabase::new(DatabaseBackend::Postgres).into_connection();
        let touched = EmailMetadataCtrl::mark_read_local(&conn, "user-1", &[], true)
            .await
            .unwrap();

        assert_eq!(touched, 0);
        assert!(conn.into_transaction_log().is_empty());
    }

    #[tokio::test]
    async fn test_mark_read_local_reports_rows_affected() {
        let conn = MockDatabase::new(DatabaseBackend::Postgres)
            .append_exec_results([MockExecResult {
                last_insert_id: 0,
                rows_affected: 3,
            }])
            .into_connection();

        let ids = vec!["m1".to_string(), "m2".to_string(), "m3".to_string()];
        let touched = EmailMetadataCtrl::mark_read_local(&conn, "user-1", &ids, true)
            .await
            .unwrap();

        assert_eq!(touched, 3);
    }
}
