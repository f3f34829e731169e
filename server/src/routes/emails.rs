use std::collections::HashMap;

use axum::{
    extract::{Path, State},
    http::HeaderMap,
    Json,
};
use axum_extra::extract::WithRejection;
use serde::{Deserialize, Serialize};

use entity::email_metadata;

use crate::{
    auth::jwt::Claims,
    cache::PrefetchOptions,
    error::{AppError, AppJsonResult, MODEL_NOT_CONFIGURED},
    graph::{client::MarkReadSummary, types::AttachmentMeta, GraphClient},
    model::{EmailMetadataCtrl, EnrichmentCtrl, OutlookConnectionCtrl},
    prompt::{
        batch::{run_analysis_batch, BatchOutcome},
        combined::{analyze_email, EmailAnalysis, EmailInput},
    },
    server_config::cfg,
    ServerState,
};

const ACCESS_TOKEN_HEADER: &str = "x-outlook-access-token";

fn outlook_token(headers: &HeaderMap) -> Result<String, AppError> {
    headers
        .get(ACCESS_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .ok_or_else(|| {
            AppError::Unauthorized("Missing X-Outlook-Access-Token header".to_string())
        })
}

fn to_email_input(row: &email_metadata::Model) -> EmailInput {
    EmailInput {
        id: row.outlook_message_id.clone(),
        subject: row.subject.clone(),
        sender: row.sender_email.clone().or_else(|| row.sender_name.clone()),
        preview: row.body_preview.clone(),
        body: None,
        received_at: Some(row.received_at.to_rfc3339()),
        importance: row.importance.clone(),
        is_read: Some(row.is_read),
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzeRequest {
    /// Restrict the claim to these message ids; absent means any pending row.
    #[serde(default)]
    pub message_ids: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzeResponse {
    pub success: bool,
    pub analyzed: usize,
    pub failed: usize,
    pub total: usize,
}

/// Claim a batch of pending rows, run the analyzer over them and reconcile
/// each row to `enriched` or `failed`. Failed rows are not re-queued here.
pub async fn analyze(
    claims: Claims,
    State(state): State<ServerState>,
    WithRejection(Json(request), _): WithRejection<Json<AnalyzeRequest>, AppError>,
) -> AppJsonResult<AnalyzeResponse> {
    if !cfg.api.is_configured() {
        return Err(AppError::ServiceUnavailable(MODEL_NOT_CONFIGURED.to_string()));
    }

    let claimed = EmailMetadataCtrl::claim_pending(
        &state.conn,
        &claims.sub,
        cfg.analysis.claim_batch_size,
        request.message_ids.as_deref(),
    )
    .await?;

    if claimed.is_empty() {
        return Ok(Json(AnalyzeResponse {
            success: true,
            analyzed: 0,
            failed: 0,
            total: 0,
        }));
    }

    let row_ids: HashMap<String, i32> = claimed
        .iter()
        .map(|row| (row.outlook_message_id.clone(), row.id))
        .collect();
    let inputs: Vec<EmailInput> = claimed.iter().map(to_email_input).collect();

    let outcomes = run_analysis_batch(&inputs, cfg.analysis.batch_concurrency, |email| {
        let http_client = state.http_client.clone();
        let rate_limiters = state.rate_limiters.clone();
        async move { analyze_email(&http_client, &rate_limiters, &email, &cfg.model.deep_id).await }
    })
    .await;

    let total = outcomes.len();
    let (analyzed, failed) =
        reconcile_outcomes(&state.conn, &claims.sub, &row_ids, outcomes).await?;

    tracing::info!(
        "Enrichment run for {}: {} analyzed, {} failed of {}",
        claims.sub,
        analyzed,
        failed,
        total
    );

    Ok(Json(AnalyzeResponse {
        success: true,
        analyzed,
        failed,
        total,
    }))
}

/// Settle every claimed row. Enrichment rows are persisted first and only
/// then flipped to `enriched`; if the upsert itself fails, the affected rows
/// are marked `failed` instead so they keep their retry path. Returns
/// `(analyzed, failed)` counts.
async fn reconcile_outcomes(
    conn: &sea_orm::DatabaseConnection,
    user_id: &str,
    row_ids: &HashMap<String, i32>,
    outcomes: Vec<BatchOutcome<EmailAnalysis>>,
) -> crate::error::AppResult<(usize, usize)> {
    let mut successes: Vec<(i32, String, EmailAnalysis)> = Vec::new();
    let mut failures: Vec<(i32, String)> = Vec::new();

    for outcome in outcomes {
        let Some(&row_id) = row_ids.get(&outcome.email_id) else {
            tracing::warn!("Analyzer returned unknown message id {}", outcome.email_id);
            continue;
        };

        match outcome.result {
            Ok(analysis) => successes.push((row_id, outcome.email_id, analysis)),
            Err(error) => failures.push((row_id, error)),
        }
    }

    let mut analyzed = 0usize;
    if !successes.is_empty() {
        let enrichments: Vec<(String, EmailAnalysis)> = successes
            .iter()
            .map(|(_, message_id, analysis)| (message_id.clone(), analysis.clone()))
            .collect();

        match EnrichmentCtrl::upsert_many(conn, user_id, &enrichments).await {
            Ok(_) => {
                for (row_id, _, _) in &successes {
                    EmailMetadataCtrl::mark_enriched(conn, *row_id).await?;
                    analyzed += 1;
                }
            }
            Err(e) => {
                tracing::error!("Enrichment upsert failed, failing the batch: {:?}", e);
                let message = e.to_string();
                for (row_id, _, _) in &successes {
                    failures.push((*row_id, message.clone()));
                }
            }
        }
    }

    let failed = failures.len();
    for (row_id, error) in &failures {
        EmailMetadataCtrl::mark_failed(conn, *row_id, error).await?;
    }

    Ok((analyzed, failed))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentResponse {
    pub message_id: String,
    pub body: String,
    pub html: Option<String>,
    pub attachments: Vec<AttachmentMeta>,
    pub cached: bool,
}

/// Full body and attachment listing for one owned message, served from the
/// body cache when fresh.
pub async fn content(
    claims: Claims,
    Path(message_id): Path<String>,
    State(state): State<ServerState>,
    headers: HeaderMap,
) -> AppJsonResult<ContentResponse> {
    let access_token = outlook_token(&headers)?;

    let owned = EmailMetadataCtrl::find_owned(&state.conn, &claims.sub, &message_id).await?;
    if owned.is_none() {
        return Err(AppError::NotFound("Message not found".to_string()));
    }

    if let Some(entry) = state.body_cache.get(&message_id).await {
        return Ok(Json(ContentResponse {
            message_id,
            body: entry.body,
            html: entry.html,
            attachments: entry.attachments,
            cached: true,
        }));
    }

    let graph = GraphClient::from_access_token(state.http_client.clone(), access_token);
    let entry = graph.fetch_content(&message_id).await?;
    state.body_cache.insert(message_id.clone(), entry.clone()).await;

    Ok(Json(ContentResponse {
        message_id,
        body: entry.body,
        html: entry.html,
        attachments: entry.attachments,
        cached: false,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkReadRequest {
    pub message_ids: Vec<String>,
    #[serde(default = "default_is_read")]
    pub is_read: bool,
    /// Graph token in the body; the header form is accepted as a fallback.
    #[serde(default)]
    pub access_token: Option<String>,
}

fn default_is_read() -> bool {
    true
}

impl MarkReadRequest {
    fn token(&self, headers: &HeaderMap) -> Result<String, AppError> {
        match self.access_token.as_deref().filter(|token| !token.is_empty()) {
            Some(token) => Ok(token.to_string()),
            None => outlook_token(headers),
        }
    }
}

/// Flip the read flag on Graph and, when the caller is signed in, mirror the
/// change into their local rows.
pub async fn mark_read(
    claims: Option<Claims>,
    State(state): State<ServerState>,
    headers: HeaderMap,
    WithRejection(Json(request), _): WithRejection<Json<MarkReadRequest>, AppError>,
) -> AppJsonResult<MarkReadSummary> {
    if request.message_ids.is_empty() {
        return Err(AppError::BadRequest("messageIds must not be empty".to_string()));
    }

    let access_token = request.token(&headers)?;
    let graph = GraphClient::from_access_token(state.http_client.clone(), access_token);
    let summary = graph.mark_read(&request.message_ids, request.is_read).await?;

    if let Some(claims) = claims {
        let mirrored = EmailMetadataCtrl::mark_read_local(
            &state.conn,
            &claims.sub,
            &request.message_ids,
            request.is_read,
        )
        .await?;
        tracing::debug!("Mirrored read flag on {} local rows", mirrored);
    }

    Ok(Json(summary))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncInfo {
    pub connected: bool,
    pub last_synced_at: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataResponse {
    pub emails: Vec<email_metadata::Model>,
    pub count: usize,
    pub sync: SyncInfo,
}

// unread bodies warmed in the background after a metadata listing
const PREFETCH_LOOKAHEAD: usize = 10;

/// All stored metadata rows for the caller, newest first, with the sync
/// bookkeeping from the connection row. When the caller also supplies a Graph
/// access token, the newest unread bodies are prefetched in the background.
pub async fn metadata(
    claims: Claims,
    State(state): State<ServerState>,
    headers: HeaderMap,
) -> AppJsonResult<MetadataResponse> {
    let emails = EmailMetadataCtrl::get_all_by_user(&state.conn, &claims.sub).await?;
    let connection = OutlookConnectionCtrl::get_by_user(&state.conn, &claims.sub).await?;

    if let Ok(access_token) = outlook_token(&headers) {
        let message_ids: Vec<String> = emails
            .iter()
            .filter(|row| !row.is_read)
            .take(PREFETCH_LOOKAHEAD)
            .map(|row| row.outlook_message_id.clone())
            .collect();

        if !message_ids.is_empty() {
            let graph = GraphClient::from_access_token(state.http_client.clone(), access_token);
            let body_cache = state.body_cache.clone();
            tokio::spawn(async move {
                let completed = body_cache
                    .prefetch(
                        &message_ids,
                        |id| {
                            let graph = &graph;
                            async move {
                                graph.fetch_content(&id).await.map_err(anyhow::Error::from)
                            }
                        },
                        PrefetchOptions::from_config(),
                    )
                    .await;
                tracing::debug!("Prefetched {} message bodies", completed);
            });
        }
    }

    let sync = match connection {
        Some(connection) => SyncInfo {
            connected: true,
            last_synced_at: connection.last_synced_at.map(|ts| ts.to_rfc3339()),
        },
        None => SyncInfo {
            connected: false,
            last_synced_at: None,
        },
    };

    Ok(Json(MetadataResponse {
        count: emails.len(),
        emails,
        sync,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outlook_token_missing_is_unauthorized() {
        let headers = HeaderMap::new();
        assert!(matches!(
            outlook_token(&headers),
            Err(AppError::Unauthorized(_))
        ));
    }

    #[test]
    fn test_outlook_token_empty_is_unauthorized() {
        let mut headers = HeaderMap::new();
        headers.insert(ACCESS_TOKEN_HEADER, "".parse().unwrap());
        assert!(outlook_token(&headers).is_err());
    }

    #[test]
    fn test_outlook_token_present() {
        let mut headers = HeaderMap::new();
        headers.insert(ACCESS_TOKEN_HEADER, "token-123".parse().unwrap());
        assert_eq!(outlook_token(&headers).unwrap(), "token-123");
    }

    #[test]
    fn test_mark_read_body_token_wins_over_header() {
        let body = serde_json::json!({
            "messageIds": ["m1", "m2"],
            "accessToken": "body-token"
        });
        let request: MarkReadRequest = serde_json::from_value(body).unwrap();
        assert!(request.is_read);

        let mut headers = HeaderMap::new();
        headers.insert(ACCESS_TOKEN_HEADER, "header-token".parse().unwrap());
        assert_eq!(request.token(&headers).unwrap(), "body-token");
    }

    #[test]
    fn test_mark_read_falls_back_to_header_token() {
        let body = serde_json::json!({
            "messageIds": ["m1"],
            "isRead": false
        });
        let request: MarkReadRequest = serde_json::from_value(body).unwrap();
        assert!(!request.is_read);

        let mut headers = HeaderMap::new();
        headers.insert(ACCESS_TOKEN_HEADER, "header-token".parse().unwrap());
        assert_eq!(request.token(&headers).unwrap(), "header-token");

        assert!(request.token(&HeaderMap::new()).is_err());
    }
}
