use axum::{extract::State, Json};
use axum_extra::extract::WithRejection;
use serde::{Deserialize, Serialize};

use crate::{
    auth::jwt::Claims,
    cache::response_cache::response_cache_key,
    error::{AppError, AppJsonResult, MODEL_NOT_CONFIGURED},
    model::EnrichmentCtrl,
    prompt::{
        batch::{run_analysis_batch, AnalyzedEmail},
        combined::{analyze_email, quick_analyze_email, EmailInput, QuickAnalysis},
        respond::{generate_quick_replies, generate_response, QuickReply, ResponseSuggestion},
        smart::{run_smart_analysis, SmartAnalysisReport},
    },
    server_config::cfg,
    ServerState,
};

fn ensure_model_configured() -> Result<(), AppError> {
    if cfg.api.is_configured() {
        Ok(())
    } else {
        Err(AppError::ServiceUnavailable(MODEL_NOT_CONFIGURED.to_string()))
    }
}

fn validate_batch(emails: &[EmailInput]) -> Result<(), AppError> {
    if emails.is_empty() {
        return Err(AppError::BadRequest("emails must not be empty".to_string()));
    }
    let max = cfg.analysis.max_batch_emails;
    if emails.len() > max {
        return Err(AppError::BadRequest(format!(
            "too many emails: {} exceeds the limit of {max}",
            emails.len()
        )));
    }
    Ok(())
}

/// The email fields ride at the top level of the body, not nested.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzePriorityRequest {
    #[serde(flatten)]
    pub email: EmailInput,
    #[serde(default)]
    pub original_priority: Option<i32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzePriorityResponse {
    pub priority: i32,
    pub original_priority: i32,
    pub changed: bool,
}

pub async fn analyze_priority(
    State(state): State<ServerState>,
    WithRejection(Json(request), _): WithRejection<Json<AnalyzePriorityRequest>, AppError>,
) -> AppJsonResult<AnalyzePriorityResponse> {
    if request.email.subject.as_deref().map_or(true, str::is_empty) {
        return Err(AppError::BadRequest("email subject is required".to_string()));
    }
    ensure_model_configured()?;

    let analysis = analyze_email(
        &state.http_client,
        &state.rate_limiters,
        &request.email,
        &cfg.model.quick_id,
    )
    .await?;

    // callers that do not know a prior score get the neutral midpoint
    let original_priority = request.original_priority.unwrap_or(50);
    Ok(Json(AnalyzePriorityResponse {
        priority: analysis.priority,
        original_priority,
        changed: analysis.priority != original_priority,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchAnalyzeRequest {
    pub emails: Vec<EmailInput>,
    /// Requested analysis operations. The combined call always computes the
    /// full schema, so this is advisory.
    #[serde(default)]
    pub operations: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchAnalyzeResponse {
    pub emails: Vec<AnalyzedEmail>,
    pub count: usize,
    /// Model calls issued for this request.
    pub operations: usize,
}

pub async fn batch_analyze(
    State(state): State<ServerState>,
    WithRejection(Json(request), _): WithRejection<Json<BatchAnalyzeRequest>, AppError>,
) -> AppJsonResult<BatchAnalyzeResponse> {
    validate_batch(&request.emails)?;
    ensure_model_configured()?;

    if let Some(operations) = &request.operations {
        tracing::debug!("Requested operations {:?}, computing the full schema", operations);
    }

    let outcomes = run_analysis_batch(
        &request.emails,
        cfg.analysis.batch_concurrency,
        |email| {
            let http_client = state.http_client.clone();
            let rate_limiters = state.rate_limiters.clone();
            async move {
                analyze_email(&http_client, &rate_limiters, &email, &cfg.model.quick_id).await
            }
        },
    )
    .await;

    let operations = outcomes.len();
    let emails: Vec<AnalyzedEmail> = outcomes.into_iter().map(AnalyzedEmail::from).collect();

    Ok(Json(BatchAnalyzeResponse {
        count: emails.len(),
        operations,
        emails,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateResponseRequest {
    pub email: EmailInput,
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub tone: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateResponseResponse {
    pub success: bool,
    pub suggestion: ResponseSuggestion,
    pub cached: bool,
}

pub async fn generate_response_handler(
    State(state): State<ServerState>,
    WithRejection(Json(request), _): WithRejection<Json<GenerateResponseRequest>, AppError>,
) -> AppJsonResult<GenerateResponseResponse> {
    ensure_model_configured()?;

    let variant = request.tone.as_deref().unwrap_or("default");
    let cache_key = response_cache_key(&request.email.id, variant);

    if let Some(suggestion) = state.suggestion_cache.get_fresh(&cache_key).await {
        return Ok(Json(GenerateResponseResponse {
            success: true,
            suggestion,
            cached: true,
        }));
    }

    let suggestion = generate_response(
        &state.http_client,
        &state.rate_limiters,
        &request.email,
        request.context.as_deref(),
    )
    .await?;

    state.suggestion_cache.insert(cache_key, suggestion.clone()).await;

    Ok(Json(GenerateResponseResponse {
        success: true,
        suggestion,
        cached: false,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuickRepliesRequest {
    pub email: EmailInput,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuickRepliesResponse {
    pub success: bool,
    pub replies: Vec<QuickReply>,
    pub cached: bool,
}

pub async fn quick_replies(
    State(state): State<ServerState>,
    WithRejection(Json(request), _): WithRejection<Json<QuickRepliesRequest>, AppError>,
) -> AppJsonResult<QuickRepliesResponse> {
    ensure_model_configured()?;

    let cache_key = response_cache_key(&request.email.id, "quick");
    if let Some(replies) = state.quick_reply_cache.get_fresh(&cache_key).await {
        return Ok(Json(QuickRepliesResponse {
            success: true,
            replies,
            cached: true,
        }));
    }

    let replies =
        generate_quick_replies(&state.http_client, &state.rate_limiters, &request.email).await?;

    state.quick_reply_cache.insert(cache_key, replies.clone()).await;

    Ok(Json(QuickRepliesResponse {
        success: true,
        replies,
        cached: false,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SmartAnalyzeRequest {
    pub emails: Vec<EmailInput>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SmartAnalyzeResponse {
    pub success: bool,
    #[serde(flatten)]
    pub report: SmartAnalysisReport,
}

/// Tiered analysis over the posted emails, persisting the enrichments for the
/// authenticated user as a side effect.
pub async fn smart_analyze(
    claims: Claims,
    State(state): State<ServerState>,
    WithRejection(Json(request), _): WithRejection<Json<SmartAnalyzeRequest>, AppError>,
) -> AppJsonResult<SmartAnalyzeResponse> {
    validate_batch(&request.emails)?;
    ensure_model_configured()?;

    let report =
        run_smart_analysis(&state.http_client, &state.rate_limiters, &request.emails).await;

    let analyses: Vec<(String, _)> = report
        .results
        .iter()
        .map(|r| (r.email_id.clone(), r.analysis.clone()))
        .collect();
    let persisted = EnrichmentCtrl::upsert_many(&state.conn, &claims.sub, &analyses).await?;
    tracing::info!(
        "Smart analysis for {}: {} results persisted, {} failures",
        claims.sub,
        persisted,
        report.failures.len()
    );

    Ok(Json(SmartAnalyzeResponse {
        success: true,
        report,
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub configured: bool,
    pub status: String,
    pub message: String,
}

pub async fn status(State(state): State<ServerState>) -> Json<StatusResponse> {
    let configured = cfg.api.is_configured();
    let (status, message) = if configured {
        (state.rate_limiters.get_status(), "AI analysis is ready".to_string())
    } else {
        ("not_configured".to_string(), MODEL_NOT_CONFIGURED.to_string())
    };

    Json(StatusResponse {
        configured,
        status,
        message,
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuggestionsRequest {
    pub emails: Vec<EmailInput>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Suggestion {
    pub email_id: String,
    pub kind: String,
    pub text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SuggestionsResponse {
    pub suggestions: Vec<Suggestion>,
    pub count: usize,
    pub analyzed_emails: usize,
}

/// Derive actionable hints from quick classifications. High-priority emails
/// come first so the client can render them at the top as-is.
pub fn derive_suggestions(analyses: &[(String, QuickAnalysis)], threshold: i32) -> Vec<Suggestion> {
    let mut suggestions = Vec::new();

    for (email_id, analysis) in analyses {
        if analysis.priority > threshold {
            suggestions.push(Suggestion {
                email_id: email_id.clone(),
                kind: "urgent".to_string(),
                text: format!("High priority {} email needs attention", analysis.category),
            });
        }
    }
    for (email_id, analysis) in analyses {
        if analysis.needs_reply && analysis.priority <= threshold {
            suggestions.push(Suggestion {
                email_id: email_id.clone(),
                kind: "reply".to_string(),
                text: format!("A {} email is waiting for a reply", analysis.category),
            });
        }
    }

    suggestions
}

pub async fn suggestions(
    State(state): State<ServerState>,
    WithRejection(Json(request), _): WithRejection<Json<SuggestionsRequest>, AppError>,
) -> AppJsonResult<SuggestionsResponse> {
    validate_batch(&request.emails)?;
    ensure_model_configured()?;

    let outcomes = run_analysis_batch(
        &request.emails,
        cfg.analysis.batch_concurrency,
        |email| {
            let http_client = state.http_client.clone();
            let rate_limiters = state.rate_limiters.clone();
            async move {
                quick_analyze_email(&http_client, &rate_limiters, &email, &cfg.model.quick_id).await
            }
        },
    )
    .await;

    let analyses: Vec<(String, QuickAnalysis)> = outcomes
        .into_iter()
        .filter_map(|outcome| {
            let email_id = outcome.email_id;
            outcome.result.ok().map(|analysis| (email_id, analysis))
        })
        .collect();

    let analyzed_emails = analyses.len();
    let suggestions = derive_suggestions(&analyses, cfg.model.priority_threshold);

    Ok(Json(SuggestionsResponse {
        count: suggestions.len(),
        analyzed_emails,
        suggestions,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick(priority: i32, needs_reply: bool) -> QuickAnalysis {
        QuickAnalysis {
            priority,
            category: "work".to_string(),
            sentiment: "neutral".to_string(),
            needs_reply,
        }
    }

    #[test]
    fn test_validate_batch_rejects_empty_and_oversized() {
        assert!(validate_batch(&[]).is_err());

        let input = EmailInput {
            id: "m1".to_string(),
            subject: None,
            sender: None,
            preview: None,
            body: None,
            received_at: None,
            importance: None,
            is_read: None,
        };
        let oversized = vec![input.clone(); cfg.analysis.max_batch_emails + 1];
        assert!(validate_batch(&oversized).is_err());

        let at_limit = vec![input; cfg.analysis.max_batch_emails];
        assert!(validate_batch(&at_limit).is_ok());
    }

    #[test]
    fn test_derive_suggestions_orders_urgent_first() {
        let analyses = vec![
            ("a".to_string(), quick(30, true)),
            ("b".to_string(), quick(90, false)),
            ("c".to_string(), quick(40, false)),
        ];

        let suggestions = derive_suggestions(&analyses, 70);
        assert_eq!(suggestions.len(), 2);
        assert_eq!(suggestions[0].email_id, "b");
        assert_eq!(suggestions[0].kind, "urgent");
        assert_eq!(suggestions[1].email_id, "a");
        assert_eq!(suggestions[1].kind, "reply");
    }

    #[test]
    fn test_derive_suggestions_no_duplicate_for_urgent_needing_reply() {
        let analyses = vec![("a".to_string(), quick(95, true))];
        let suggestions = derive_suggestions(&analyses, 70);
        assert_eq!(suggestions.len(), 1);
        assert_eq!(suggestions[0].kind, "urgent");
    }

    #[test]
    fn test_analyze_priority_accepts_top_level_email_fields() {
        let body = serde_json::json!({
            "subject": "Q3 numbers",
            "sender": "cfo@example.com",
            "preview": "Attached are the figures",
            "originalPriority": 40
        });

        let request: AnalyzePriorityRequest = serde_json::from_value(body).unwrap();
        assert_eq!(request.email.subject.as_deref(), Some("Q3 numbers"));
        assert_eq!(request.email.sender.as_deref(), Some("cfo@example.com"));
        assert_eq!(request.original_priority, Some(40));
        assert!(request.email.id.is_empty());
    }

    #[test]
    fn test_batch_analyze_accepts_operations_field() {
        let body = serde_json::json!({
            "emails": [{"id": "m1", "subject": "hi"}],
            "operations": ["priority", "summary"]
        });

        let request: BatchAnalyzeRequest = serde_json::from_value(body).unwrap();
        assert_eq!(request.emails.len(), 1);
        assert_eq!(
            request.operations,
            Some(vec!["priority".to_string(), "summary".to_string()])
        );
    }
}
