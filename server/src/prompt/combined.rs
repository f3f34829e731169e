use indoc::{formatdoc, indoc};
use serde::{Deserialize, Serialize};

use crate::rate_limiters::RateLimiters;
use crate::server_config::cfg;
use crate::util::truncate_chars;
use crate::HttpClient;

use super::claude::{extract_json_object, send_prompt};
use super::{AnalysisError, AnalysisResult};

/// Message metadata as submitted by callers of the analysis routes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailInput {
    /// Absent on single-email calls that never echo the id back.
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default, alias = "from")]
    pub sender: Option<String>,
    #[serde(default)]
    pub preview: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub received_at: Option<String>,
    #[serde(default)]
    pub importance: Option<String>,
    #[serde(default)]
    pub is_read: Option<bool>,
}

impl EmailInput {
    pub fn content_len(&self) -> usize {
        self.body
            .as_deref()
            .or(self.preview.as_deref())
            .map_or(0, |s| s.chars().count())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionItem {
    pub task: String,
    #[serde(default)]
    pub deadline: Option<String>,
    #[serde(default)]
    pub priority: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyDate {
    pub date: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
}

/// Full enrichment produced by one combined-analysis call.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailAnalysis {
    pub priority: i32,
    pub priority_reason: Option<String>,
    pub sentiment: String,
    pub category: String,
    pub cluster: Option<String>,
    pub summary: Option<String>,
    pub action_items: Vec<ActionItem>,
    pub key_dates: Vec<KeyDate>,
    pub suggested_tags: Vec<String>,
    pub needs_reply: bool,
    pub estimated_read_minutes: Option<i32>,
    pub model_id: Option<String>,
}

/// Cheap first-stage classification used by the two-pass analyzer and the
/// suggestions route.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuickAnalysis {
    pub priority: i32,
    pub category: String,
    pub sentiment: String,
    pub needs_reply: bool,
}

// Keys here define the contract the parser validates against.
pub fn system_prompt() -> &'static str {
    indoc! {r#"
        You are an email triage assistant. Given one email's metadata and content,
        respond with a single JSON object and nothing else, using exactly these keys:
        {
          "priority": <number 0-100, higher means more urgent>,
          "priority_reason": <string>,
          "sentiment": <"positive" | "neutral" | "negative" | "urgent">,
          "category": <string, one short topical label>,
          "cluster": <string, a label grouping similar emails>,
          "summary": <string, at most two sentences>,
          "action_items": [{"task": <string>, "deadline": <string or null>, "priority": <string or null>}],
          "key_dates": [{"date": <string>, "description": <string>, "type": <string>}],
          "suggested_tags": [<string>],
          "needs_reply": <boolean>,
          "estimated_read_minutes": <number>
        }
        Do not provide explanations outside the JSON object."#}
}

pub fn quick_system_prompt() -> &'static str {
    indoc! {r#"
        You are an email triage assistant. Given one email's metadata, respond with a
        single JSON object and nothing else, using exactly these keys:
        {
          "priority": <number 0-100, higher means more urgent>,
          "category": <string, one short topical label>,
          "sentiment": <"positive" | "neutral" | "negative" | "urgent">,
          "needs_reply": <boolean>
        }
        Do not provide explanations outside the JSON object."#}
}

pub fn user_prompt(email: &EmailInput) -> String {
    let body = email
        .body
        .as_deref()
        .or(email.preview.as_deref())
        .unwrap_or("");

    formatdoc! {r#"
        Analyze the following email.
        <sender>{sender}</sender>
        <subject>{subject}</subject>
        <received>{received}</received>
        <importance>{importance}</importance>
        <body>{body}</body>"#,
        sender = email.sender.as_deref().unwrap_or(""),
        subject = email.subject.as_deref().unwrap_or(""),
        received = email.received_at.as_deref().unwrap_or(""),
        importance = email.importance.as_deref().unwrap_or("normal"),
        body = truncate_chars(body, cfg.analysis.prompt_body_max_chars),
    }
}

#[derive(Debug, Deserialize)]
struct RawAnalysis {
    priority: f64,
    #[serde(default)]
    priority_reason: Option<String>,
    sentiment: String,
    category: String,
    #[serde(default)]
    cluster: Option<String>,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    action_items: Vec<ActionItem>,
    #[serde(default)]
    key_dates: Vec<KeyDate>,
    #[serde(default)]
    suggested_tags: Vec<String>,
    #[serde(default)]
    needs_reply: bool,
    #[serde(default)]
    estimated_read_minutes: Option<f64>,
}

fn clamp_priority(priority: f64) -> i32 {
    priority.round().clamp(0.0, 100.0) as i32
}

/// Parse and shape-check one combined-analysis response: priority must be
/// numeric, sentiment and category present, suggested_tags a list.
pub fn parse_analysis(text: &str) -> AnalysisResult<EmailAnalysis> {
    let raw = extract_json_object(text)
        .ok_or_else(|| AnalysisError::MalformedResponse("no JSON object in output".to_string()))?;
    let value: serde_json::Value = serde_json::from_str(&raw)
        .map_err(|e| AnalysisError::MalformedResponse(format!("invalid JSON: {e}")))?;

    if value.get("priority").and_then(|v| v.as_f64()).is_none() {
        return Err(AnalysisError::MalformedResponse(
            "priority is missing or not numeric".to_string(),
        ));
    }
    for key in ["sentiment", "category"] {
        if !value.get(key).map_or(false, |v| v.is_string()) {
            return Err(AnalysisError::MalformedResponse(format!("{key} is missing")));
        }
    }
    if let Some(tags) = value.get("suggested_tags") {
        if !tags.is_array() && !tags.is_null() {
            return Err(AnalysisError::MalformedResponse(
                "suggested_tags is not a list".to_string(),
            ));
        }
    }

    let raw: RawAnalysis = serde_json::from_value(value)
        .map_err(|e| AnalysisError::MalformedResponse(format!("unexpected shape: {e}")))?;

    Ok(EmailAnalysis {
        priority: clamp_priority(raw.priority),
        priority_reason: raw.priority_reason,
        sentiment: raw.sentiment,
        category: raw.category,
        cluster: raw.cluster,
        summary: raw.summary,
        action_items: raw.action_items,
        key_dates: raw.key_dates,
        suggested_tags: raw.suggested_tags,
        needs_reply: raw.needs_reply,
        estimated_read_minutes: raw.estimated_read_minutes.map(|m| m.round().max(1.0) as i32),
        model_id: None,
    })
}

#[derive(Debug, Deserialize)]
struct RawQuickAnalysis {
    priority: f64,
    category: String,
    sentiment: String,
    #[serde(default)]
    needs_reply: bool,
}

pub fn parse_quick_analysis(text: &str) -> AnalysisResult<QuickAnalysis> {
    let raw = extract_json_object(text)
        .ok_or_else(|| AnalysisError::MalformedResponse("no JSON object in output".to_string()))?;
    let raw: RawQuickAnalysis = serde_json::from_str(&raw)
        .map_err(|e| AnalysisError::MalformedResponse(format!("unexpected shape: {e}")))?;

    Ok(QuickAnalysis {
        priority: clamp_priority(raw.priority),
        category: raw.category,
        sentiment: raw.sentiment,
        needs_reply: raw.needs_reply,
    })
}

/// One full-schema model call for one email.
pub async fn analyze_email(
    http_client: &HttpClient,
    rate_limiters: &RateLimiters,
    email: &EmailInput,
    model_id: &str,
) -> AnalysisResult<EmailAnalysis> {
    let completion = send_prompt(
        http_client,
        rate_limiters,
        model_id,
        system_prompt(),
        &user_prompt(email),
    )
    .await?;

    let mut analysis = parse_analysis(&completion.text)?;
    analysis.model_id = Some(completion.model);
    Ok(analysis)
}

/// One compact-schema model call for one email.
pub async fn quick_analyze_email(
    http_client: &HttpClient,
    rate_limiters: &RateLimiters,
    email: &EmailInput,
    model_id: &str,
) -> AnalysisResult<QuickAnalysis> {
    let completion = send_prompt(
        http_client,
        rate_limiters,
        model_id,
        quick_system_prompt(),
        &user_prompt(email),
    )
    .await?;

    parse_quick_analysis(&completion.text)
}
