use std::str::FromStr;

use indoc::{formatdoc, indoc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::rate_limiters::RateLimiters;
use crate::server_config::cfg;
use crate::util::truncate_chars;
use crate::HttpClient;

use super::claude::{extract_json_object, send_prompt};
use super::combined::EmailInput;
use super::{AnalysisError, AnalysisResult};

/// Tones the drafting prompt is allowed to pick. Unknown model output is
/// normalized to `Neutral`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Tone {
    Professional,
    Friendly,
    Formal,
    Concise,
    Neutral,
}

fn normalize_tone(raw: &str) -> Tone {
    Tone::from_str(raw.trim()).unwrap_or(Tone::Neutral)
}

/// A drafted reply with alternatives, cached per email id.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseSuggestion {
    pub body: String,
    pub tone: Tone,
    pub alternatives: Vec<String>,
    pub confidence: f32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuickReply {
    pub text: String,
    pub tone: Tone,
}

fn response_system_prompt() -> &'static str {
    indoc! {r#"
        You draft email replies. Given an email and optional extra context, respond
        with a single JSON object and nothing else, using exactly these keys:
        {
          "body": <string, the drafted reply>,
          "tone": <"professional" | "friendly" | "formal" | "concise" | "neutral">,
          "alternatives": [<string, up to two alternative drafts>],
          "confidence": <number between 0 and 1>
        }"#}
}

fn quick_replies_system_prompt() -> &'static str {
    indoc! {r#"
        You draft short email replies. Given an email, respond with a single JSON
        object and nothing else:
        {
          "replies": [{"text": <string, one or two sentences>, "tone": <string>}]
        }
        Provide exactly three replies with distinct tones."#}
}

fn email_prompt_block(email: &EmailInput) -> String {
    let body = email
        .body
        .as_deref()
        .or(email.preview.as_deref())
        .unwrap_or("");

    formatdoc! {r#"
        <sender>{sender}</sender>
        <subject>{subject}</subject>
        <body>{body}</body>"#,
        sender = email.sender.as_deref().unwrap_or(""),
        subject = email.subject.as_deref().unwrap_or(""),
        body = truncate_chars(body, cfg.analysis.prompt_body_max_chars),
    }
}

#[derive(Debug, Deserialize)]
struct RawSuggestion {
    body: String,
    #[serde(default)]
    tone: Option<String>,
    #[serde(default)]
    alternatives: Vec<String>,
    #[serde(default)]
    confidence: Option<f32>,
}

pub fn parse_suggestion(text: &str) -> AnalysisResult<ResponseSuggestion> {
    let raw = extract_json_object(text)
        .ok_or_else(|| AnalysisError::MalformedResponse("no JSON object in output".to_string()))?;
    let raw: RawSuggestion = serde_json::from_str(&raw)
        .map_err(|e| AnalysisError::MalformedResponse(format!("unexpected shape: {e}")))?;

    Ok(ResponseSuggestion {
        body: raw.body,
        tone: normalize_tone(raw.tone.as_deref().unwrap_or("")),
        alternatives: raw.alternatives,
        confidence: raw.confidence.unwrap_or(0.5).clamp(0.0, 1.0),
    })
}

#[derive(Debug, Deserialize)]
struct RawQuickReply {
    text: String,
    #[serde(default)]
    tone: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawQuickReplies {
    replies: Vec<RawQuickReply>,
}

pub fn parse_quick_replies(text: &str) -> AnalysisResult<Vec<QuickReply>> {
    let raw = extract_json_object(text)
        .ok_or_else(|| AnalysisError::MalformedResponse("no JSON object in output".to_string()))?;
    let raw: RawQuickReplies = serde_json::from_str(&raw)
        .map_err(|e| AnalysisError::MalformedResponse(format!("unexpected shape: {e}")))?;

    if raw.replies.is_empty() {
        return Err(AnalysisError::MalformedResponse(
            "no replies in output".to_string(),
        ));
    }

    Ok(raw
        .replies
        .into_iter()
        .map(|r| QuickReply {
            text: r.text,
            tone: normalize_tone(r.tone.as_deref().unwrap_or("")),
        })
        .collect())
}

pub async fn generate_response(
    http_client: &HttpClient,
    rate_limiters: &RateLimiters,
    email: &EmailInput,
    context: Option<&str>,
) -> AnalysisResult<ResponseSuggestion> {
    let mut user_content = formatdoc! {r#"
        Draft a reply to the following email.
        {email}"#,
        email = email_prompt_block(email),
    };
    if let Some(context) = context {
        user_content.push_str(&format!("\n<context>{context}</context>"));
    }

    let completion = send_prompt(
        http_client,
        rate_limiters,
        &cfg.model.deep_id,
        response_system_prompt(),
        &user_content,
    )
    .await?;

    parse_suggestion(&completion.text)
}

pub async fn generate_quick_replies(
    http_client: &HttpClient,
    rate_limiters: &RateLimiters,
    email: &EmailInput,
) -> AnalysisResult<Vec<QuickReply>> {
    let user_content = formatdoc! {r#"
        Suggest quick replies to the following email.
        {email}"#,
        email = email_prompt_block(email),
    };

    let completion = send_prompt(
        http_client,
        rate_limiters,
        &cfg.model.quick_id,
        quick_replies_system_prompt(),
        &user_content,
    )
    .await?;

    parse_quick_replies(&completion.text)
}
