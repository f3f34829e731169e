use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::json;

use crate::rate_limiters::RateLimiters;
use crate::server_config::cfg;
use crate::HttpClient;

use super::{AnalysisError, AnalysisResult, MessagesApiResponseOrError};

#[derive(Debug)]
pub struct PromptCompletion {
    pub text: String,
    pub model: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
}

/// Issue one chat request against the messages endpoint and return the text
/// of the first content block.
pub async fn send_prompt(
    http_client: &HttpClient,
    rate_limiters: &RateLimiters,
    model_id: &str,
    system_prompt: &str,
    user_content: &str,
) -> AnalysisResult<PromptCompletion> {
    if !cfg.api.is_configured() {
        return Err(AnalysisError::MissingApiKey);
    }

    rate_limiters.acquire_one().await;

    let resp = http_client
        .post(&cfg.api.endpoint)
        .header("x-api-key", &cfg.api.key)
        .header("anthropic-version", &cfg.api.version)
        .json(&json!({
            "model": model_id,
            "max_tokens": cfg.model.max_tokens,
            "temperature": cfg.model.temperature,
            "system": system_prompt,
            "messages": [
                {
                    "role": "user",
                    "content": user_content
                }
            ]
        }))
        .send()
        .await?
        .json::<serde_json::Value>()
        .await?;

    let parsed = serde_json::from_value::<MessagesApiResponseOrError>(resp.clone())
        .map_err(|_| AnalysisError::MalformedResponse(format!("unrecognized body: {resp}")))?;

    let parsed = match parsed {
        MessagesApiResponseOrError::Error(error) => {
            if error.error.kind == "rate_limit_error" {
                rate_limiters.trigger_backoff();
                return Err(AnalysisError::RateLimited);
            }
            return Err(AnalysisError::Api(error.error.message));
        }
        MessagesApiResponseOrError::Response(parsed) => parsed,
    };

    let text = parsed
        .content
        .iter()
        .find(|block| block.kind == "text")
        .map(|block| block.text.clone())
        .ok_or_else(|| AnalysisError::MalformedResponse("no text content block".to_string()))?;

    Ok(PromptCompletion {
        text,
        model: parsed.model,
        input_tokens: parsed.usage.input_tokens,
        output_tokens: parsed.usage.output_tokens,
    })
}

static RE_CODE_FENCE: Lazy<Regex> = Lazy::new(|| Regex::new(r"```(?:json)?").unwrap());

/// Extract the first balanced JSON object from model output. Code fences are
/// stripped first; braces inside string literals do not count.
pub fn extract_json_object(text: &str) -> Option<String> {
    let stripped = RE_CODE_FENCE.replace_all(text, "");

    let start = stripped.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in stripped[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(stripped[start..start + offset + ch.len_utf8()].to_string());
                }
            }
            _ => {}
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_plain_object() {
        let out = extract_json_object(r#"{"priority": 80}"#).unwrap();
        assert_eq!(out, r#"{"priority": 80}"#);
    }

    #[test]
    fn test_extract_strips_code_fence() {
        let text = "Here you go:\n```json\n{\"priority\": 55, \"category\": \"work\"}\n```";
        let out = extract_json_object(text).unwrap();
        let value: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value["priority"], 55);
    }

    #[test]
    fn test_extract_takes_first_object_with_nesting() {
        let text = r#"prose {"a": {"b": 1}, "c": [1, 2]} trailing {"d": 2}"#;
        let out = extract_json_object(text).unwrap();
        assert_eq!(out, r#"{"a": {"b": 1}, "c": [1, 2]}"#);
    }

    #[test]
    fn test_extract_ignores_braces_inside_strings() {
        let text = r#"{"reason": "uses {braces} inside", "priority": 10}"#;
        let out = extract_json_object(text).unwrap();
        let value: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value["reason"], "uses {braces} inside");
    }

    #[test]
    fn test_extract_none_without_object() {
        assert!(extract_json_object("no json here").is_none());
        assert!(extract_json_object("{\"unterminated\": ").is_none());
    }
}
