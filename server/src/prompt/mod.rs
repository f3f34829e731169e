pub mod batch;
pub mod claude;
pub mod combined;
pub mod respond;
pub mod smart;

use derive_more::derive::Display;
use serde::{Deserialize, Serialize};

/// Errors an analyzer call can produce. Batch callers catch these per email;
/// route handlers convert them into the HTTP error taxonomy via
/// `From<AnalysisError> for AppError`.
#[derive(Debug, Display)]
pub enum AnalysisError {
    #[display("model API key is not set")]
    MissingApiKey,
    #[display("model rate limit exceeded")]
    RateLimited,
    #[display("malformed model response: {_0}")]
    MalformedResponse(String),
    #[display("model API error: {_0}")]
    Api(String),
    #[display("transport error: {_0}")]
    Transport(reqwest::Error),
}

impl std::error::Error for AnalysisError {}

impl From<reqwest::Error> for AnalysisError {
    fn from(error: reqwest::Error) -> Self {
        AnalysisError::Transport(error)
    }
}

pub type AnalysisResult<T> = Result<T, AnalysisError>;

#[derive(Debug, Serialize, Deserialize)]
pub struct PromptUsage {
    pub input_tokens: i64,
    pub output_tokens: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ContentBlock {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub text: String,
}

/// Successful response body of the messages endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct MessagesApiResponse {
    pub content: Vec<ContentBlock>,
    pub model: String,
    pub stop_reason: Option<String>,
    pub usage: PromptUsage,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MessagesApiErrorDetail {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MessagesApiError {
    pub error: MessagesApiErrorDetail,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessagesApiResponseOrError {
    Response(MessagesApiResponse),
    Error(MessagesApiError),
}
