use serde::{Deserialize, Serialize};

/// Graph `itemBody` shape: `contentType` is `"text"` or `"html"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphItemBody {
    pub content_type: String,
    pub content: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphMessage {
    pub id: String,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub body: Option<GraphItemBody>,
    #[serde(default)]
    pub body_preview: Option<String>,
}

/// Normalized attachment listing, exposed as-is on the content route.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentMeta {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub size: i64,
    #[serde(default)]
    pub is_inline: bool,
}

#[derive(Debug, Deserialize)]
pub struct GraphCollection<T> {
    pub value: Vec<T>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GraphErrorDetail {
    pub code: String,
    pub message: String,
}

/// Graph API error envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct GraphError {
    pub error: GraphErrorDetail,
}

#[derive(Debug, Deserialize)]
pub struct BatchResponseItem {
    pub id: String,
    pub status: u16,
}

#[derive(Debug, Deserialize)]
pub struct BatchResponse {
    pub responses: Vec<BatchResponseItem>,
}
