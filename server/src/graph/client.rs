use std::sync::Arc;
use std::time::Duration;

use leaky_bucket::RateLimiter;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;

use crate::cache::body_cache::CachedBody;
use crate::error::{AppError, AppResult};
use crate::server_config::cfg;
use crate::HttpClient;

use super::types::{
    AttachmentMeta, BatchResponse, GraphCollection, GraphError, GraphMessage,
};

macro_rules! graph_url {
    ($($params:expr),*) => {
        {
            const GRAPH_ENDPOINT: &str = "https://graph.microsoft.com/v1.0";
            let parts = vec![$($params.to_string()),*];
            format!("{}/{}", GRAPH_ENDPOINT, parts.join("/"))
        }
    };
}

const BATCH_ENDPOINT: &str = "https://graph.microsoft.com/v1.0/$batch";

/// Per-request client over Microsoft Graph, built from the caller-supplied
/// delegated access token. The token is never persisted.
pub struct GraphClient {
    http_client: HttpClient,
    access_token: String,
    rate_limiter: Arc<RateLimiter>,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkReadSummary {
    pub updated: usize,
    pub failed: usize,
}

impl GraphClient {
    pub fn from_access_token(http_client: HttpClient, access_token: String) -> GraphClient {
        let rate_limiter = Arc::new(
            RateLimiter::builder()
                .initial(cfg.graph.quota_per_second)
                .interval(Duration::from_secs(1))
                .refill(cfg.graph.quota_per_second)
                .build(),
        );

        GraphClient {
            http_client,
            access_token,
            rate_limiter,
        }
    }

    async fn handle_response<T: DeserializeOwned>(resp: reqwest::Response) -> AppResult<T> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp.json::<T>().await?);
        }

        let message = match resp.json::<GraphError>().await {
            Ok(err) => format!("{}: {}", err.error.code, err.error.message),
            Err(_) => "unreadable Graph error body".to_string(),
        };

        Err(match status {
            StatusCode::UNAUTHORIZED => AppError::Unauthorized(message),
            StatusCode::NOT_FOUND => AppError::NotFound(message),
            StatusCode::TOO_MANY_REQUESTS => AppError::TooManyRequests,
            _ => AppError::Upstream(status, message),
        })
    }

    pub async fn get_message(&self, message_id: &str) -> AppResult<GraphMessage> {
        self.rate_limiter.acquire_one().await;
        let resp = self
            .http_client
            .get(graph_url!("me", "messages", message_id))
            .query(&[("$select", "id,subject,body,bodyPreview")])
            .bearer_auth(&self.access_token)
            .send()
            .await?;

        Self::handle_response(resp).await
    }

    pub async fn get_attachments(&self, message_id: &str) -> AppResult<Vec<AttachmentMeta>> {
        self.rate_limiter.acquire_one().await;
        let resp = self
            .http_client
            .get(graph_url!("me", "messages", message_id, "attachments"))
            .query(&[("$select", "id,name,contentType,size,isInline")])
            .bearer_auth(&self.access_token)
            .send()
            .await?;

        let collection: GraphCollection<AttachmentMeta> = Self::handle_response(resp).await?;
        Ok(collection.value)
    }

    /// Fetch body and attachments and normalize into the cached-body shape.
    pub async fn fetch_content(&self, message_id: &str) -> AppResult<CachedBody> {
        let message = self.get_message(message_id).await?;
        let attachments = self.get_attachments(message_id).await?;

        let (body, html) = normalize_body(&message);
        Ok(CachedBody::new(body, html, attachments))
    }

    /// Flip the read flag. A single id uses a direct PATCH; multiple ids are
    /// chunked into `$batch` calls of `cfg.graph.mark_read_chunk_size`.
    pub async fn mark_read(&self, message_ids: &[String], is_read: bool) -> AppResult<MarkReadSummary> {
        let mut summary = MarkReadSummary::default();

        if message_ids.is_empty() {
            return Ok(summary);
        }

        if let [message_id] = message_ids {
            self.rate_limiter.acquire_one().await;
            let resp = self
                .http_client
                .patch(graph_url!("me", "messages", message_id))
                .bearer_auth(&self.access_token)
                .json(&json!({ "isRead": is_read }))
                .send()
                .await?;

            if resp.status().is_success() {
                summary.updated = 1;
            } else {
                summary.failed = 1;
                tracing::warn!("Mark-read PATCH failed for {}: {}", message_id, resp.status());
            }
            return Ok(summary);
        }

        for payload in batch_payloads(message_ids, is_read, cfg.graph.mark_read_chunk_size) {
            self.rate_limiter.acquire_one().await;
            let resp = self
                .http_client
                .post(BATCH_ENDPOINT)
                .bearer_auth(&self.access_token)
                .json(&payload)
                .send()
                .await?;

            let batch: BatchResponse = Self::handle_response(resp).await?;
            for item in batch.responses {
                if (200..300).contains(&item.status) {
                    summary.updated += 1;
                } else {
                    summary.failed += 1;
                    tracing::warn!("Batch mark-read item {} failed: {}", item.id, item.status);
                }
            }
        }

        Ok(summary)
    }
}

fn normalize_body(message: &GraphMessage) -> (String, Option<String>) {
    match &message.body {
        Some(body) if body.content_type.eq_ignore_ascii_case("html") => (
            message.body_preview.clone().unwrap_or_default(),
            Some(body.content.clone()),
        ),
        Some(body) => (body.content.clone(), None),
        None => (message.body_preview.clone().unwrap_or_default(), None),
    }
}

/// Build one `$batch` payload per chunk of ids. 45 ids with chunk size 20
/// yield exactly three payloads of 20, 20 and 5 requests.
pub fn batch_payloads(
    message_ids: &[String],
    is_read: bool,
    chunk_size: usize,
) -> Vec<serde_json::Value> {
    message_ids
        .chunks(chunk_size.max(1))
        .map(|chunk| {
            let requests: Vec<serde_json::Value> = chunk
                .iter()
                .enumerate()
                .map(|(idx, message_id)| {
                    json!({
                        "id": (idx + 1).to_string(),
                        "method": "PATCH",
                        "url": format!("/me/messages/{}", message_id),
                        "headers": { "Content-Type": "application/json" },
                        "body": { "isRead": is_read }
                    })
                })
                .collect();

            json!({ "requests": requests })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::types::GraphItemBody;

    fn ids(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("id-{i}")).collect()
    }

    #[test]
    fn test_batch_payloads_45_ids_in_three_chunks() {
        let payloads = batch_payloads(&ids(45), true, 20);
        assert_eq!(payloads.len(), 3);

        let sizes: Vec<usize> = payloads
            .iter()
            .map(|p| p["requests"].as_array().unwrap().len())
            .collect();
        assert_eq!(sizes, vec![20, 20, 5]);
        assert_eq!(sizes.iter().sum::<usize>(), 45);
    }

    #[test]
    fn test_batch_payload_request_shape() {
        let payloads = batch_payloads(&ids(2), false, 20);
        let requests = payloads[0]["requests"].as_array().unwrap();

        assert_eq!(requests[0]["method"], "PATCH");
        assert_eq!(requests[0]["url"], "/me/messages/id-0");
        assert_eq!(requests[0]["body"]["isRead"], false);
        // ids inside a $batch payload must be unique
        assert_ne!(requests[0]["id"], requests[1]["id"]);
    }

    #[test]
    fn test_batch_payloads_empty() {
        assert!(batch_payloads(&[], true, 20).is_empty());
    }

    #[test]
    fn test_normalize_body_html() {
        let message = GraphMessage {
            id: "m1".into(),
            subject: None,
            body: Some(GraphItemBody {
                content_type: "HTML".into(),
                content: "<p>hi</p>".into(),
            }),
            body_preview: Some("hi".into()),
        };
        let (body, html) = normalize_body(&message);
        assert_eq!(body, "hi");
        assert_eq!(html.as_deref(), Some("<p>hi</p>"));
    }

    #[test]
    fn test_normalize_body_text() {
        let message = GraphMessage {
            id: "m1".into(),
            subject: None,
            body: Some(GraphItemBody {
                content_type: "text".into(),
                content: "plain".into(),
            }),
            body_preview: None,
        };
        let (body, html) = normalize_body(&message);
        assert_eq!(body, "plain");
        assert!(html.is_none());
    }
}
