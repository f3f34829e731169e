use std::time::Duration;

use axum::{
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use http::HeaderValue;
use tower_http::{cors::CorsLayer, timeout::TimeoutLayer};

use crate::{request_tracing, ServerState};

use super::{ai, emails};

const GENERATE_RESPONSE_BUDGET: Duration = Duration::from_secs(60);
const SMART_ANALYZE_BUDGET: Duration = Duration::from_secs(300);
const QUICK_REPLIES_BUDGET: Duration = Duration::from_secs(30);

#[cfg(debug_assertions)]
mod dev {
    use axum::{extract::Query, http::StatusCode, response::IntoResponse, Json};
    use serde::{Deserialize, Serialize};

    use crate::auth::jwt::generate_dev_token;

    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct DevTokenParams {
        #[serde(default = "default_user_id")]
        pub user_id: String,
        #[serde(default = "default_email")]
        pub email: String,
    }

    fn default_user_id() -> String {
        "dev-user".to_string()
    }

    fn default_email() -> String {
        "test@example.com".to_string()
    }

    #[derive(Serialize)]
    struct DevTokenResponse {
        token: String,
    }

    pub async fn dev_token(Query(params): Query<DevTokenParams>) -> impl IntoResponse {
        match generate_dev_token(&params.user_id, &params.email) {
            Ok(token) => (StatusCode::OK, Json(DevTokenResponse { token })).into_response(),
            Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Failed to create token").into_response(),
        }
    }
}

pub struct AppRouter;

impl AppRouter {
    pub fn create(state: ServerState) -> Router {
        let origins: Vec<HeaderValue> = ["https://localhost:3000", "http://localhost:3000"]
            .into_iter()
            .filter_map(|origin| origin.parse::<HeaderValue>().ok())
            .collect();

        let cors_layer = CorsLayer::new()
            .allow_origin(origins)
            .allow_headers(tower_http::cors::Any)
            .allow_methods(tower_http::cors::Any);

        let ai_router = Router::new()
            .route("/analyze-priority", post(ai::analyze_priority))
            .route("/batch-analyze", post(ai::batch_analyze))
            .route(
                "/generate-response",
                post(ai::generate_response_handler)
                    .layer(TimeoutLayer::new(GENERATE_RESPONSE_BUDGET)),
            )
            .route(
                "/quick-replies",
                post(ai::quick_replies).layer(TimeoutLayer::new(QUICK_REPLIES_BUDGET)),
            )
            .route(
                "/smart-analyze",
                post(ai::smart_analyze).layer(TimeoutLayer::new(SMART_ANALYZE_BUDGET)),
            )
            .route("/status", get(ai::status))
            .route("/suggestions", post(ai::suggestions));

        let emails_router = Router::new()
            .route("/analyze", post(emails::analyze))
            .route("/content/:message_id", get(emails::content))
            .route("/mark-read", post(emails::mark_read))
            .route("/metadata", get(emails::metadata));

        let router = Router::new()
            .route("/", get(|| async { "Enrichment server" }))
            .nest("/ai", ai_router)
            .nest("/emails", emails_router)
            .layer(request_tracing::trace_with_request_id_layer())
            .layer(cors_layer)
            .with_state(state)
            .fallback(handler_404);

        #[cfg(debug_assertions)]
        let router = router.route("/dev/token", get(dev::dev_token));

        router
    }
}

pub async fn handler_404() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "Route does not exist")
}
