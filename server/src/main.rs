#![allow(dead_code)]

mod auth;
mod cache;
mod error;
mod graph;
mod model;
mod prompt;
mod rate_limiters;
mod request_tracing;
mod routes;
mod server_config;
mod util;

use std::{env, net::SocketAddr};

use axum::{extract::FromRef, Router};
use cache::{BodyCache, ResponseCache};
use mimalloc::MiMalloc;
use prompt::respond::{QuickReply, ResponseSuggestion};
use rate_limiters::RateLimiters;
use routes::AppRouter;
use sea_orm::{ConnectOptions, Database, DatabaseConnection};
use tokio::{signal, task::JoinHandle};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

pub type HttpClient = reqwest::Client;
pub type SuggestionCache = ResponseCache<ResponseSuggestion>;
pub type QuickReplyCache = ResponseCache<Vec<QuickReply>>;

// sea-orm drops `Clone` from `DatabaseConnection` when its `mock` feature is
// on, so the derives are replaced by equivalent manual impls under `mock`.
#[cfg_attr(not(feature = "mock"), derive(Clone))]
#[derive(FromRef)]
struct ServerState {
    pub http_client: HttpClient,
    #[cfg_attr(feature = "mock", from_ref(skip))]
    pub conn: DatabaseConnection,
    pub rate_limiters: RateLimiters,
    pub body_cache: BodyCache,
    pub suggestion_cache: SuggestionCache,
    pub quick_reply_cache: QuickReplyCache,
}

#[cfg(feature = "mock")]
fn clone_conn(conn: &DatabaseConnection) -> DatabaseConnection {
    match conn {
        DatabaseConnection::SqlxPostgresPoolConnection(c) => {
            DatabaseConnection::SqlxPostgresPoolConnection(c.clone())
        }
        DatabaseConnection::MockDatabaseConnection(m) => {
            DatabaseConnection::MockDatabaseConnection(m.clone())
        }
        DatabaseConnection::Disconnected => DatabaseConnection::Disconnected,
    }
}

#[cfg(feature = "mock")]
impl Clone for ServerState {
    fn clone(&self) -> Self {
        Self {
            http_client: self.http_client.clone(),
            conn: clone_conn(&self.conn),
            rate_limiters: self.rate_limiters.clone(),
            body_cache: self.body_cache.clone(),
            suggestion_cache: self.suggestion_cache.clone(),
            quick_reply_cache: self.quick_reply_cache.clone(),
        }
    }
}

#[cfg(feature = "mock")]
impl FromRef<ServerState> for DatabaseConnection {
    fn from_ref(state: &ServerState) -> Self {
        clone_conn(&state.conn)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let db_url = env::var("DATABASE_URL").expect("DATABASE_URL is not set in .env file");
    let mut db_options = ConnectOptions::new(db_url);
    db_options.sqlx_logging(false);

    let conn = Database::connect(db_options)
        .await
        .expect("Database connection failed");

    let http_client = reqwest::ClientBuilder::new().use_rustls_tls().build()?;

    let state = ServerState {
        http_client,
        conn,
        rate_limiters: RateLimiters::from_config(),
        body_cache: BodyCache::from_config(),
        suggestion_cache: SuggestionCache::from_config(),
        quick_reply_cache: QuickReplyCache::from_config(),
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::Layer::default().with_ansi(false))
        .init();

    let router = AppRouter::create(state.clone());

    let mut scheduler = JobScheduler::new()
        .await
        .expect("Failed to create scheduler");

    {
        let suggestion_cache = state.suggestion_cache.clone();
        let quick_reply_cache = state.quick_reply_cache.clone();
        // Hourly sweep of hard-expired generated responses
        scheduler
            .add(Job::new_async("0 0 * * * *", move |uuid, _l| {
                let suggestion_cache = suggestion_cache.clone();
                let quick_reply_cache = quick_reply_cache.clone();
                Box::pin(async move {
                    let removed = suggestion_cache.sweep_expired().await
                        + quick_reply_cache.sweep_expired().await;
                    tracing::info!("Response cache sweep {} removed {} entries", uuid, removed);
                })
            })?)
            .await?;
    }

    scheduler.set_shutdown_handler(Box::new(move || {
        Box::pin(async move {
            tracing::info!("Shutting down scheduler");
        })
    }));

    match scheduler.start().await {
        Ok(_) => {
            tracing::info!("Scheduler started");
        }
        Err(e) => {
            tracing::error!("Failed to start scheduler: {:?}", e);
        }
    }

    run_server(router, scheduler).await?;

    Ok(())
}

async fn shutdown_signal(mut scheduler: JobScheduler) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    if let Err(e) = scheduler.shutdown().await {
        tracing::error!("Scheduler shutdown failed: {:?}", e);
    }
    tracing::info!("Cleanups done, shutting down");
}

fn run_server(router: Router, scheduler: JobScheduler) -> JoinHandle<()> {
    tokio::spawn(async {
        let port = env::var("PORT").unwrap_or("5006".to_string());
        tracing::info!("Enrichment server running on http://0.0.0.0:{}", port);
        println!("{}", *server_config::cfg);

        let addr = SocketAddr::from(([0, 0, 0, 0], port.parse::<u16>().unwrap()));
        let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal(scheduler))
        .await
        .unwrap();
    })
}
