mod error;
mod sync;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    http::{header, HeaderValue, Method},
    routing::get,
    Json, Router,
};
use lumen_common::types::ServiceInfo;
use lumen_config::{init_tracing, AppConfig};
use lumen_db::bulk_jobs::repositories::BulkJobRepository;
use lumen_db::connections::repositories::ConnectionRepository;
use lumen_sync::{
    ConnectionSyncController, CredentialLimiter, HttpPlatformApi, HttpPlatformConfig, SyncPorts,
    SyncSettings,
};
use tower_http::cors::CorsLayer;

#[derive(Clone)]
pub struct AppState {
    pub controller: ConnectionSyncController,
    pub connections: Arc<dyn ConnectionRepository>,
    pub jobs: Arc<dyn BulkJobRepository>,
}

impl AppState {
    pub fn new(ports: SyncPorts, settings: SyncSettings) -> Self {
        Self {
            connections: ports.connections.clone(),
            jobs: ports.jobs.clone(),
            controller: ConnectionSyncController::new(ports, settings),
        }
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn info() -> Json<ServiceInfo> {
    Json(ServiceInfo::new("lumen-api"))
}

fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin([
            HeaderValue::from_static("http://localhost:3000"),
            HeaderValue::from_static("http://127.0.0.1:3000"),
        ])
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);

    Router::new()
        .route("/health", get(health))
        .route("/info", get(info))
        .merge(sync::router())
        .layer(cors)
        .with_state(state)
}

#[tokio::main]
async fn main() {
    init_tracing("info");

    let config = AppConfig::from_env().expect("failed to load config");
    let settings = SyncSettings::from_env().expect("failed to load sync settings");
    let platform = HttpPlatformConfig::from_env().expect("failed to load platform config");
    tracing::info!(service = "lumen-api", base_url = %platform.base_url, "starting");

    let pool = lumen_db::create_pool(&config.database_url)
        .await
        .expect("failed to create database pool");
    lumen_db::run_migrations(&pool)
        .await
        .expect("failed to run migrations");

    let api = HttpPlatformApi::new(
        platform,
        settings.retry,
        CredentialLimiter::new(settings.max_in_flight_per_credential),
    )
    .expect("failed to build platform client");

    let state = AppState::new(SyncPorts::postgres(Arc::new(api), pool), settings);
    let app = build_router(state);
    let addr: SocketAddr = config.bind_addr().parse().expect("invalid bind address");

    tracing::info!(%addr, "listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind");
    axum::serve(listener, app).await.expect("server error");
}
