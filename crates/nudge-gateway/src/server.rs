//! HTTP server implementation using Axum.

use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
};
use nudge_core::config::GatewayConfig;
use nudge_scheduler::{Enqueuer, FollowUpQueue};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Shared state for the gateway server.
#[derive(Clone)]
pub struct AppState {
    pub gateway_config: GatewayConfig,
    pub start_time: std::time::Instant,
    /// Enqueuer — single-contact and bulk scheduling decisions.
    pub enqueuer: Arc<Enqueuer>,
    /// Follow-up queue — read-only listing for operators.
    pub queue: FollowUpQueue,
}

impl AppState {
    pub fn new(gateway_config: GatewayConfig, enqueuer: Arc<Enqueuer>) -> Self {
        let queue = enqueuer.queue().clone();
        Self {
            gateway_config,
            start_time: std::time::Instant::now(),
            enqueuer,
            queue,
        }
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    let cors = cors_layer(&state.gateway_config);
    let shared = Arc::new(state);

    Router::new()
        .route("/health", get(super::routes::health_check))
        // Follow-up triggers
        .route("/api/v1/followups/enqueue", post(super::routes::enqueue_contact))
        .route("/api/v1/followups/scan", post(super::routes::scan_inactive))
        .route("/api/v1/followups/pending", get(super::routes::list_pending))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(shared)
}

/// CORS for browser-side triggers. Preflight requests get an empty 200.
fn cors_layer(config: &GatewayConfig) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::OPTIONS,
        ])
        .allow_headers(Any)
        .max_age(std::time::Duration::from_secs(3600));

    // Restrict origins in production via env var or config
    // Example: NUDGE_CORS_ORIGINS=https://app.example.com,https://crm.example.com
    let origins: Vec<String> = match std::env::var("NUDGE_CORS_ORIGINS") {
        Ok(raw) => raw.split(',').map(|s| s.trim().to_string()).collect(),
        Err(_) => config.cors_origins.clone(),
    };
    let origins: Vec<_> = origins
        .iter()
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.parse::<axum::http::HeaderValue>().ok())
        .collect();

    if origins.is_empty() {
        // Development fallback — allow all origins
        cors.allow_origin(Any)
    } else {
        cors.allow_origin(origins)
    }
}

/// Start the HTTP server.
pub async fn start(state: AppState) -> anyhow::Result<()> {
    let addr = format!("{}:{}", state.gateway_config.host, state.gateway_config.port);
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("🌐 Gateway server listening on http://{}", addr);

    axum::serve(listener, app).await?;
    Ok(())
}
