//! Axum HTTP surface.
//!
//! ```text
//! GET  /health
//! POST /api/v1/chat          multipart → JSON ChatResponse
//! POST /api/v1/chat/stream   multipart → text/event-stream
//! ```
//!
//! The [`CancellationToken`] passed to [`serve`] is wired to axum's graceful
//! shutdown.

mod api;
mod form;

use std::sync::Arc;

use axum::{
    Router,
    extract::DefaultBodyLimit,
    http::HeaderValue,
    routing::{get, post},
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowHeaders, AllowMethods, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::chat::ChatService;
use crate::config::{ChatDefaults, ServerConfig};
use crate::error::AppError;

/// Router state injected into every handler. Cheap to clone.
#[derive(Clone)]
pub struct HttpState {
    pub chat: Arc<ChatService>,
    /// Values for omitted form fields.
    pub defaults: Arc<ChatDefaults>,
}

impl HttpState {
    pub fn new(chat: ChatService, defaults: ChatDefaults) -> Self {
        Self { chat: Arc::new(chat), defaults: Arc::new(defaults) }
    }
}

pub fn build_router(state: HttpState, server: &ServerConfig) -> Router {
    Router::new()
        .route("/health",              get(api::health))
        .route("/api/v1/chat",         post(api::chat))
        .route("/api/v1/chat/stream",  post(api::chat_stream))
        .layer(DefaultBodyLimit::max(server.max_upload_mb.saturating_mul(1024 * 1024)))
        .layer(cors_layer(&server.cors_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Explicit origins with credentials; methods and headers mirror the preflight.
fn cors_layer(origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(origin = %o, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true)
}

/// Bind `bind_addr` and serve until `shutdown` is cancelled.
pub async fn serve(router: Router, bind_addr: &str, shutdown: CancellationToken) -> Result<(), AppError> {
    let listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| AppError::Server(format!("bind failed on {bind_addr}: {e}")))?;

    info!(%bind_addr, "http server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| AppError::Server(format!("http server error: {e}")))?;

    info!("http server shut down");
    Ok(())
}
