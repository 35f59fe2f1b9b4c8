//! int-activitypub - ActivityPub bridge for the interest matching platform
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      API Layer (Axum)                        │
//! │  - ActivityPub actors, inboxes and collections              │
//! │  - WebFinger / NodeInfo                                     │
//! │  - Hub callback, internal source API                        │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Service Layer                            │
//! │  - Follow lifecycle, inbound dispatch                       │
//! │  - Outbound publishing, queue consumer                      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌──────────────────────────────┬──────────────────────────────┐
//! │          Data Layer          │          Event Layer         │
//! │  - SQLite (sqlx)             │  - CloudEvent conversion     │
//! │  - Source LRU cache          │  - Bus writer pool / queue   │
//! └──────────────────────────────┴──────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - `api`: HTTP handlers
//! - `service`: Federation logic
//! - `federation`: Signatures, WebFinger, ActivityPub client and vocabulary
//! - `event`: CloudEvents and the internal bus
//! - `data`: Database and cache layer
//! - `config`: Configuration management
//! - `error`: Error types

pub mod api;
pub mod cancel;
pub mod config;
pub mod data;
pub mod error;
pub mod event;
pub mod federation;
pub mod metrics;
pub mod service;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<config::AppConfig>,

    /// Follow lifecycle and inbound dispatch
    pub federation: service::FederationService,

    /// Outbound delivery of internal events
    pub publisher: Arc<service::EventPublisher>,

    /// Root token; handlers derive child tokens from it
    pub shutdown: CancellationToken,
}

/// Build the public router.
///
/// Shared by the binary and integration tests to keep route composition
/// consistent across environments.
pub fn build_router(state: AppState) -> axum::Router {
    use axum::Router;
    use tower_http::{compression::CompressionLayer, trace::TraceLayer};

    let cors_layer = build_cors_layer(&state.config.api.http);

    Router::new()
        .route("/health", axum::routing::get(health_check))
        .merge(api::wellknown_router())
        .merge(api::activitypub_router())
        .merge(api::callback_router())
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer)
        .with_state(state)
        .merge(api::metrics_router())
}

/// Build the internal source-management router.
pub fn build_internal_router(state: AppState) -> axum::Router {
    use axum::Router;
    use tower_http::trace::TraceLayer;

    Router::new()
        .route("/health", axum::routing::get(health_check))
        .merge(api::sources_router())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
        .merge(api::metrics_router())
}

fn build_cors_layer(http: &config::HttpConfig) -> tower_http::cors::CorsLayer {
    use axum::http::HeaderValue;
    use tower_http::cors::{Any, CorsLayer};

    let allowed_origin = http.base_url();
    match HeaderValue::from_str(&allowed_origin) {
        Ok(origin) => CorsLayer::new()
            .allow_origin([origin])
            .allow_methods(Any)
            .allow_headers(Any),
        Err(error) => {
            tracing::error!(
                %error,
                origin = %allowed_origin,
                "Failed to parse CORS origin from base URL; denying cross-origin requests"
            );
            CorsLayer::new().allow_methods(Any).allow_headers(Any)
        }
    }
}

async fn health_check() -> &'static str {
    "OK"
}
