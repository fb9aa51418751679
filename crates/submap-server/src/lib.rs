//! HTTP service for subscription migrations.
//!
//! Exposes run submission, status, log, retry and cancel endpoints, the
//! messageset choices used when submitting a run, and the RapidPro optout
//! trigger that reverts a single identity.

pub mod auth;
pub mod config;
pub mod error;
pub mod json;
pub mod routes;

pub use config::{Args, ServerConfig};
pub use error::ServerError;

use std::sync::Arc;

use axum::{middleware, Router};
use submap_core::{Dispatcher, OptoutService, RunStore, SubscriptionGateway};
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across all routes.
#[derive(Clone)]
pub struct AppState {
    /// Run store.
    pub store: RunStore,
    /// Spawns and controls migration runs.
    pub dispatcher: Dispatcher,
    /// Reverts single identities.
    pub optout: Arc<OptoutService>,
    /// Remote subscription service, for messageset choices.
    pub gateway: Arc<dyn SubscriptionGateway>,
    /// Server configuration.
    pub config: Arc<ServerConfig>,
}

impl AppState {
    /// Create new application state.
    pub fn new(
        dispatcher: Dispatcher,
        optout: OptoutService,
        gateway: Arc<dyn SubscriptionGateway>,
        config: ServerConfig,
    ) -> Self {
        Self {
            store: dispatcher.store().clone(),
            dispatcher,
            optout: Arc::new(optout),
            gateway,
            config: Arc::new(config),
        }
    }
}

/// Create the router with all routes.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api = Router::new()
        .merge(routes::messagesets::routes())
        .merge(routes::migrations::routes())
        .merge(routes::optout::routes())
        .route_layer(middleware::from_fn_with_state(state.clone(), auth::require_token));

    Router::new()
        .merge(routes::health::routes())
        .nest("/api/v1", api)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
        .with_state(state)
}
