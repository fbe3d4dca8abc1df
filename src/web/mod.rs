//! Web server module.

mod handlers;

pub use handlers::*;

use crate::db::Store;
use crate::incident::IncidentStore;
use crate::metrics::PrometheusSink;

use axum::{routing::get, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub sink: Arc<PrometheusSink>,
    pub store: Arc<Store>,
    pub incidents: IncidentStore,
}

/// Metrics and read-only API server.
pub struct Server {
    port: u16,
    state: AppState,
}

impl Server {
    pub fn new(port: u16, sink: Arc<PrometheusSink>, store: Arc<Store>, incidents: IncidentStore) -> Self {
        Self {
            port,
            state: AppState {
                sink,
                store,
                incidents,
            },
        }
    }

    /// Build the router with all routes.
    fn routes(&self) -> Router {
        let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any);

        Router::new()
            .route("/metrics", get(handlers::handle_metrics))
            .route("/api/incidents", get(handlers::handle_incidents))
            .route("/api/results", get(handlers::handle_results))
            .route("/healthz", get(handlers::handle_healthz))
            .layer(cors)
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Serve on all interfaces until the listener fails.
    pub async fn start(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let router = self.routes();

        tracing::info!("Metrics server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router).await?;

        Ok(())
    }
}
