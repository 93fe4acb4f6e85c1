//! HTTP server wiring: routes, CORS, tracing and graceful shutdown.

use crate::gateway::{websocket_handler, AppState};
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

pub struct GameServer {
    state: Arc<AppState>,
}

impl GameServer {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(health_handler))
            .route("/ws", get(websocket_handler))
            .with_state(self.state.clone())
            .layer(cors_layer(&self.state.config.server.frontend_url))
            .layer(TraceLayer::new_for_http())
    }

    pub async fn run(self) -> Result<(), Box<dyn std::error::Error>> {
        let addr = SocketAddr::from((
            self.state.config.server.host.parse::<std::net::IpAddr>()?,
            self.state.config.server.port,
        ));
        let app = self.router();

        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!(%addr, "server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        info!("server stopped");
        Ok(())
    }
}

fn cors_layer(frontend_url: &str) -> CorsLayer {
    if frontend_url == "*" || frontend_url.is_empty() {
        CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any)
    } else {
        let origins: Vec<axum::http::HeaderValue> =
            frontend_url.split(',').filter_map(|o| o.trim().parse().ok()).collect();
        CorsLayer::new().allow_origin(origins).allow_methods(Any).allow_headers(Any)
    }
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let round = state.engine.snapshot().await;
    Json(json!({
        "status": "ok",
        "connections": state.connection_count(),
        "round": round.map(|r| json!({
            "round_id": r.round_id,
            "status": r.status,
            "multiplier": r.current_multiplier,
        })),
    }))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            tracing::error!(%err, "failed to install ctrl-c handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => tracing::error!(%err, "failed to install signal handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received");
}
