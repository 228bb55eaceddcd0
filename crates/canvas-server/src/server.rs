use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

use crate::{config::AppConfig, handlers, runtime::AuthzRuntime};

#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<AuthzRuntime>,
}

pub fn build_app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(handlers::healthz))
        .route("/metrics", get(handlers::metrics))
        .route("/authz/snapshot", get(handlers::snapshot))
        .route(
            "/authz/invalidate/{subject_id}",
            post(handlers::invalidate_subject),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub struct AuthzServer {
    addr: SocketAddr,
    app: Router,
    runtime: Arc<AuthzRuntime>,
}

impl AuthzServer {
    pub fn new(cfg: &AppConfig, runtime: Arc<AuthzRuntime>) -> Self {
        let app = build_app(AppState {
            runtime: Arc::clone(&runtime),
        });
        Self {
            addr: cfg.addr(),
            app,
            runtime,
        }
    }

    /// Serve until Ctrl+C, then close the runtime.
    pub async fn run(self) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        tracing::info!("listening on {}", self.addr);
        let served = axum::serve(listener, self.app)
            .with_graceful_shutdown(shutdown_signal())
            .await;
        self.runtime.close().await;
        served?;
        Ok(())
    }
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
