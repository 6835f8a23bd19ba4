//! HTTP server and process lifecycle

use anyhow::{Context, Result};
use axum::Router;
use conductor_api::{create_router, AppState};
use conductor_core::ServerConfig;
use conductor_workflow::WorkflowEngine;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub struct Server {
    config: ServerConfig,
    engine: WorkflowEngine,
}

impl Server {
    pub fn new(config: ServerConfig, engine: WorkflowEngine) -> Self {
        Self { config, engine }
    }

    pub async fn run(self) -> Result<()> {
        let addr = self.config.address();
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind HTTP server to {}", addr))?;
        info!("HTTP server listening on {}", addr);

        let shutdown = CancellationToken::new();
        let maintenance = self.engine.spawn_maintenance(shutdown.child_token());

        let signal = shutdown.clone();
        let result = axum::serve(listener, self.router().into_make_service())
            .with_graceful_shutdown(async move {
                shutdown_signal().await;
                signal.cancel();
            })
            .await
            .context("HTTP server error");

        shutdown.cancel();
        if let Err(e) = maintenance.await {
            error!(error = %e, "Maintenance task panicked");
        }
        self.engine.shutdown();

        result
    }

    fn router(&self) -> Router {
        create_router(AppState::new(self.engine.clone()))
    }
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received terminate signal, shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_router_serves_health() {
        let server = Server::new(ServerConfig::new(), WorkflowEngine::builder().build());
        let response = server
            .router()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
