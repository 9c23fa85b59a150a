//! Local HTTP control API for frontends driving the kernel.

pub mod handlers;

use anyhow::Result;
use axum::{
    routing::{get, post},
    Router,
};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::supervisor::KernelSupervisor;

#[derive(Clone)]
pub struct IPCServer {
    pub supervisor: KernelSupervisor,
    pub listen_addr: String,
}

impl IPCServer {
    pub fn new(supervisor: KernelSupervisor, listen_addr: &str) -> Self {
        Self {
            supervisor,
            listen_addr: listen_addr.to_string(),
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/api/kernel/status", get(handlers::kernel::status_handler))
            .route("/api/kernel/start", post(handlers::kernel::start_handler))
            .route("/api/kernel/stop", post(handlers::kernel::stop_handler))
            .route("/api/kernel/validate", get(handlers::kernel::validate_handler))
            .route("/api/kernel/tags", get(handlers::kernel::tags_handler))
            .route("/api/kernel/output", get(handlers::kernel::output_handler))
            .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
            .with_state(self.clone())
    }

    pub async fn start(self) -> Result<()> {
        let router = self.router();
        let listener = tokio::net::TcpListener::bind(&self.listen_addr).await?;
        tracing::info!("IPC listening on http://{}", self.listen_addr);

        axum::serve(listener, router).await?;
        Ok(())
    }
}
