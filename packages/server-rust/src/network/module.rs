//! Network module with deferred startup lifecycle.
//!
//! `new()` creates shared resources, `start()` binds the TCP listener, and
//! `serve()` accepts connections until shutdown. The split lets callers learn
//! the bound port (e.g. with port 0) before serving.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context as _;
use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tracing::{info, warn};

use super::config::NetworkConfig;
use super::handlers::{
    health_handler, liveness_handler, operation_handler, readiness_handler, AppState,
};
use super::middleware::build_http_layers;
use super::shutdown::DrainController;
use crate::service::OperationWrapper;

/// Manages the HTTP server lifecycle.
pub struct NetworkModule {
    config: NetworkConfig,
    listener: Option<TcpListener>,
    drain: Arc<DrainController>,
    wrapper: OperationWrapper,
}

impl NetworkModule {
    #[must_use]
    pub fn new(config: NetworkConfig, wrapper: OperationWrapper) -> Self {
        Self {
            config,
            listener: None,
            drain: Arc::new(DrainController::new()),
            wrapper,
        }
    }

    /// Returns a shared reference to the drain controller.
    #[must_use]
    pub fn drain_controller(&self) -> Arc<DrainController> {
        Arc::clone(&self.drain)
    }

    /// Assembles the axum router with all routes and middleware.
    ///
    /// Routes:
    /// - `GET /health` -- detailed health JSON
    /// - `GET /health/live` -- liveness probe
    /// - `GET /health/ready` -- readiness probe
    /// - `POST /v1/operations/{name}` -- run an operation
    pub fn build_router(&self) -> Router {
        let state = AppState {
            wrapper: self.wrapper.clone(),
            drain: Arc::clone(&self.drain),
            config: Arc::new(self.config.clone()),
            start_time: Instant::now(),
        };

        Router::new()
            .route("/health", get(health_handler))
            .route("/health/live", get(liveness_handler))
            .route("/health/ready", get(readiness_handler))
            .route("/v1/operations/{name}", post(operation_handler))
            .layer(build_http_layers(&self.config))
            .with_state(state)
    }

    /// Binds the TCP listener to the configured host and port.
    ///
    /// Returns the actual bound port, which may differ from the configured
    /// port when port 0 is used (OS-assigned ephemeral port).
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound (e.g., port in use).
    pub async fn start(&mut self) -> anyhow::Result<u16> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        let port = listener.local_addr()?.port();

        info!(host = %self.config.host, port, "TCP listener bound");

        self.listener = Some(listener);
        Ok(port)
    }

    /// Serves until `shutdown` resolves, then drains in-flight operations.
    ///
    /// After the shutdown signal new operations are refused with a draining
    /// error, and the server waits up to `drain_timeout` for in-flight ones.
    ///
    /// # Errors
    ///
    /// Returns an error if `start()` was not called first or the server hits
    /// a fatal I/O error.
    pub async fn serve(
        mut self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let listener = self
            .listener
            .take()
            .context("start() must be called before serve()")?;
        let router = self.build_router();
        let drain = Arc::clone(&self.drain);

        drain.set_serving();
        info!("Serving HTTP connections");

        let signal_drain = Arc::clone(&drain);
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                shutdown.await;
                info!("Shutdown requested; draining");
                signal_drain.begin_drain();
            })
            .await?;

        if drain.wait_for_drain(self.config.drain_timeout).await {
            info!("All operations drained");
        } else {
            warn!(
                in_flight = drain.in_flight_count(),
                "Drain timeout expired with operations still in flight"
            );
        }
        Ok(())
    }
}
