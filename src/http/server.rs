//! HTTP server implementation.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::routes::{router, AppState};
use crate::batch::BatchProcessor;
use crate::error::{PressgateError, Result};
use crate::ratelimit::RateLimiter;

const DEFAULT_COMPACTION_INTERVAL: Duration = Duration::from_secs(60);

/// HTTP server for the batch API.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// Shared route state
    state: AppState,
    /// How often stale limiter state is compacted
    compaction_interval: Duration,
}

impl HttpServer {
    /// Create a new HTTP server.
    pub fn new(addr: SocketAddr, limiter: Arc<RateLimiter>, processor: BatchProcessor) -> Self {
        Self {
            addr,
            state: AppState::new(limiter, processor),
            compaction_interval: DEFAULT_COMPACTION_INTERVAL,
        }
    }

    pub fn with_compaction_interval(mut self, interval: Duration) -> Self {
        self.compaction_interval = interval;
        self
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Start the HTTP server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves. Limiter
    /// compaction runs alongside and stops with the server.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await.map_err(|e| {
            error!(addr = %self.addr, error = %e, "Failed to bind HTTP listener");
            PressgateError::Io(e)
        })?;

        let shutdown = CancellationToken::new();
        let compaction = self
            .state
            .limiter
            .spawn_compaction(self.compaction_interval, shutdown.clone());

        info!(
            addr = %self.addr,
            max_concurrent = self.state.processor.max_concurrent(),
            "Starting HTTP server with graceful shutdown"
        );

        let app = router(self.state).into_make_service_with_connect_info::<SocketAddr>();
        let served = axum::serve(listener, app)
            .with_graceful_shutdown(signal)
            .await
            .map_err(|e| {
                error!(error = %e, "HTTP server failed");
                PressgateError::Io(e)
            });

        shutdown.cancel();
        let _ = compaction.await;
        served
    }
}
