//! HTTP server implementation.

use std::future::Future;
use std::net::SocketAddr;

use axum::Router;
use tokio::net::TcpListener;
use tracing::{error, info};

use super::service::{router, RateLimitState};
use crate::error::{Result, WardenError};

/// HTTP server fronted by the rate limit middleware.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// Application routes with the middleware applied
    router: Router,
}

impl HttpServer {
    /// Create a new HTTP server.
    pub fn new(addr: SocketAddr, state: RateLimitState) -> Self {
        Self {
            addr,
            router: router(state),
        }
    }

    /// Start the HTTP server.
    ///
    /// This method will block until the server fails.
    pub async fn serve(self) -> Result<()> {
        self.serve_with_shutdown(std::future::pending()).await
    }

    /// Start the HTTP server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await?;

        info!(
            addr = %listener.local_addr()?,
            "Starting HTTP server with graceful shutdown"
        );

        axum::serve(
            listener,
            self.router
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            WardenError::Io(e)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimitingConfig;
    use crate::ratelimit::{LimitPolicy, LocalStore, RateLimiter};
    use std::sync::Arc;

    fn test_state() -> RateLimitState {
        let config = RateLimitingConfig::default();
        let limiter = Arc::new(RateLimiter::new(
            Arc::new(LocalStore::new()),
            LimitPolicy::from(&config),
        ));
        RateLimitState::new(limiter, &config).unwrap()
    }

    #[tokio::test]
    async fn test_server_shuts_down_on_signal() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let server = HttpServer::new(addr, test_state());

        let result = server.serve_with_shutdown(async {}).await;
        assert!(result.is_ok());
    }
}
