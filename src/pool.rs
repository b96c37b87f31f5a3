//! Connection pool for backend HTTP connections
//!
//! Both the dispatcher and the health monitor talk to backends through this
//! pool so connections to `127.0.0.1:<port>` are reused across requests.

use crate::routes::RouteEntry;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::Bytes;
use hyper::http::uri::{PathAndQuery, Scheme};
use hyper::{Request, Response, StatusCode, Uri, Version};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Body type used on both sides of the gateway
pub type GatewayBody = BoxBody<Bytes, hyper::Error>;

/// Wrap bytes into a [`GatewayBody`]
pub fn full_body(bytes: impl Into<Bytes>) -> GatewayBody {
    Full::new(bytes.into()).map_err(|never| match never {}).boxed()
}

/// An empty [`GatewayBody`]
pub fn empty_body() -> GatewayBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

/// Failure to reach a backend through the pool
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("backend connection failed: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),
    #[error("invalid backend request: {0}")]
    InvalidRequest(String),
}

/// Counters shown on `/status`
#[derive(Debug, Default)]
pub struct PoolStats {
    pub total_requests: AtomicU64,
    pub health_checks: AtomicU64,
}

/// Point-in-time copy of [`PoolStats`]
#[derive(Debug, Clone, Copy, Serialize)]
pub struct PoolStatsSnapshot {
    pub total_requests: u64,
    pub health_checks: u64,
}

impl PoolStats {
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_health_check(&self) {
        self.health_checks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PoolStatsSnapshot {
        PoolStatsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            health_checks: self.health_checks.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_idle_per_host: usize,
    /// Idle keep-alive connections are closed after this long
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

/// Keep-alive HTTP/1.1 clients for proxied traffic and health probes
pub struct ConnectionPool {
    client: Client<HttpConnector, GatewayBody>,
    /// Separate client so probes never queue behind proxied traffic
    health_client: Client<HttpConnector, Empty<Bytes>>,
    stats: Arc<PoolStats>,
    config: PoolConfig,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector.clone());

        let health_client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Connection pool initialized"
        );

        Self {
            client,
            health_client,
            stats: Arc::new(PoolStats::default()),
            config,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn stats(&self) -> Arc<PoolStats> {
        Arc::clone(&self.stats)
    }

    /// Forward a request to a backend, keeping method, headers, path and body
    pub async fn send_request(
        &self,
        req: Request<GatewayBody>,
        route: &RouteEntry,
    ) -> Result<Response<GatewayBody>, PoolError> {
        let (mut parts, body) = req.into_parts();

        let path_and_query = parts
            .uri
            .path_and_query()
            .cloned()
            .unwrap_or_else(|| PathAndQuery::from_static("/"));

        parts.uri = Uri::builder()
            .scheme(Scheme::HTTP)
            .authority(route.authority().clone())
            .path_and_query(path_and_query)
            .build()
            .map_err(|e| PoolError::InvalidRequest(e.to_string()))?;
        // The backend client speaks HTTP/1.1 regardless of the client's protocol
        parts.version = Version::HTTP_11;

        self.stats.record_request();

        let response = self
            .client
            .request(Request::from_parts(parts, body))
            .await?;

        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, body.boxed()))
    }

    /// Probe `GET http://127.0.0.1:<port><path>` and return the status code
    pub async fn check_backend(&self, port: u16, path: &str) -> Result<StatusCode, PoolError> {
        let uri = format!("http://127.0.0.1:{}{}", port, path);

        let req = Request::get(uri)
            .body(Empty::<Bytes>::new())
            .map_err(|e| PoolError::InvalidRequest(e.to_string()))?;

        self.stats.record_health_check();

        let response = self.health_client.request(req).await?;
        Ok(response.status())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_stats() {
        let stats = PoolStats::default();
        assert_eq!(stats.snapshot().total_requests, 0);

        stats.record_request();
        stats.record_request();
        stats.record_health_check();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.total_requests, 2);
        assert_eq!(snapshot.health_checks, 1);
    }

    fn unused_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_check_backend_connection_refused() {
        let port = unused_port();

        let pool = ConnectionPool::new(PoolConfig::default());
        assert!(pool.check_backend(port, "/health").await.is_err());
        assert_eq!(pool.stats().snapshot().health_checks, 1);
    }

    #[tokio::test]
    async fn test_send_request_connection_refused() {
        let port = unused_port();

        let pool = ConnectionPool::new(PoolConfig::default());
        let req = Request::builder()
            .uri("/billing/invoices?page=2")
            .body(empty_body())
            .unwrap();
        let result = pool.send_request(req, &RouteEntry::new("billing", port)).await;
        assert!(matches!(result, Err(PoolError::Client(_))));
    }
}
