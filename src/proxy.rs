use crate::breaker::BreakerRegistry;
use crate::error::{backend_error_response, GatewayErrorCode};
use crate::fallback::LocalRoutes;
use crate::metrics;
use crate::pool::{ConnectionPool, GatewayBody};
use crate::routes::{RouteEntry, RouteTable};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use hyper_util::server::graceful::GracefulShutdown;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";

/// Routes requests to backends by path, behind their circuit breakers
pub struct Dispatcher {
    routes: Arc<RouteTable>,
    breakers: Arc<BreakerRegistry>,
    pool: Arc<ConnectionPool>,
    fallback: LocalRoutes,
    request_timeout: Duration,
}

/// Records a failure for a permitted call unless an outcome was recorded
///
/// Covers the dispatch future being dropped mid-call, which would otherwise
/// leave a half-open breaker waiting forever on its trial.
struct OutcomeGuard<'a> {
    breakers: &'a BreakerRegistry,
    backend: &'a str,
    recorded: bool,
}

impl<'a> OutcomeGuard<'a> {
    fn new(breakers: &'a BreakerRegistry, backend: &'a str) -> Self {
        Self {
            breakers,
            backend,
            recorded: false,
        }
    }

    fn record(mut self, success: bool) {
        self.recorded = true;
        self.breakers.record_outcome(self.backend, success);
    }
}

impl Drop for OutcomeGuard<'_> {
    fn drop(&mut self) {
        if !self.recorded {
            debug!(backend = self.backend, "Request abandoned, recording failure");
            self.breakers.record_outcome(self.backend, false);
        }
    }
}

impl Dispatcher {
    pub fn new(
        routes: Arc<RouteTable>,
        breakers: Arc<BreakerRegistry>,
        pool: Arc<ConnectionPool>,
        fallback: LocalRoutes,
        request_timeout: Duration,
    ) -> Self {
        Self {
            routes,
            breakers,
            pool,
            fallback,
            request_timeout,
        }
    }

    /// Handle one request
    ///
    /// Paths whose first segment names a backend are forwarded to it; all
    /// other paths are answered by the local routes. Never fails: backend
    /// errors become JSON error responses.
    pub async fn dispatch(&self, mut req: Request<GatewayBody>) -> Response<GatewayBody> {
        let started = Instant::now();

        let Some(route) = self.routes.resolve(req.uri().path()) else {
            let response = self.fallback.handle(&req);
            metrics::record_request(metrics::LOCAL_BACKEND, started);
            return response;
        };

        let request_id = req
            .headers()
            .get(X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let id_header = HeaderValue::from_str(&request_id).ok();
        if let Some(value) = &id_header {
            req.headers_mut().insert(X_REQUEST_ID, value.clone());
        }
        debug!(backend = %route.name, method = %req.method(), uri = %req.uri(), request_id, "Incoming request");

        let mut response = self.forward(req, route).await;
        if let Some(value) = id_header {
            response.headers_mut().insert(X_REQUEST_ID, value);
        }
        metrics::record_request(&route.name, started);
        response
    }

    async fn forward(&self, req: Request<GatewayBody>, route: &RouteEntry) -> Response<GatewayBody> {
        let backend = route.name.as_str();

        if !self.breakers.is_call_permitted(backend) {
            debug!(backend, "Circuit open, rejecting request");
            return backend_error_response(
                GatewayErrorCode::CircuitOpen,
                backend,
                format!("Backend {} is temporarily unavailable", backend),
            );
        }

        let outcome = OutcomeGuard::new(&self.breakers, backend);
        let result = tokio::time::timeout(self.request_timeout, self.pool.send_request(req, route)).await;

        match result {
            Ok(Ok(response)) => {
                outcome.record(true);
                response
            }
            Ok(Err(e)) => {
                outcome.record(false);
                error!(backend, port = route.port, error = %e, "Failed to forward request");
                backend_error_response(
                    GatewayErrorCode::BackendUnavailable,
                    backend,
                    format!("Backend {} is currently unavailable", backend),
                )
            }
            Err(_) => {
                outcome.record(false);
                warn!(
                    backend,
                    port = route.port,
                    timeout_secs = self.request_timeout.as_secs(),
                    "Request timed out"
                );
                backend_error_response(
                    GatewayErrorCode::RequestTimeout,
                    backend,
                    format!(
                        "Backend {} did not respond within {} seconds",
                        backend,
                        self.request_timeout.as_secs()
                    ),
                )
            }
        }
    }
}

/// The gateway's HTTP server
pub struct ProxyServer {
    bind_addr: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    shutdown_rx: watch::Receiver<bool>,
    drain_timeout: Duration,
}

impl ProxyServer {
    pub fn new(
        bind_addr: SocketAddr,
        dispatcher: Arc<Dispatcher>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            dispatcher,
            shutdown_rx,
            drain_timeout: Duration::from_secs(10),
        }
    }

    /// Bound on how long in-flight connections may finish after shutdown
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on `listener` until shutdown, then drain
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "Gateway listening (HTTP/1.1 and HTTP/2)");

        let mut builder = AutoBuilder::new(TokioExecutor::new());
        builder.http1().preserve_header_case(true);
        builder.http2().max_concurrent_streams(250);

        let graceful = GracefulShutdown::new();
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let dispatcher = Arc::clone(&self.dispatcher);
                            let service = service_fn(move |req: Request<Incoming>| {
                                let dispatcher = Arc::clone(&dispatcher);
                                async move {
                                    Ok::<_, hyper::Error>(dispatcher.dispatch(req.map(|body| body.boxed())).await)
                                }
                            });

                            let conn = builder.serve_connection_with_upgrades(TokioIo::new(stream), service);
                            let conn = graceful.watch(conn.into_owned());
                            tokio::spawn(async move {
                                if let Err(e) = conn.await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Gateway no longer accepting connections");
                        break;
                    }
                }
            }
        }

        drop(listener);

        match tokio::time::timeout(self.drain_timeout, graceful.shutdown()).await {
            Ok(()) => info!("In-flight connections drained"),
            Err(_) => warn!(
                timeout_secs = self.drain_timeout.as_secs(),
                "Drain timeout elapsed, dropping remaining connections"
            ),
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::BreakerState;
    use crate::notifier::LogNotifier;
    use crate::pool::{full_body, PoolConfig};
    use hyper::StatusCode;

    fn unused_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    fn dispatcher(routes: Vec<RouteEntry>) -> Dispatcher {
        let routes = Arc::new(RouteTable::new(routes));
        let breakers = Arc::new(BreakerRegistry::from_routes(&routes, Arc::new(LogNotifier)));
        Dispatcher::new(
            Arc::clone(&routes),
            Arc::clone(&breakers),
            Arc::new(ConnectionPool::new(PoolConfig::default())),
            LocalRoutes::new(routes, breakers),
            Duration::from_secs(2),
        )
    }

    fn get(path: &str) -> Request<GatewayBody> {
        Request::builder().uri(path).body(full_body("")).unwrap()
    }

    #[tokio::test]
    async fn test_unknown_backend_uses_local_routes() {
        let dispatcher = dispatcher(vec![RouteEntry::new("billing", unused_port())]);

        let response = dispatcher.dispatch(get("/health")).await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = dispatcher.dispatch(get("/unknown/path")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response.headers().get("X-Gateway-Error").unwrap(),
            "UNKNOWN_ROUTE"
        );
    }

    #[tokio::test]
    async fn test_connection_failure_is_503_and_counted() {
        let dispatcher = dispatcher(vec![RouteEntry::new("billing", unused_port())]);

        let response = dispatcher.dispatch(get("/billing/invoices")).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            response.headers().get("X-Gateway-Error").unwrap(),
            "BACKEND_UNAVAILABLE"
        );
        assert_eq!(
            dispatcher.breakers.snapshot("billing").unwrap().consecutive_failures,
            1
        );
    }

    #[tokio::test]
    async fn test_open_breaker_short_circuits() {
        let dispatcher = dispatcher(vec![RouteEntry::new("billing", unused_port())]);

        for _ in 0..3 {
            dispatcher.dispatch(get("/billing")).await;
        }
        assert_eq!(dispatcher.breakers.state("billing"), Some(BreakerState::Open));

        let requests_before = dispatcher.pool.stats().snapshot().total_requests;
        let response = dispatcher.dispatch(get("/billing")).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            response.headers().get("X-Gateway-Error").unwrap(),
            "CIRCUIT_OPEN"
        );
        assert_eq!(dispatcher.pool.stats().snapshot().total_requests, requests_before);
    }

    #[tokio::test]
    async fn test_request_id_echoed_on_backend_errors() {
        let dispatcher = dispatcher(vec![RouteEntry::new("billing", unused_port())]);

        let req = Request::builder()
            .uri("/billing")
            .header(X_REQUEST_ID, "req-42")
            .body(full_body(""))
            .unwrap();
        let response = dispatcher.dispatch(req).await;
        assert_eq!(response.headers().get(X_REQUEST_ID).unwrap(), "req-42");

        // One is generated when the client sent none
        let response = dispatcher.dispatch(get("/billing")).await;
        let generated = response.headers().get(X_REQUEST_ID).unwrap().to_str().unwrap();
        assert!(Uuid::parse_str(generated).is_ok());
    }

    #[test]
    fn test_dropped_guard_records_failure() {
        let routes = RouteTable::new(vec![RouteEntry::new("billing", 8001)]);
        let breakers = BreakerRegistry::from_routes(&routes, Arc::new(LogNotifier));

        drop(OutcomeGuard::new(&breakers, "billing"));
        assert_eq!(breakers.snapshot("billing").unwrap().consecutive_failures, 1);

        OutcomeGuard::new(&breakers, "billing").record(true);
        assert_eq!(breakers.snapshot("billing").unwrap().consecutive_failures, 0);
    }
}
