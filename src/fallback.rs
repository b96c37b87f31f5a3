//! The gateway's own routes
//!
//! Requests whose first path segment doesn't name a backend end up here:
//! liveness, version and a status view of breakers and probe results.

use crate::breaker::{BreakerRegistry, BreakerSnapshot};
use crate::error::{json_error_response, GatewayErrorCode};
use crate::health::{HealthMonitor, HealthRecord};
use crate::pool::{full_body, GatewayBody, PoolStats, PoolStatsSnapshot};
use crate::routes::RouteTable;
use hyper::{Method, Request, Response, StatusCode};
use serde::Serialize;
use std::sync::Arc;

/// Version information for the gateway
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Helper to create a simple text response
fn text_response(status: StatusCode, body: &'static str) -> Response<GatewayBody> {
    Response::builder()
        .status(status)
        .header("content-type", "text/plain")
        .body(full_body(body))
        .expect("valid response with StatusCode enum and static header")
}

/// Helper to create a JSON response
fn json_response<T: Serialize>(body: &T) -> Response<GatewayBody> {
    match serde_json::to_vec(body) {
        Ok(json) => Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "application/json")
            .body(full_body(json))
            .expect("valid response with StatusCode enum and static header"),
        Err(e) => json_error_response(
            GatewayErrorCode::InternalError,
            format!("Failed to encode response: {}", e),
        ),
    }
}

#[derive(Serialize)]
struct IndexBody<'a> {
    name: &'a str,
    version: &'a str,
    backends: Vec<&'a str>,
}

#[derive(Serialize)]
struct VersionBody<'a> {
    name: &'a str,
    version: &'a str,
}

#[derive(Serialize)]
struct BackendStatus<'a> {
    name: &'a str,
    port: u16,
    breaker: Option<BreakerSnapshot>,
    last_probe: Option<HealthRecord>,
}

#[derive(Serialize)]
struct StatusBody<'a> {
    backends: Vec<BackendStatus<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pool: Option<PoolStatsSnapshot>,
}

/// Local route handler
pub struct LocalRoutes {
    routes: Arc<RouteTable>,
    breakers: Arc<BreakerRegistry>,
    monitor: Option<Arc<HealthMonitor>>,
    pool_stats: Option<Arc<PoolStats>>,
}

impl LocalRoutes {
    pub fn new(routes: Arc<RouteTable>, breakers: Arc<BreakerRegistry>) -> Self {
        Self {
            routes,
            breakers,
            monitor: None,
            pool_stats: None,
        }
    }

    /// Include the latest probe results in `/status`
    pub fn with_monitor(mut self, monitor: Arc<HealthMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Include connection pool counters in `/status`
    pub fn with_pool_stats(mut self, stats: Arc<PoolStats>) -> Self {
        self.pool_stats = Some(stats);
        self
    }

    pub fn handle<B>(&self, req: &Request<B>) -> Response<GatewayBody> {
        match (req.method(), req.uri().path()) {
            (&Method::GET, "/") => json_response(&IndexBody {
                name: PKG_NAME,
                version: VERSION,
                backends: self.routes.names(),
            }),
            (&Method::GET, "/health") => text_response(StatusCode::OK, "ok"),
            (&Method::GET, "/version") => json_response(&VersionBody {
                name: PKG_NAME,
                version: VERSION,
            }),
            (&Method::GET, "/status") => json_response(&self.status()),
            (_, path) => json_error_response(
                GatewayErrorCode::UnknownRoute,
                format!("No backend or local route for {}", path),
            ),
        }
    }

    fn status(&self) -> StatusBody<'_> {
        let backends = self
            .routes
            .iter()
            .map(|route| BackendStatus {
                name: &route.name,
                port: route.port,
                breaker: self.breakers.snapshot(&route.name),
                last_probe: self
                    .monitor
                    .as_ref()
                    .and_then(|m| m.last_record(&route.name)),
            })
            .collect();

        StatusBody {
            backends,
            pool: self.pool_stats.as_ref().map(|s| s.snapshot()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::BreakerState;
    use crate::notifier::LogNotifier;
    use crate::routes::RouteEntry;
    use http_body_util::BodyExt;

    fn local_routes() -> LocalRoutes {
        let routes = Arc::new(RouteTable::new(vec![
            RouteEntry::new("main", 8000),
            RouteEntry::new("billing", 8001),
        ]));
        let breakers = Arc::new(BreakerRegistry::from_routes(&routes, Arc::new(LogNotifier)));
        LocalRoutes::new(routes, breakers).with_pool_stats(Arc::new(PoolStats::default()))
    }

    fn get(path: &str) -> Request<()> {
        Request::builder().uri(path).body(()).unwrap()
    }

    async fn json_body(response: Response<GatewayBody>) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_index_lists_backends() {
        let response = local_routes().handle(&get("/"));
        assert_eq!(response.status(), StatusCode::OK);

        let json = json_body(response).await;
        assert_eq!(json["name"], PKG_NAME);
        assert_eq!(json["backends"], serde_json::json!(["main", "billing"]));
    }

    #[tokio::test]
    async fn test_health() {
        let response = local_routes().handle(&get("/health"));
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn test_status_reports_breakers() {
        let local = local_routes();
        for _ in 0..3 {
            local.breakers.record_outcome("billing", false);
        }
        assert_eq!(local.breakers.state("billing"), Some(BreakerState::Open));

        let json = json_body(local.handle(&get("/status"))).await;
        let backends = json["backends"].as_array().unwrap();
        assert_eq!(backends.len(), 2);
        assert_eq!(backends[1]["name"], "billing");
        assert_eq!(backends[1]["breaker"]["state"], "open");
        assert_eq!(backends[0]["breaker"]["state"], "closed");
        assert!(backends[0]["last_probe"].is_null());
        assert_eq!(json["pool"]["total_requests"], 0);
    }

    #[test]
    fn test_unknown_route() {
        let response = local_routes().handle(&get("/nope/deeper"));
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response.headers().get("X-Gateway-Error").unwrap(),
            "UNKNOWN_ROUTE"
        );
    }

    #[test]
    fn test_post_to_local_route_is_unknown() {
        let req = Request::builder()
            .method(Method::POST)
            .uri("/health")
            .body(())
            .unwrap();
        assert_eq!(local_routes().handle(&req).status(), StatusCode::NOT_FOUND);
    }
}
