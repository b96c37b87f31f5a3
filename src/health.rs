//! Periodic backend health monitoring
//!
//! Every cycle probes each backend's health endpoint and asks the fleet
//! controller to restart the ones that fail. The monitor never touches the
//! circuit breakers; they recover through their own trial calls.

use crate::config::HealthConfig;
use crate::fleet::FleetController;
use crate::pool::ConnectionPool;
use crate::routes::{RouteEntry, RouteTable};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Outcome of the most recent probe of a backend
#[derive(Debug, Clone, Serialize)]
pub struct HealthRecord {
    pub backend: String,
    pub healthy: bool,
    /// HTTP status, when the backend answered
    pub status: Option<u16>,
    /// Connection error or timeout description
    pub error: Option<String>,
    pub checked_at: DateTime<Utc>,
}

/// Health monitor for the fleet
pub struct HealthMonitor {
    routes: Arc<RouteTable>,
    fleet: Arc<FleetController>,
    pool: Arc<ConnectionPool>,
    interval: Duration,
    timeout: Duration,
    records: DashMap<String, HealthRecord>,
}

impl HealthMonitor {
    pub fn new(
        routes: Arc<RouteTable>,
        fleet: Arc<FleetController>,
        pool: Arc<ConnectionPool>,
        config: &HealthConfig,
    ) -> Self {
        Self {
            routes,
            fleet,
            pool,
            interval: config.interval(),
            timeout: config.timeout(),
            records: DashMap::new(),
        }
    }

    /// Run probe cycles until shutdown is signalled
    pub async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            backends = self.routes.len(),
            "Health monitor started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    self.tick().await;
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Health monitor shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Probe every backend once and restart each one that failed
    ///
    /// Returns the records produced by this cycle, in route order.
    pub async fn tick(&self) -> Vec<HealthRecord> {
        let records = join_all(self.routes.iter().map(|route| self.probe(route))).await;

        let failing: Vec<&str> = records
            .iter()
            .filter(|r| !r.healthy)
            .map(|r| r.backend.as_str())
            .collect();

        join_all(failing.iter().map(|name| async move {
            warn!(backend = *name, "Backend failed health check, restarting");
            if let Err(e) = self.fleet.restart(name).await {
                error!(backend = *name, error = %e, "Restart after failed health check failed");
            }
        }))
        .await;

        for record in &records {
            self.records.insert(record.backend.clone(), record.clone());
        }

        debug!(
            checked = records.len(),
            failing = failing.len(),
            "Health check cycle complete"
        );
        records
    }

    async fn probe(&self, route: &RouteEntry) -> HealthRecord {
        let result =
            tokio::time::timeout(self.timeout, self.pool.check_backend(route.port, &route.health_path))
                .await;

        let (healthy, status, error) = match result {
            Ok(Ok(status)) => (status.is_success(), Some(status.as_u16()), None),
            Ok(Err(e)) => (false, None, Some(e.to_string())),
            Err(_) => (
                false,
                None,
                Some(format!("timed out after {}s", self.timeout.as_secs())),
            ),
        };

        if !healthy {
            debug!(
                backend = %route.name,
                port = route.port,
                path = %route.health_path,
                status,
                error = error.as_deref(),
                "Health probe failed"
            );
        }

        HealthRecord {
            backend: route.name.clone(),
            healthy,
            status,
            error,
            checked_at: Utc::now(),
        }
    }

    /// Result of the latest probe of `name`, if it has been probed
    pub fn last_record(&self, name: &str) -> Option<HealthRecord> {
        self.records.get(name).map(|r| r.value().clone())
    }
}
