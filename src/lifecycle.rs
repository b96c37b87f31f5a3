//! Startup and shutdown orchestration
//!
//! Brings the fleet up (manifest, build, start), then runs the health monitor
//! and the HTTP server side by side until the shutdown future resolves. Once
//! the fleet has been started it is torn down on every exit path.

use crate::breaker::BreakerRegistry;
use crate::config::Config;
use crate::fallback::LocalRoutes;
use crate::fleet::{FleetController, FleetError, Orchestrator};
use crate::health::HealthMonitor;
use crate::manifest::FleetManifest;
use crate::metrics;
use crate::notifier::AlertNotifier;
use crate::pool::{ConnectionPool, PoolConfig};
use crate::proxy::{Dispatcher, ProxyServer};
use crate::routes::RouteTable;
use anyhow::Context;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// How long the health monitor may take to notice shutdown
const MONITOR_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Fully wired gateway
pub struct Gateway {
    config: Config,
    routes: Arc<RouteTable>,
    breakers: Arc<BreakerRegistry>,
    fleet: Arc<FleetController>,
    monitor: Arc<HealthMonitor>,
    dispatcher: Arc<Dispatcher>,
}

impl Gateway {
    pub fn new(
        config: Config,
        orchestrator: Arc<dyn Orchestrator>,
        notifier: Arc<dyn AlertNotifier>,
    ) -> Self {
        let routes = Arc::new(RouteTable::from_config(&config));

        let manifest = FleetManifest::generate(
            &routes,
            config.fleet.scaling_factor,
            config.fleet.container_port,
        );
        let mut fleet = FleetController::new(manifest, &config.fleet.manifest_path, orchestrator);
        if config.fleet.generate_dockerfiles {
            fleet = fleet.with_dockerfiles(config.fleet.container_port);
        }
        let fleet = Arc::new(fleet);

        let breakers = Arc::new(BreakerRegistry::from_routes(&routes, notifier));

        let pool = Arc::new(ConnectionPool::new(PoolConfig {
            max_idle_per_host: config.server.pool_max_idle_per_host,
            idle_timeout: Duration::from_secs(config.server.pool_idle_timeout_secs),
        }));

        let monitor = Arc::new(HealthMonitor::new(
            Arc::clone(&routes),
            Arc::clone(&fleet),
            Arc::clone(&pool),
            &config.health,
        ));

        let fallback = LocalRoutes::new(Arc::clone(&routes), Arc::clone(&breakers))
            .with_monitor(Arc::clone(&monitor))
            .with_pool_stats(pool.stats());

        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&routes),
            Arc::clone(&breakers),
            pool,
            fallback,
            config.server.request_timeout(),
        ));

        Self {
            config,
            routes,
            breakers,
            fleet,
            monitor,
            dispatcher,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn routes(&self) -> &Arc<RouteTable> {
        &self.routes
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    pub fn fleet(&self) -> &Arc<FleetController> {
        &self.fleet
    }

    pub fn monitor(&self) -> &Arc<HealthMonitor> {
        &self.monitor
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Write the manifest, build every image and start the fleet
    pub async fn bring_up(&self) -> Result<(), FleetError> {
        self.fleet.write_manifest()?;
        self.fleet.build_all().await?;
        self.fleet.start_fleet().await
    }

    /// Bring the fleet up, serve until `shutdown` resolves, then tear down
    pub async fn run<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()>,
    {
        self.bring_up()
            .await
            .context("Failed to bring up the fleet")?;

        let bind_addr = socket_addr(&self.config.server.bind, self.config.server.port)?;
        let result = match TcpListener::bind(bind_addr).await {
            Ok(listener) => self.serve(listener, shutdown).await,
            Err(e) => Err(anyhow::anyhow!("Failed to bind {}: {}", bind_addr, e)),
        };

        if let Err(e) = &result {
            error!(error = %e, "Gateway stopped with an error");
        }

        self.fleet.stop_fleet().await;
        info!("Shutdown complete");
        result
    }

    /// Serve on an already bound listener until `shutdown` resolves
    ///
    /// Starts the health monitor and the metrics exporter alongside the
    /// server. Does not touch the fleet, so tests can drive it against
    /// backends they started themselves.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()>,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut monitor_handle = tokio::spawn(Arc::clone(&self.monitor).run(shutdown_rx.clone()));

        if self.config.server.metrics_enabled {
            match socket_addr(&self.config.server.bind, self.config.server.metrics_port) {
                Ok(addr) => {
                    if let Err(e) = metrics::init(addr) {
                        warn!(error = %e, "Metrics endpoint disabled");
                    }
                }
                Err(e) => warn!(error = %e, "Metrics endpoint disabled"),
            }
        }

        let local_addr = listener.local_addr()?;
        let server = ProxyServer::new(local_addr, Arc::clone(&self.dispatcher), shutdown_rx)
            .with_drain_timeout(self.config.server.drain_timeout());
        let mut server_handle = tokio::spawn(server.serve(listener));

        tokio::pin!(shutdown);
        let server_result = tokio::select! {
            _ = &mut shutdown => {
                info!("Shutdown requested");
                let _ = shutdown_tx.send(true);
                (&mut server_handle).await
            }
            result = &mut server_handle => {
                let _ = shutdown_tx.send(true);
                result
            }
        };

        if tokio::time::timeout(MONITOR_STOP_TIMEOUT, &mut monitor_handle)
            .await
            .is_err()
        {
            warn!("Health monitor did not stop in time, aborting it");
            monitor_handle.abort();
        }

        server_result.context("Gateway server task failed")?
    }
}

fn socket_addr(bind: &str, port: u16) -> anyhow::Result<SocketAddr> {
    let ip: IpAddr = bind
        .parse()
        .with_context(|| format!("Invalid bind address '{}'", bind))?;
    Ok(SocketAddr::new(ip, port))
}

/// Resolves on SIGINT (Ctrl+C) or SIGTERM
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        info!("Received SIGINT (Ctrl+C), shutting down...");
                    }
                    _ = sigterm.recv() => {
                        info!("Received SIGTERM, shutting down...");
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler, waiting for Ctrl+C only");
                let _ = tokio::signal::ctrl_c().await;
                info!("Received Ctrl+C, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C, shutting down...");
    }
}
