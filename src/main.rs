use fleetgate::config::Config;
use fleetgate::fallback::{PKG_NAME, VERSION};
use fleetgate::fleet::ComposeCli;
use fleetgate::lifecycle::{shutdown_signal, Gateway};
use fleetgate::notifier;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    // A config file path may be given as the first argument; otherwise the
    // environment is used
    let config = match std::env::args().nth(1).map(PathBuf::from) {
        Some(path) => {
            let config = Config::load(&path).map_err(|e| {
                error!(path = %path.display(), error = %e, "Failed to load configuration");
                e
            })?;
            info!(path = %path.display(), "Configuration loaded");
            config
        }
        None => {
            let config = Config::from_env().map_err(|e| {
                error!(error = %e, "Invalid configuration in environment");
                e
            })?;
            info!("Configuration loaded from environment");
            config
        }
    };

    print_startup_banner(&config);

    let notifier = notifier::from_config(&config.alert)?;
    let orchestrator = Arc::new(ComposeCli::new(config.fleet.compose_command.clone()));

    let gateway = Gateway::new(config, orchestrator, notifier);
    gateway.run(shutdown_signal()).await
}

/// `LOG_FORMAT=json` switches to one JSON object per line
fn init_logging() {
    let filter = EnvFilter::from_default_env()
        .add_directive("fleetgate=info".parse().expect("valid log directive"));

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn print_startup_banner(config: &Config) {
    info!("========================================");
    info!("  {} v{}", PKG_NAME, VERSION);
    info!("========================================");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        metrics_port = config.server.metrics_port,
        "Gateway settings"
    );
    info!(
        manifest = %config.fleet.manifest_path.display(),
        scaling_factor = config.fleet.scaling_factor,
        compose = %config.fleet.compose_command,
        "Fleet settings"
    );
    info!(
        interval_secs = config.health.interval_secs,
        failure_threshold = config.breaker.failure_threshold,
        recovery_timeout_secs = config.breaker.recovery_timeout_secs,
        alerts_enabled = config.alert.enabled,
        "Supervision settings"
    );
    for route in &config.routes {
        info!(backend = %route.name, port = route.port, "Route: /{}", route.name);
    }
}
