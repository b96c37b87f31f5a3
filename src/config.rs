use crate::routes::{is_valid_route_name, MAIN_ROUTE};
use anyhow::Context;
use serde::Deserialize;
use std::collections::HashSet;
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Global configuration for the gateway
///
/// Built once at startup, either from a TOML file ([`Config::load`]) or from
/// the process environment ([`Config::from_env`]), and passed by reference to
/// every component afterwards.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Listener, metrics and request handling settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Manifest and orchestrator settings
    #[serde(default)]
    pub fleet: FleetConfig,

    /// Health monitor settings
    #[serde(default)]
    pub health: HealthConfig,

    /// Default circuit breaker settings, overridable per route
    #[serde(default)]
    pub breaker: BreakerConfig,

    /// Operator alert settings
    #[serde(default)]
    pub alert: AlertConfig,

    /// Backend routes, keyed by the first path segment
    #[serde(default = "default_routes")]
    pub routes: Vec<RouteConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Gateway HTTP port (default: 8080)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Port for the Prometheus exporter (default: 9090)
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    /// Install the Prometheus exporter at startup (default: true)
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,

    /// Upper bound on a single proxied request (default: 30)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// How long in-flight connections may drain on shutdown (default: 10)
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,

    /// Maximum idle connections per backend (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FleetConfig {
    /// Path of the generated docker-compose manifest
    #[serde(default = "default_manifest_path")]
    pub manifest_path: PathBuf,

    /// Orchestrator binary invoked for every fleet operation
    #[serde(default = "default_compose_command")]
    pub compose_command: String,

    /// Multiplier applied to every route's replica count
    #[serde(default = "default_scaling_factor")]
    pub scaling_factor: u32,

    /// Port the sub-services listen on inside their containers
    #[serde(default = "default_container_port")]
    pub container_port: u16,

    /// Write a Dockerfile into build contexts that lack one
    #[serde(default = "default_true")]
    pub generate_dockerfiles: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HealthConfig {
    /// Seconds between probe cycles (default: 60)
    #[serde(default = "default_health_interval")]
    pub interval_secs: u64,

    /// Upper bound on a single probe (default: 5)
    #[serde(default = "default_health_timeout")]
    pub timeout_secs: u64,

    /// Probe path used when a route doesn't override it
    #[serde(default = "default_health_path")]
    pub path: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures that trip a breaker (default: 3)
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Seconds an open breaker waits before allowing a trial call (default: 60)
    #[serde(default = "default_recovery_timeout")]
    pub recovery_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AlertConfig {
    /// Send alerts by email; when false alerts are only logged
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Operator mailbox receiving breaker alerts
    #[serde(default = "default_alert_recipient")]
    pub recipient: String,

    #[serde(default = "default_smtp_server")]
    pub smtp_server: String,

    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,

    /// Also used as the sender address
    #[serde(default = "default_smtp_username")]
    pub smtp_username: String,

    #[serde(default = "default_smtp_password")]
    pub smtp_password: String,
}

/// A single backend route
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct RouteConfig {
    /// Backend name, also the first path segment routed to it
    pub name: String,

    /// Host port the backend listens on
    pub port: u16,

    /// Build context relative to the manifest (default: "." for main,
    /// "./subapps/<name>" otherwise)
    pub build_context: Option<String>,

    /// Replicas before the fleet scaling factor is applied (default: 1)
    #[serde(default = "default_replicas")]
    pub replicas: u32,

    /// Probe path override
    pub health_path: Option<String>,

    /// Breaker threshold override
    pub failure_threshold: Option<u32>,

    /// Breaker recovery timeout override
    pub recovery_timeout_secs: Option<u64>,
}

impl RouteConfig {
    pub fn new(name: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            port,
            build_context: None,
            replicas: default_replicas(),
            health_path: None,
            failure_threshold: None,
            recovery_timeout_secs: None,
        }
    }

    pub fn build_context(&self) -> String {
        match &self.build_context {
            Some(context) => context.clone(),
            None if self.name == MAIN_ROUTE => ".".to_string(),
            None => format!("./subapps/{}", self.name),
        }
    }

    pub fn health_path<'a>(&'a self, health: &'a HealthConfig) -> &'a str {
        self.health_path.as_deref().unwrap_or(&health.path)
    }

    pub fn failure_threshold(&self, defaults: &BreakerConfig) -> u32 {
        self.failure_threshold.unwrap_or(defaults.failure_threshold)
    }

    pub fn recovery_timeout(&self, defaults: &BreakerConfig) -> Duration {
        Duration::from_secs(
            self.recovery_timeout_secs
                .unwrap_or(defaults.recovery_timeout_secs),
        )
    }

    fn validate(&self, health: &HealthConfig) -> Result<(), String> {
        if !is_valid_route_name(&self.name) {
            return Err(format!(
                "Route '{}': name must be a single path segment of [A-Za-z0-9._-]",
                self.name
            ));
        }

        if self.port == 0 {
            return Err(format!(
                "Route '{}': 'port' must be greater than 0",
                self.name
            ));
        }

        if !self.health_path(health).starts_with('/') {
            return Err(format!(
                "Route '{}': health path must start with '/'",
                self.name
            ));
        }

        if self.failure_threshold == Some(0) {
            return Err(format!(
                "Route '{}': 'failure_threshold' must be at least 1",
                self.name
            ));
        }

        Ok(())
    }
}

// Default value functions
fn default_listen_port() -> u16 {
    8080
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_true() -> bool {
    true
}

fn default_request_timeout() -> u64 {
    30 // 30 seconds
}

fn default_drain_timeout() -> u64 {
    10
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90 // 90 seconds
}

fn default_manifest_path() -> PathBuf {
    PathBuf::from("docker-compose.yml")
}

fn default_compose_command() -> String {
    "docker-compose".to_string()
}

fn default_scaling_factor() -> u32 {
    1
}

fn default_container_port() -> u16 {
    8000
}

fn default_health_interval() -> u64 {
    60 // 1 minute
}

fn default_health_timeout() -> u64 {
    5
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_recovery_timeout() -> u64 {
    60 // 1 minute
}

fn default_alert_recipient() -> String {
    "admin@example.com".to_string()
}

fn default_smtp_server() -> String {
    "smtp.example.com".to_string()
}

fn default_smtp_port() -> u16 {
    587 // submission with STARTTLS
}

fn default_smtp_username() -> String {
    "username".to_string()
}

fn default_smtp_password() -> String {
    "password".to_string()
}

fn default_replicas() -> u32 {
    1
}

fn default_routes() -> Vec<RouteConfig> {
    vec![
        RouteConfig::new(MAIN_ROUTE, 8000),
        RouteConfig::new("subapp1", 8001),
        // subapp2 only serves /healthy
        RouteConfig {
            health_path: Some("/healthy".to_string()),
            ..RouteConfig::new("subapp2", 8002)
        },
    ]
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_listen_port(),
            metrics_port: default_metrics_port(),
            metrics_enabled: true,
            request_timeout_secs: default_request_timeout(),
            drain_timeout_secs: default_drain_timeout(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            manifest_path: default_manifest_path(),
            compose_command: default_compose_command(),
            scaling_factor: default_scaling_factor(),
            container_port: default_container_port(),
            generate_dockerfiles: true,
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_health_interval(),
            timeout_secs: default_health_timeout(),
            path: default_health_path(),
        }
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_secs: default_recovery_timeout(),
        }
    }
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            recipient: default_alert_recipient(),
            smtp_server: default_smtp_server(),
            smtp_port: default_smtp_port(),
            smtp_username: default_smtp_username(),
            smtp_password: default_smtp_password(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            fleet: FleetConfig::default(),
            health: HealthConfig::default(),
            breaker: BreakerConfig::default(),
            alert: AlertConfig::default(),
            routes: default_routes(),
        }
    }
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Prefix of the per-route environment variables
///
/// The main application keeps its historical `MAIN_APP` prefix; every other
/// route uses its upper-cased name with dashes and dots mapped to underscores.
fn route_variable_prefix(name: &str) -> String {
    if name == MAIN_ROUTE {
        return "MAIN_APP".to_string();
    }
    name.chars()
        .map(|c| match c {
            '-' | '.' => '_',
            c => c.to_ascii_uppercase(),
        })
        .collect()
}

/// Environment variable holding the port of the route named `name`
pub fn port_variable(name: &str) -> String {
    format!("{}_PORT", route_variable_prefix(name))
}

/// Environment variable overriding the probe path of the route named `name`
pub fn health_path_variable(name: &str) -> String {
    format!("{}_HEALTH_PATH", route_variable_prefix(name))
}

fn parse_var<T, F>(lookup: &F, key: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => {
            let value = raw
                .trim()
                .parse::<T>()
                .map_err(|e| anyhow::anyhow!("Invalid value for {}: '{}' ({})", key, raw, e))?;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

fn parse_bool<F>(lookup: &F, key: &str) -> anyhow::Result<Option<bool>>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => anyhow::bail!("Invalid value for {}: '{}' (expected a boolean)", key, raw),
        },
        None => Ok(None),
    }
}

/// Parse `GATEWAY_ROUTES`: comma separated `name=port` or bare `name`
/// entries, where a bare name takes its port from [`port_variable`].
fn parse_route_list<F>(lookup: &F, raw: &str) -> anyhow::Result<Vec<RouteConfig>>
where
    F: Fn(&str) -> Option<String>,
{
    let mut routes = Vec::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let route = match entry.split_once('=') {
            Some((name, port)) => {
                let port = port
                    .trim()
                    .parse::<u16>()
                    .with_context(|| format!("Invalid port in GATEWAY_ROUTES entry '{}'", entry))?;
                RouteConfig::new(name.trim(), port)
            }
            None => {
                let key = port_variable(entry);
                let port = parse_var::<u16, _>(lookup, &key)?.ok_or_else(|| {
                    anyhow::anyhow!("Route '{}' has no port: set {} or use name=port", entry, key)
                })?;
                RouteConfig::new(entry, port)
            }
        };
        routes.push(route);
    }
    Ok(routes)
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Build the configuration from the process environment
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary variable source
    ///
    /// Unset variables keep their defaults; set but unparsable variables are
    /// an error naming the variable.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();

        if let Some(bind) = lookup("GATEWAY_BIND") {
            config.server.bind = bind;
        }
        if let Some(port) = parse_var(&lookup, "GATEWAY_PORT")? {
            config.server.port = port;
        }
        if let Some(port) = parse_var(&lookup, "METRICS_PORT")? {
            config.server.metrics_port = port;
        }
        if let Some(enabled) = parse_bool(&lookup, "METRICS_ENABLED")? {
            config.server.metrics_enabled = enabled;
        }
        if let Some(secs) = parse_var(&lookup, "REQUEST_TIMEOUT")? {
            config.server.request_timeout_secs = secs;
        }
        if let Some(secs) = parse_var(&lookup, "DRAIN_TIMEOUT")? {
            config.server.drain_timeout_secs = secs;
        }

        if let Some(path) = lookup("DOCKER_COMPOSE_FILE") {
            config.fleet.manifest_path = PathBuf::from(path);
        }
        if let Some(command) = lookup("COMPOSE_COMMAND") {
            config.fleet.compose_command = command;
        }
        if let Some(factor) = parse_var(&lookup, "SCALING_FACTOR")? {
            config.fleet.scaling_factor = factor;
        }
        if let Some(port) = parse_var(&lookup, "CONTAINER_PORT")? {
            config.fleet.container_port = port;
        }
        if let Some(generate) = parse_bool(&lookup, "GENERATE_DOCKERFILES")? {
            config.fleet.generate_dockerfiles = generate;
        }

        if let Some(secs) = parse_var(&lookup, "HEALTH_CHECK_INTERVAL")? {
            config.health.interval_secs = secs;
        }
        if let Some(secs) = parse_var(&lookup, "HEALTH_CHECK_TIMEOUT")? {
            config.health.timeout_secs = secs;
        }
        if let Some(path) = lookup("HEALTH_CHECK_PATH") {
            config.health.path = path;
        }

        if let Some(threshold) = parse_var(&lookup, "FAILURE_THRESHOLD")? {
            config.breaker.failure_threshold = threshold;
        }
        if let Some(secs) = parse_var(&lookup, "RECOVERY_TIMEOUT")? {
            config.breaker.recovery_timeout_secs = secs;
        }

        if let Some(enabled) = parse_bool(&lookup, "ALERTS_ENABLED")? {
            config.alert.enabled = enabled;
        }
        if let Some(recipient) = lookup("ALERT_EMAIL") {
            config.alert.recipient = recipient;
        }
        if let Some(server) = lookup("SMTP_SERVER") {
            config.alert.smtp_server = server;
        }
        if let Some(port) = parse_var(&lookup, "SMTP_PORT")? {
            config.alert.smtp_port = port;
        }
        if let Some(username) = lookup("SMTP_USERNAME") {
            config.alert.smtp_username = username;
        }
        if let Some(password) = lookup("SMTP_PASSWORD") {
            config.alert.smtp_password = password;
        }

        config.routes = match lookup("GATEWAY_ROUTES") {
            Some(raw) => parse_route_list(&lookup, &raw)?,
            None => {
                let mut routes = default_routes();
                for route in &mut routes {
                    if let Some(port) = parse_var(&lookup, &port_variable(&route.name))? {
                        route.port = port;
                    }
                }
                routes
            }
        };
        for route in &mut config.routes {
            if let Some(path) = lookup(&health_path_variable(&route.name)) {
                route.health_path = Some(path);
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.routes.is_empty() {
            errors.push("At least one route must be configured".to_string());
        }

        let mut seen = HashSet::new();
        for route in &self.routes {
            if let Err(e) = route.validate(&self.health) {
                errors.push(e);
            }
            if !seen.insert(route.name.as_str()) {
                errors.push(format!("Route '{}' is configured more than once", route.name));
            }
        }

        if self.fleet.scaling_factor == 0 {
            errors.push("'scaling_factor' must be at least 1".to_string());
        }
        if self.breaker.failure_threshold == 0 {
            errors.push("'failure_threshold' must be at least 1".to_string());
        }
        if self.health.interval_secs == 0 {
            errors.push("'health.interval_secs' must be greater than 0".to_string());
        }
        if self.health.timeout_secs == 0 {
            errors.push("'health.timeout_secs' must be greater than 0".to_string());
        }
        if self.server.request_timeout_secs == 0 {
            errors.push("'request_timeout_secs' must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
