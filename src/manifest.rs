//! docker-compose manifest generation
//!
//! The manifest is derived from the route table: one service per route, with
//! a fixed restart policy and an in-container health probe. It is written
//! atomically so the orchestrator never reads a half-written file.

use crate::fleet::FleetError;
use crate::routes::RouteTable;
use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;
use std::io::Write;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Compose file format version written into every manifest
pub const COMPOSE_VERSION: &str = "3.8";

/// Restart policy applied by the orchestrator to a service's replicas
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartPolicy {
    pub condition: String,
    pub delay: Duration,
    pub max_attempts: u32,
    pub window: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            condition: "on-failure".to_string(),
            delay: Duration::from_secs(5),
            max_attempts: 3,
            window: Duration::from_secs(120),
        }
    }
}

/// Health probe the orchestrator runs inside each container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthProbe {
    pub test: Vec<String>,
    pub interval: Duration,
    pub timeout: Duration,
    pub retries: u32,
    pub start_period: Duration,
}

impl HealthProbe {
    /// `curl --fail` against the service's health path on its container port
    pub fn http(container_port: u16, path: &str) -> Self {
        Self {
            test: vec![
                "CMD-SHELL".to_string(),
                format!(
                    "curl --fail http://localhost:{}{} || exit 1",
                    container_port, path
                ),
            ],
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(10),
            retries: 3,
            start_period: Duration::from_secs(10),
        }
    }
}

/// One service in the fleet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSpec {
    pub name: String,
    pub build_context: String,
    pub host_port: u16,
    pub container_port: u16,
    pub replica_count: u32,
    pub restart_policy: RestartPolicy,
    pub health_probe: HealthProbe,
}

/// Declarative description of the whole fleet, in route order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FleetManifest {
    services: Vec<ServiceSpec>,
}

impl FleetManifest {
    /// Derive the manifest from the route table
    pub fn generate(routes: &RouteTable, scaling_factor: u32, container_port: u16) -> Self {
        let services = routes
            .iter()
            .map(|route| ServiceSpec {
                name: route.name.clone(),
                build_context: route.build_context.clone(),
                host_port: route.port,
                container_port,
                replica_count: route.replicas.saturating_mul(scaling_factor),
                restart_policy: RestartPolicy::default(),
                health_probe: HealthProbe::http(container_port, &route.health_path),
            })
            .collect();
        Self { services }
    }

    pub fn services(&self) -> &[ServiceSpec] {
        &self.services
    }

    pub fn service(&self, name: &str) -> Option<&ServiceSpec> {
        self.services.iter().find(|s| s.name == name)
    }

    pub fn service_mut(&mut self, name: &str) -> Option<&mut ServiceSpec> {
        self.services.iter_mut().find(|s| s.name == name)
    }

    /// Render the compose document
    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(&ComposeFile {
            version: COMPOSE_VERSION,
            services: ComposeServices(&self.services),
        })
    }

    /// Write the manifest to `path` via a temporary file in the same directory
    pub fn write_atomic(&self, path: &Path) -> Result<(), FleetError> {
        let yaml = self.to_yaml()?;
        write_file_atomic(path, yaml.as_bytes())?;
        debug!(path = %path.display(), services = self.services.len(), "Manifest written");
        Ok(())
    }
}

fn write_file_atomic(path: &Path, contents: &[u8]) -> Result<(), FleetError> {
    let io_err = |source| FleetError::ManifestWrite {
        path: path.to_path_buf(),
        source,
    };

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(io_err)?;
    tmp.write_all(contents).map_err(io_err)?;
    tmp.as_file().sync_all().map_err(io_err)?;
    tmp.persist(path).map_err(|e| io_err(e.error))?;
    Ok(())
}

/// Dockerfile used for build contexts that don't ship their own
///
/// `module` is the Python module exposing the WSGI/ASGI `app` object.
pub fn render_dockerfile(module: &str, container_port: u16) -> String {
    format!(
        r#"FROM python:3.10-slim

WORKDIR /app

COPY requirements.txt .
RUN pip install --no-cache-dir -r requirements.txt

COPY . .

EXPOSE {port}

CMD ["gunicorn", "--bind", "0.0.0.0:{port}", "{module}:app"]
"#,
        port = container_port,
        module = module
    )
}

// Compose wire format

fn seconds(d: Duration) -> String {
    format!("{}s", d.as_secs())
}

#[derive(Serialize)]
struct ComposeFile<'a> {
    version: &'static str,
    services: ComposeServices<'a>,
}

/// Serializes services as a map while keeping route order
struct ComposeServices<'a>(&'a [ServiceSpec]);

impl Serialize for ComposeServices<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for service in self.0 {
            map.serialize_entry(&service.name, &ComposeService::from(service))?;
        }
        map.end()
    }
}

#[derive(Serialize)]
struct ComposeService<'a> {
    build: &'a str,
    ports: Vec<String>,
    deploy: ComposeDeploy,
    healthcheck: ComposeHealthcheck<'a>,
}

#[derive(Serialize)]
struct ComposeDeploy {
    replicas: u32,
    restart_policy: ComposeRestartPolicy,
}

#[derive(Serialize)]
struct ComposeRestartPolicy {
    condition: String,
    delay: String,
    max_attempts: u32,
    window: String,
}

#[derive(Serialize)]
struct ComposeHealthcheck<'a> {
    test: &'a [String],
    interval: String,
    timeout: String,
    retries: u32,
    start_period: String,
}

impl<'a> From<&'a ServiceSpec> for ComposeService<'a> {
    fn from(service: &'a ServiceSpec) -> Self {
        let policy = &service.restart_policy;
        let probe = &service.health_probe;
        Self {
            build: &service.build_context,
            ports: vec![format!("{}:{}", service.host_port, service.container_port)],
            deploy: ComposeDeploy {
                replicas: service.replica_count,
                restart_policy: ComposeRestartPolicy {
                    condition: policy.condition.clone(),
                    delay: seconds(policy.delay),
                    max_attempts: policy.max_attempts,
                    window: seconds(policy.window),
                },
            },
            healthcheck: ComposeHealthcheck {
                test: &probe.test,
                interval: seconds(probe.interval),
                timeout: seconds(probe.timeout),
                retries: probe.retries,
                start_period: seconds(probe.start_period),
            },
        }
    }
}
