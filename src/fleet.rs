//! Fleet lifecycle control
//!
//! Every operation is a single invocation of the orchestrator binary
//! (docker-compose) against the generated manifest. Operations on the same
//! service are serialized; fleet-wide operations exclude all per-service ones.

use crate::manifest::{render_dockerfile, FleetManifest};
use crate::routes::MAIN_ROUTE;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::{Mutex as AsyncMutex, RwLock};
use tracing::{debug, error, info, warn};

/// Lines of orchestrator stderr kept in error messages
const STDERR_TAIL_LINES: usize = 20;

#[derive(Debug, Error)]
pub enum FleetError {
    #[error("failed to write manifest {}: {source}", .path.display())]
    ManifestWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode manifest: {0}")]
    ManifestEncode(#[from] serde_yaml::Error),

    #[error("failed to run `{command}`: {source}")]
    Launch {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` exited with {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("failed to write Dockerfile for {service}: {source}")]
    Dockerfile {
        service: String,
        #[source]
        source: std::io::Error,
    },

    #[error("build failed for service {service}: {source}")]
    Build {
        service: String,
        #[source]
        source: Box<FleetError>,
    },

    #[error("unknown service: {0}")]
    UnknownService(String),
}

/// Runs orchestrator commands
///
/// `args` are everything after the binary name, e.g.
/// `["-f", "docker-compose.yml", "restart", "billing"]`.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    async fn invoke(&self, args: &[String]) -> Result<(), FleetError>;
}

/// Orchestrator backed by the docker-compose CLI
#[derive(Debug, Clone)]
pub struct ComposeCli {
    program: String,
}

impl ComposeCli {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn describe(&self, args: &[String]) -> String {
        let mut command = self.program.clone();
        for arg in args {
            command.push(' ');
            command.push_str(arg);
        }
        command
    }
}

#[async_trait]
impl Orchestrator for ComposeCli {
    async fn invoke(&self, args: &[String]) -> Result<(), FleetError> {
        let command = self.describe(args);
        debug!(command = %command, "Running orchestrator command");

        let output = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|source| FleetError::Launch {
                command: command.clone(),
                source,
            })?;

        for line in String::from_utf8_lossy(&output.stdout).lines() {
            debug!(target: "compose", "{}", line);
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let lines: Vec<&str> = stderr.lines().collect();
            let tail = lines[lines.len().saturating_sub(STDERR_TAIL_LINES)..].join("\n");
            return Err(FleetError::CommandFailed {
                command,
                status: output.status.to_string(),
                stderr: tail,
            });
        }

        Ok(())
    }
}

/// Controls the fleet described by a manifest
///
/// # Example
///
/// ```ignore
/// let fleet = FleetController::new(manifest, "docker-compose.yml", Arc::new(ComposeCli::new("docker-compose")));
/// fleet.write_manifest()?;
/// fleet.build_all().await?;
/// fleet.start_fleet().await?;
/// ```
pub struct FleetController {
    orchestrator: Arc<dyn Orchestrator>,
    manifest_path: PathBuf,
    manifest: Mutex<FleetManifest>,
    service_locks: HashMap<String, Arc<AsyncMutex<()>>>,
    /// Held exclusively by fleet-wide operations, shared by per-service ones
    fleet_gate: RwLock<()>,
    /// Container port for generated Dockerfiles; `None` disables generation
    dockerfile_port: Option<u16>,
}

impl FleetController {
    pub fn new(
        manifest: FleetManifest,
        manifest_path: impl Into<PathBuf>,
        orchestrator: Arc<dyn Orchestrator>,
    ) -> Self {
        let service_locks = manifest
            .services()
            .iter()
            .map(|s| (s.name.clone(), Arc::new(AsyncMutex::new(()))))
            .collect();

        Self {
            orchestrator,
            manifest_path: manifest_path.into(),
            manifest: Mutex::new(manifest),
            service_locks,
            fleet_gate: RwLock::new(()),
            dockerfile_port: None,
        }
    }

    /// Write a Dockerfile into build contexts that lack one before building
    pub fn with_dockerfiles(mut self, container_port: u16) -> Self {
        self.dockerfile_port = Some(container_port);
        self
    }

    pub fn manifest(&self) -> FleetManifest {
        self.manifest.lock().clone()
    }

    pub fn manifest_path(&self) -> &Path {
        &self.manifest_path
    }

    /// Persist the current manifest
    pub fn write_manifest(&self) -> Result<(), FleetError> {
        // Held across the write so a concurrent scale can't be overwritten
        let manifest = self.manifest.lock();
        manifest.write_atomic(&self.manifest_path)?;
        info!(
            path = %self.manifest_path.display(),
            services = manifest.services().len(),
            "Manifest generated"
        );
        Ok(())
    }

    /// Build every service image in manifest order, stopping at the first failure
    pub async fn build_all(&self) -> Result<(), FleetError> {
        let services: Vec<_> = self.manifest().services().to_vec();

        for service in services {
            let lock = self.service_lock(&service.name)?;
            let _fleet = self.fleet_gate.read().await;
            let _guard = lock.lock().await;

            let result = async {
                if let Some(port) = self.dockerfile_port {
                    self.ensure_dockerfile(&service.name, &service.build_context, port)
                        .await?;
                }
                info!(service = %service.name, "Building service image");
                self.orchestrator
                    .invoke(&self.args(&["build", service.name.as_str()]))
                    .await
            }
            .await;

            if let Err(e) = result {
                error!(service = %service.name, error = %e, "Build failed");
                return Err(FleetError::Build {
                    service: service.name,
                    source: Box::new(e),
                });
            }
        }

        Ok(())
    }

    /// Start every service detached
    pub async fn start_fleet(&self) -> Result<(), FleetError> {
        let _fleet = self.fleet_gate.write().await;
        info!(path = %self.manifest_path.display(), "Starting fleet");

        self.orchestrator
            .invoke(&self.args(&["up", "-d"]))
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to start fleet");
                e
            })
    }

    /// Tear down the fleet; failures are logged and otherwise ignored
    pub async fn stop_fleet(&self) {
        let _fleet = self.fleet_gate.write().await;
        info!("Stopping fleet");

        if let Err(e) = self.orchestrator.invoke(&self.args(&["down"])).await {
            warn!(error = %e, "Failed to stop fleet");
        }
    }

    /// Restart all replicas of one service
    pub async fn restart(&self, name: &str) -> Result<(), FleetError> {
        let lock = self.service_lock(name)?;
        let _fleet = self.fleet_gate.read().await;
        let _guard = lock.lock().await;

        info!(service = name, "Restarting service");
        self.orchestrator
            .invoke(&self.args(&["restart", name]))
            .await
            .map_err(|e| {
                error!(service = name, error = %e, "Failed to restart service");
                e
            })
    }

    /// Set the replica count of one service
    ///
    /// The updated manifest is persisted before the orchestrator runs, and
    /// only replaces the in-memory one once the write succeeded. The manifest
    /// lock is held across the write so concurrent scales of different
    /// services land on disk in the order they were applied.
    pub async fn scale(&self, name: &str, replicas: u32) -> Result<(), FleetError> {
        let lock = self.service_lock(name)?;
        let _fleet = self.fleet_gate.read().await;
        let _guard = lock.lock().await;

        {
            let mut manifest = self.manifest.lock();
            let mut updated = manifest.clone();
            if let Some(service) = updated.service_mut(name) {
                service.replica_count = replicas;
            }
            updated.write_atomic(&self.manifest_path)?;
            *manifest = updated;
        }

        info!(service = name, replicas, "Scaling service");
        let scale = format!("{}={}", name, replicas);
        self.orchestrator
            .invoke(&self.args(&["up", "-d", "--scale", scale.as_str()]))
            .await
            .map_err(|e| {
                error!(service = name, replicas, error = %e, "Failed to scale service");
                e
            })
    }

    fn service_lock(&self, name: &str) -> Result<Arc<AsyncMutex<()>>, FleetError> {
        self.service_locks
            .get(name)
            .cloned()
            .ok_or_else(|| FleetError::UnknownService(name.to_string()))
    }

    fn args(&self, rest: &[&str]) -> Vec<String> {
        let mut args = vec![
            "-f".to_string(),
            self.manifest_path.to_string_lossy().into_owned(),
        ];
        args.extend(rest.iter().map(|s| s.to_string()));
        args
    }

    fn manifest_dir(&self) -> &Path {
        match self.manifest_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        }
    }

    async fn ensure_dockerfile(
        &self,
        service: &str,
        build_context: &str,
        container_port: u16,
    ) -> Result<(), FleetError> {
        let context = self.manifest_dir().join(build_context);
        let dockerfile = context.join("Dockerfile");
        let io_err = |source| FleetError::Dockerfile {
            service: service.to_string(),
            source,
        };

        if !tokio::fs::try_exists(&context).await.map_err(io_err)? {
            warn!(service, context = %context.display(), "Build context missing, skipping Dockerfile");
            return Ok(());
        }
        if tokio::fs::try_exists(&dockerfile).await.map_err(io_err)? {
            return Ok(());
        }

        let module = if service == MAIN_ROUTE { "main" } else { "app" };
        tokio::fs::write(&dockerfile, render_dockerfile(module, container_port))
            .await
            .map_err(io_err)?;
        debug!(service, path = %dockerfile.display(), "Dockerfile generated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::{RouteEntry, RouteTable};

    /// Records invocations and fails those containing `fail_on`
    #[derive(Default)]
    struct FakeOrchestrator {
        calls: Mutex<Vec<Vec<String>>>,
        fail_on: Option<String>,
    }

    impl FakeOrchestrator {
        fn failing_on(arg: &str) -> Self {
            Self {
                fail_on: Some(arg.to_string()),
                ..Self::default()
            }
        }

        fn calls(&self) -> Vec<Vec<String>> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl Orchestrator for FakeOrchestrator {
        async fn invoke(&self, args: &[String]) -> Result<(), FleetError> {
            self.calls.lock().push(args.to_vec());
            match &self.fail_on {
                Some(arg) if args.contains(arg) => Err(FleetError::CommandFailed {
                    command: args.join(" "),
                    status: "exit status: 1".to_string(),
                    stderr: "boom".to_string(),
                }),
                _ => Ok(()),
            }
        }
    }

    fn controller(dir: &Path, orchestrator: Arc<FakeOrchestrator>) -> FleetController {
        let routes = RouteTable::new(vec![
            RouteEntry::new("main", 8000),
            RouteEntry::new("billing", 8001),
            RouteEntry::new("search", 8002),
        ]);
        FleetController::new(
            FleetManifest::generate(&routes, 1, 8000),
            dir.join("docker-compose.yml"),
            orchestrator,
        )
    }

    fn args(dir: &Path, rest: &[&str]) -> Vec<String> {
        let mut v = vec![
            "-f".to_string(),
            dir.join("docker-compose.yml").to_string_lossy().into_owned(),
        ];
        v.extend(rest.iter().map(|s| s.to_string()));
        v
    }

    #[tokio::test]
    async fn test_build_all_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeOrchestrator::default());
        let fleet = controller(dir.path(), fake.clone());

        fleet.build_all().await.unwrap();

        assert_eq!(
            fake.calls(),
            vec![
                args(dir.path(), &["build", "main"]),
                args(dir.path(), &["build", "billing"]),
                args(dir.path(), &["build", "search"]),
            ]
        );
    }

    #[tokio::test]
    async fn test_build_all_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeOrchestrator::failing_on("billing"));
        let fleet = controller(dir.path(), fake.clone());

        let err = fleet.build_all().await.unwrap_err();
        match err {
            FleetError::Build { service, .. } => assert_eq!(service, "billing"),
            other => panic!("unexpected error: {other}"),
        }
        // search was never attempted
        assert_eq!(fake.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_start_stop_commands() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeOrchestrator::default());
        let fleet = controller(dir.path(), fake.clone());

        fleet.start_fleet().await.unwrap();
        fleet.stop_fleet().await;

        assert_eq!(
            fake.calls(),
            vec![args(dir.path(), &["up", "-d"]), args(dir.path(), &["down"])]
        );
    }

    #[tokio::test]
    async fn test_stop_fleet_swallows_errors() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeOrchestrator::failing_on("down"));
        let fleet = controller(dir.path(), fake.clone());

        fleet.stop_fleet().await;
        assert_eq!(fake.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_restart_surfaces_errors() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeOrchestrator::failing_on("restart"));
        let fleet = controller(dir.path(), fake.clone());

        assert!(matches!(
            fleet.restart("billing").await,
            Err(FleetError::CommandFailed { .. })
        ));
        assert_eq!(fake.calls(), vec![args(dir.path(), &["restart", "billing"])]);
    }

    #[tokio::test]
    async fn test_unknown_service() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeOrchestrator::default());
        let fleet = controller(dir.path(), fake.clone());

        assert!(matches!(
            fleet.restart("nope").await,
            Err(FleetError::UnknownService(_))
        ));
        assert!(matches!(
            fleet.scale("nope", 2).await,
            Err(FleetError::UnknownService(_))
        ));
        assert!(fake.calls().is_empty());
    }

    #[tokio::test]
    async fn test_scale_updates_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeOrchestrator::default());
        let fleet = controller(dir.path(), fake.clone());
        fleet.write_manifest().unwrap();

        fleet.scale("billing", 4).await.unwrap();

        assert_eq!(fleet.manifest().service("billing").unwrap().replica_count, 4);
        let written = std::fs::read_to_string(fleet.manifest_path()).unwrap();
        let doc: serde_yaml::Value = serde_yaml::from_str(&written).unwrap();
        assert_eq!(doc["services"]["billing"]["deploy"]["replicas"].as_u64(), Some(4));
        assert_eq!(
            fake.calls(),
            vec![args(dir.path(), &["up", "-d", "--scale", "billing=4"])]
        );
    }

    #[tokio::test]
    async fn test_scale_to_zero() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeOrchestrator::default());
        let fleet = controller(dir.path(), fake.clone());

        fleet.scale("search", 0).await.unwrap();
        assert_eq!(fleet.manifest().service("search").unwrap().replica_count, 0);
    }

    fn replicas_on_disk(fleet: &FleetController, name: &str) -> Option<u64> {
        let written = std::fs::read_to_string(fleet.manifest_path()).unwrap();
        let doc: serde_yaml::Value = serde_yaml::from_str(&written).unwrap();
        doc["services"][name]["deploy"]["replicas"].as_u64()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_scales_keep_file_in_sync() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeOrchestrator::default());
        let fleet = Arc::new(controller(dir.path(), fake));
        fleet.write_manifest().unwrap();

        for i in 0..100u32 {
            let billing = {
                let fleet = Arc::clone(&fleet);
                tokio::spawn(async move { fleet.scale("billing", 5 + i).await })
            };
            let search = {
                let fleet = Arc::clone(&fleet);
                tokio::spawn(async move { fleet.scale("search", 7 + i).await })
            };
            billing.await.unwrap().unwrap();
            search.await.unwrap().unwrap();

            assert_eq!(replicas_on_disk(&fleet, "billing"), Some(u64::from(5 + i)));
            assert_eq!(replicas_on_disk(&fleet, "search"), Some(u64::from(7 + i)));
        }
    }

    #[tokio::test]
    async fn test_failed_scale_write_leaves_manifest_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeOrchestrator::default());
        let routes = RouteTable::new(vec![RouteEntry::new("billing", 8001)]);
        let fleet = FleetController::new(
            FleetManifest::generate(&routes, 1, 8000),
            dir.path().join("missing/docker-compose.yml"),
            fake.clone(),
        );

        let err = fleet.scale("billing", 3).await.unwrap_err();
        assert!(matches!(err, FleetError::ManifestWrite { .. }));
        assert_eq!(fleet.manifest().service("billing").unwrap().replica_count, 1);
        assert!(fake.calls().is_empty());
    }

    #[tokio::test]
    async fn test_build_generates_missing_dockerfiles() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("subapps/billing")).unwrap();
        std::fs::create_dir_all(dir.path().join("subapps/search")).unwrap();
        std::fs::write(dir.path().join("subapps/search/Dockerfile"), "FROM scratch\n").unwrap();

        let fake = Arc::new(FakeOrchestrator::default());
        let fleet = controller(dir.path(), fake).with_dockerfiles(8000);
        fleet.build_all().await.unwrap();

        let main = std::fs::read_to_string(dir.path().join("Dockerfile")).unwrap();
        assert!(main.contains("\"main:app\""));
        let billing = std::fs::read_to_string(dir.path().join("subapps/billing/Dockerfile")).unwrap();
        assert!(billing.contains("\"app:app\""));
        // Existing Dockerfiles are left alone
        let search = std::fs::read_to_string(dir.path().join("subapps/search/Dockerfile")).unwrap();
        assert_eq!(search, "FROM scratch\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_compose_cli_reports_failure() {
        let cli = ComposeCli::new("false");
        let err = cli.invoke(&["up".to_string()]).await.unwrap_err();
        assert!(matches!(err, FleetError::CommandFailed { .. }));
        assert!(err.to_string().contains("false up"));
    }

    #[tokio::test]
    async fn test_compose_cli_missing_binary() {
        let cli = ComposeCli::new("/nonexistent/docker-compose");
        let err = cli.invoke(&[]).await.unwrap_err();
        assert!(matches!(err, FleetError::Launch { .. }));
    }
}
