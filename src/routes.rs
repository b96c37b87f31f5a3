//! Static route table
//!
//! Maps the first segment of a request path to a backend. The table is built
//! once from configuration and never mutated, so lookups on the request path
//! are a single hash probe with no allocation.

use crate::breaker::BreakerSettings;
use crate::config::Config;
use hyper::http::uri::Authority;
use std::collections::HashMap;
use std::sync::Arc;

/// Name of the gateway's own application; built from the project root
pub const MAIN_ROUTE: &str = "main";

/// A configured backend
#[derive(Debug, Clone)]
pub struct RouteEntry {
    pub name: String,
    pub port: u16,
    /// Build context as written into the manifest
    pub build_context: String,
    pub replicas: u32,
    pub health_path: String,
    pub breaker: BreakerSettings,
    authority: Authority,
}

impl RouteEntry {
    pub fn new(name: impl Into<String>, port: u16) -> Self {
        let name = name.into();
        let build_context = if name == MAIN_ROUTE {
            ".".to_string()
        } else {
            format!("./subapps/{}", name)
        };
        Self {
            name,
            port,
            build_context,
            replicas: 1,
            health_path: "/health".to_string(),
            breaker: BreakerSettings::default(),
            authority: loopback_authority(port),
        }
    }

    pub fn with_build_context(mut self, context: impl Into<String>) -> Self {
        self.build_context = context.into();
        self
    }

    pub fn with_replicas(mut self, replicas: u32) -> Self {
        self.replicas = replicas;
        self
    }

    pub fn with_health_path(mut self, path: impl Into<String>) -> Self {
        self.health_path = path.into();
        self
    }

    pub fn with_breaker(mut self, settings: BreakerSettings) -> Self {
        self.breaker = settings;
        self
    }

    /// `127.0.0.1:<port>`, precomputed for request forwarding
    pub fn authority(&self) -> &Authority {
        &self.authority
    }
}

fn loopback_authority(port: u16) -> Authority {
    Authority::from_maybe_shared(format!("127.0.0.1:{}", port))
        .unwrap_or_else(|_| Authority::from_static("127.0.0.1"))
}

/// Check that a name can be used as the first segment of a request path
pub fn is_valid_route_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
}

/// Extract the first segment of a request path (`/billing/invoices` -> `billing`)
pub fn first_segment(path: &str) -> &str {
    let path = path.strip_prefix('/').unwrap_or(path);
    match path.find('/') {
        Some(end) => &path[..end],
        None => path,
    }
}

/// Immutable lookup table from backend name to route
#[derive(Debug, Default)]
pub struct RouteTable {
    entries: Vec<Arc<RouteEntry>>,
    by_name: HashMap<String, Arc<RouteEntry>>,
}

impl RouteTable {
    /// Build a table from entries, keeping their order. Later duplicates are
    /// ignored; configuration validation rejects them before this point.
    pub fn new(entries: impl IntoIterator<Item = RouteEntry>) -> Self {
        let mut table = Self::default();
        for entry in entries {
            if table.by_name.contains_key(&entry.name) {
                continue;
            }
            let entry = Arc::new(entry);
            table.by_name.insert(entry.name.clone(), Arc::clone(&entry));
            table.entries.push(entry);
        }
        table
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.routes.iter().map(|route| {
            RouteEntry::new(route.name.clone(), route.port)
                .with_build_context(route.build_context())
                .with_replicas(route.replicas)
                .with_health_path(route.health_path(&config.health))
                .with_breaker(BreakerSettings::new(
                    route.failure_threshold(&config.breaker),
                    route.recovery_timeout(&config.breaker),
                ))
        }))
    }

    pub fn get(&self, name: &str) -> Option<&Arc<RouteEntry>> {
        self.by_name.get(name)
    }

    /// Find the backend addressed by a request path
    pub fn resolve(&self, path: &str) -> Option<&Arc<RouteEntry>> {
        self.get(first_segment(path))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<RouteEntry>> {
        self.entries.iter()
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
