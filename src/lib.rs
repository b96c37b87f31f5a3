//! Fleetgate - A path-routing gateway that supervises a fleet of sub-services
//!
//! This library provides an application gateway that:
//! - Routes HTTP traffic to backends by the first segment of the request path
//! - Generates the docker-compose manifest describing the backend fleet
//! - Builds, starts, scales, restarts and tears down the fleet via docker-compose
//! - Probes backend health periodically and restarts failing backends
//! - Isolates callers from failing backends with per-backend circuit breakers
//! - Emails an operator alert when a breaker trips
//! - Exposes request metrics in Prometheus format

pub mod breaker;
pub mod config;
pub mod error;
pub mod fallback;
pub mod fleet;
pub mod health;
pub mod lifecycle;
pub mod manifest;
pub mod metrics;
pub mod notifier;
pub mod pool;
pub mod proxy;
pub mod routes;
