//! Indocker - a reverse proxy that routes hostnames to labelled Docker containers
//!
//! This library provides:
//! - A container source that polls the Docker daemon for alive containers
//! - A routing table built from container labels, kept current from daemon events
//! - A detail watcher publishing inspect data and resource samples per container
//! - A dispatcher that forwards requests by Host header, or explains why it cannot

pub mod broadcast;
pub mod config;
pub mod detail;
pub mod docker;
pub mod error;
pub mod loadbalancer;
pub mod pool;
pub mod proxy;
pub mod routing;
pub mod source;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod tls;

/// Version string shown on error pages
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
