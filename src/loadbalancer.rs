//! Backend selection for hostnames served by several containers
//!
//! The routing table holds an unordered set of backends per hostname. A
//! [`BackendSelector`] picks one of them for each request.

use crate::routing::{Backends, Route};
use parking_lot::Mutex;
use rand::Rng;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Load balancing strategy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoadBalanceStrategy {
    /// Random: pick any backend with equal probability
    #[default]
    Random,
    /// Round-robin: cycle through backends ordered by container id
    RoundRobin,
}

impl LoadBalanceStrategy {
    pub fn selector(self) -> Arc<dyn BackendSelector> {
        match self {
            LoadBalanceStrategy::Random => Arc::new(RandomSelector),
            LoadBalanceStrategy::RoundRobin => Arc::new(RoundRobinSelector::default()),
        }
    }
}

pub trait BackendSelector: Send + Sync {
    /// Pick one backend for `hostname`. Returns the container id and its route.
    fn select(&self, hostname: &str, backends: &Backends) -> Option<(String, Route)>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RandomSelector;

impl BackendSelector for RandomSelector {
    fn select(&self, hostname: &str, backends: &Backends) -> Option<(String, Route)> {
        if backends.is_empty() {
            return None;
        }

        let idx = rand::thread_rng().gen_range(0..backends.len());
        let (id, route) = backends.iter().nth(idx)?;
        debug!(host = hostname, container = %id, backend = %route, "Selected backend");
        Some((id.clone(), route.clone()))
    }
}

/// Keeps one counter per hostname
#[derive(Debug, Default)]
pub struct RoundRobinSelector {
    counters: Mutex<HashMap<String, usize>>,
}

impl BackendSelector for RoundRobinSelector {
    fn select(&self, hostname: &str, backends: &Backends) -> Option<(String, Route)> {
        if backends.is_empty() {
            return None;
        }

        let mut ids: Vec<&String> = backends.keys().collect();
        ids.sort();

        let idx = {
            let mut counters = self.counters.lock();
            let counter = counters.entry(hostname.to_string()).or_insert(0);
            let idx = *counter % ids.len();
            *counter = counter.wrapping_add(1);
            idx
        };

        let id = ids[idx];
        let route = &backends[id];
        debug!(host = hostname, container = %id, backend = %route, "Selected backend");
        Some((id.clone(), route.clone()))
    }
}
