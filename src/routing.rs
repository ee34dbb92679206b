//! Routing table: hostname -> backends, derived from container labels
//!
//! A container becomes routable by carrying a host label. Each semantic field
//! accepts several label spellings, checked in a fixed order; the first
//! present, non-empty value wins.
//!
//! | field   | labels (priority order)                                     | default  |
//! |---------|-------------------------------------------------------------|----------|
//! | host    | `indocker.host`, `indocker.hostname`, `host`, `hostname`    | required |
//! | scheme  | `indocker.scheme`, `indocker.schema`, `scheme`, `schema`    | `http`   |
//! | port    | `indocker.port`, `port`                                     | 80 (443 for https) |
//! | network | `indocker.network`, `indocker.net`, `network`, `net`        | `bridge` |
//!
//! When the requested network is not attached to the container, an arbitrary
//! attached network is used instead. Which one is unspecified: it follows
//! `HashMap` iteration order and is not stable across runs.

use crate::broadcast::Broadcaster;
use crate::docker::{ContainerRecord, DockerApi, DockerError};
use crate::error::{LookupError, SubscriptionError, WatchError};
use crate::source::{ContainerSource, Snapshot};
use futures::StreamExt;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const HOST_LABELS: [&str; 4] = ["indocker.host", "indocker.hostname", "host", "hostname"];
pub const SCHEME_LABELS: [&str; 4] = ["indocker.scheme", "indocker.schema", "scheme", "schema"];
pub const PORT_LABELS: [&str; 2] = ["indocker.port", "port"];
pub const NETWORK_LABELS: [&str; 4] = ["indocker.network", "indocker.net", "network", "net"];

/// Reserved DNS suffix stripped from every hostname
pub const DEFAULT_HOST_SUFFIX: &str = ".indocker.app";

/// Extra attempts for an event-triggered update
const EVENT_UPDATE_RETRIES: usize = 2;
const RECONNECT_BACKOFF_MIN: Duration = Duration::from_millis(100);
const RECONNECT_BACKOFF_MAX: Duration = Duration::from_secs(5);

/// One resolved backend endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Route {
    pub scheme: String,
    pub ip_address: String,
    pub port: u16,
    pub network_name: String,
}

impl Route {
    /// `ip:port`, with IPv6 addresses bracketed
    pub fn authority(&self) -> String {
        if self.ip_address.contains(':') {
            format!("[{}]:{}", self.ip_address, self.port)
        } else {
            format!("{}:{}", self.ip_address, self.port)
        }
    }

    pub fn url(&self) -> String {
        format!("{}://{}", self.scheme, self.authority())
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url())
    }
}

/// Routes for one hostname, keyed by container id
pub type Backends = HashMap<String, Route>;

/// Hostname -> backends
pub type RoutingTable = HashMap<String, Backends>;

/// Values used when a container does not set a label
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteDefaults {
    pub scheme: String,
    pub port: u16,
    pub network: String,
    pub host_suffix: String,
}

impl Default for RouteDefaults {
    fn default() -> Self {
        Self {
            scheme: "http".to_string(),
            port: 80,
            network: "bridge".to_string(),
            host_suffix: DEFAULT_HOST_SUFFIX.to_string(),
        }
    }
}

/// Lower-case, trim, and strip the reserved suffix (case-insensitive).
///
/// Applied until nothing changes, so `normalize(normalize(h)) == normalize(h)`.
pub fn normalize_hostname(host: &str, suffix: &str) -> String {
    let suffix = suffix.to_lowercase();
    let mut current = host.to_lowercase();

    loop {
        let trimmed = current.trim().trim_end_matches('.');
        let next = if suffix.is_empty() {
            trimmed
        } else {
            trimmed.strip_suffix(suffix.as_str()).unwrap_or(trimmed)
        };

        if next == current {
            return current;
        }
        current = next.to_string();
    }
}

fn first_label<'a>(labels: &'a HashMap<String, String>, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .filter_map(|key| labels.get(*key))
        .map(|value| value.trim())
        .find(|value| !value.is_empty())
}

/// Derive the hostname and route for one container, if it is routable
pub fn derive_route(container: &ContainerRecord, defaults: &RouteDefaults) -> Option<(String, Route)> {
    let host = normalize_hostname(first_label(&container.labels, &HOST_LABELS)?, &defaults.host_suffix);
    if host.is_empty() {
        return None;
    }

    let scheme = first_label(&container.labels, &SCHEME_LABELS)
        .map(str::to_lowercase)
        .unwrap_or_else(|| defaults.scheme.clone());

    let default_port = if scheme == "https" { 443 } else { defaults.port };
    let port = first_label(&container.labels, &PORT_LABELS)
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(default_port);

    let wanted_network = first_label(&container.labels, &NETWORK_LABELS).unwrap_or(defaults.network.as_str());

    let (network_name, endpoint) = match container.networks.get_key_value(wanted_network) {
        Some(found) => found,
        None => container.networks.iter().next()?,
    };

    if scheme.is_empty() || endpoint.ip_address.is_empty() || port == 0 {
        return None;
    }

    Some((
        host,
        Route {
            scheme,
            ip_address: endpoint.ip_address.clone(),
            port,
            network_name: network_name.clone(),
        },
    ))
}

/// Build a full table from a set of containers
pub fn build_table<'a, I>(containers: I, defaults: &RouteDefaults) -> RoutingTable
where
    I: IntoIterator<Item = &'a ContainerRecord>,
{
    let mut table = RoutingTable::new();
    for container in containers {
        if let Some((host, route)) = derive_route(container, defaults) {
            table
                .entry(host)
                .or_default()
                .insert(container.id.clone(), route);
        }
    }
    table
}

/// Read access to routes, as needed by the dispatcher
pub trait RouteResolver: Send + Sync {
    fn lookup_by_hostname(&self, hostname: &str) -> Result<Backends, LookupError>;

    /// Every known hostname, sorted
    fn hostnames(&self) -> Vec<String>;
}

/// Owns the routing table and notifies subscribers when it changes
pub struct Router {
    api: Arc<dyn DockerApi>,
    defaults: RouteDefaults,
    table: RwLock<Arc<RoutingTable>>,
    subscribers: Arc<Broadcaster<Arc<RoutingTable>>>,
    /// Cancels pending deliveries when the router goes away
    lifetime: CancellationToken,
}

impl Router {
    pub fn new(api: Arc<dyn DockerApi>, defaults: RouteDefaults) -> Self {
        Self {
            api,
            defaults,
            table: RwLock::new(Arc::new(RoutingTable::new())),
            subscribers: Arc::new(Broadcaster::new()),
            lifetime: CancellationToken::new(),
        }
    }

    pub fn defaults(&self) -> &RouteDefaults {
        &self.defaults
    }

    /// Rebuild the table from the daemon now. Returns whether it changed.
    pub async fn update(&self) -> Result<bool, DockerError> {
        self.refresh(&self.lifetime).await
    }

    async fn refresh(&self, ctx: &CancellationToken) -> Result<bool, DockerError> {
        let containers = self.api.list_alive_containers().await?;
        let table = build_table(&containers, &self.defaults);
        Ok(self.install(table, ctx))
    }

    /// Rebuild the table from a container source snapshot. Returns whether it changed.
    pub fn apply_snapshot(&self, snapshot: &Snapshot) -> bool {
        let table = build_table(snapshot.values(), &self.defaults);
        self.install(table, &self.lifetime)
    }

    /// Swap in `new_table` and notify subscribers if it differs from the
    /// current one. Comparison, swap and notification share one write lock.
    fn install(&self, new_table: RoutingTable, ctx: &CancellationToken) -> bool {
        let mut table = self.table.write();
        if **table == new_table {
            return false;
        }

        let previous_hosts = table.len();
        *table = Arc::new(new_table);
        info!(
            hosts = table.len(),
            previous_hosts,
            "Routing table changed"
        );
        self.subscribers.publish(Arc::clone(&*table), ctx);
        true
    }

    /// Drive the table from a container source until `ctx` is cancelled
    pub async fn watch(&self, ctx: CancellationToken, source: &ContainerSource) -> Result<(), WatchError> {
        let (tx, mut rx) = mpsc::channel::<Snapshot>(1);
        source.subscribe(tx.clone())?;

        let result = loop {
            tokio::select! {
                biased;
                _ = ctx.cancelled() => break Err(WatchError::Cancelled),
                snapshot = rx.recv() => {
                    if let Some(snapshot) = snapshot {
                        let table = build_table(snapshot.values(), &self.defaults);
                        self.install(table, &ctx);
                    }
                }
            }
        };

        let _ = source.unsubscribe(&tx);
        result
    }

    /// Keep the table current from daemon events until stopped.
    ///
    /// Each event triggers an [`update`](Self::update), retried up to twice.
    /// A failed or ended event stream is reopened with exponential backoff,
    /// followed by a refresh to catch changes missed while disconnected.
    pub fn start_auto_update(self: &Arc<Self>, ctx: &CancellationToken) -> AutoUpdateHandle {
        let token = ctx.child_token();
        let router = Arc::clone(self);
        let loop_token = token.clone();
        let task = tokio::spawn(async move { router.event_loop(loop_token).await });

        AutoUpdateHandle { token, task }
    }

    async fn event_loop(&self, ctx: CancellationToken) {
        let mut backoff = RECONNECT_BACKOFF_MIN;
        let mut reconnecting = false;

        info!("Routing auto-update started");

        loop {
            if ctx.is_cancelled() {
                break;
            }

            let mut events = self.api.events();
            debug!(reconnecting, "Opened daemon event stream");

            if reconnecting {
                self.update_with_retries(&ctx).await;
            }

            loop {
                tokio::select! {
                    biased;
                    _ = ctx.cancelled() => {
                        info!("Routing auto-update stopped");
                        return;
                    }
                    item = events.next() => match item {
                        Some(Ok(event)) => {
                            backoff = RECONNECT_BACKOFF_MIN;
                            debug!(
                                kind = %event.kind,
                                action = %event.action,
                                actor = event.actor_id.as_deref().unwrap_or(""),
                                "Daemon event"
                            );
                            self.update_with_retries(&ctx).await;
                        }
                        Some(Err(e)) => {
                            warn!(error = %e, backoff_ms = backoff.as_millis() as u64, "Daemon event stream failed, reopening");
                            break;
                        }
                        None => {
                            warn!(backoff_ms = backoff.as_millis() as u64, "Daemon event stream ended, reopening");
                            break;
                        }
                    }
                }
            }

            reconnecting = true;
            tokio::select! {
                _ = ctx.cancelled() => break,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(RECONNECT_BACKOFF_MAX);
        }

        info!("Routing auto-update stopped");
    }

    async fn update_with_retries(&self, ctx: &CancellationToken) {
        for attempt in 0..=EVENT_UPDATE_RETRIES {
            let result = tokio::select! {
                _ = ctx.cancelled() => return,
                result = self.refresh(ctx) => result,
            };

            match result {
                Ok(_) => return,
                Err(e) => warn!(attempt, error = %e, "Routing update failed"),
            }
        }
        warn!("Giving up on routing update for this event");
    }

    /// Receive a table every time it changes. Call [`RoutingSubscription::stop`] when done.
    pub fn subscribe_for_routing_updates(&self) -> (mpsc::Receiver<Arc<RoutingTable>>, RoutingSubscription) {
        let (tx, rx) = mpsc::channel(1);
        // A fresh channel cannot already be registered
        let _ = self.subscribers.subscribe(tx.clone());

        (
            rx,
            RoutingSubscription {
                subscribers: Arc::clone(&self.subscribers),
                tx,
            },
        )
    }

    /// Look up the backends for a hostname, normalizing it first
    pub fn lookup_by_hostname(&self, hostname: &str) -> Result<Backends, LookupError> {
        let hostname = normalize_hostname(hostname, &self.defaults.host_suffix);
        let table = self.table.read();

        if table.is_empty() {
            return Err(LookupError::NoRegisteredRoutes);
        }

        table
            .get(&hostname)
            .cloned()
            .ok_or(LookupError::NoRouteFound)
    }

    /// A full copy of the current table
    pub fn all_routes(&self) -> RoutingTable {
        (**self.table.read()).clone()
    }

    pub fn routes_count(&self) -> usize {
        self.table.read().len()
    }

    pub fn hostnames(&self) -> Vec<String> {
        let mut hosts: Vec<String> = self.table.read().keys().cloned().collect();
        hosts.sort();
        hosts
    }
}

impl Drop for Router {
    fn drop(&mut self) {
        self.lifetime.cancel();
    }
}

impl RouteResolver for Router {
    fn lookup_by_hostname(&self, hostname: &str) -> Result<Backends, LookupError> {
        Router::lookup_by_hostname(self, hostname)
    }

    fn hostnames(&self) -> Vec<String> {
        Router::hostnames(self)
    }
}

/// Stops a running auto-update loop
pub struct AutoUpdateHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl AutoUpdateHandle {
    /// Idempotent
    pub fn stop(&self) {
        self.token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop and wait for the loop to exit
    pub async fn shutdown(self) {
        self.token.cancel();
        let _ = self.task.await;
    }
}

/// Registration returned by [`Router::subscribe_for_routing_updates`]
pub struct RoutingSubscription {
    subscribers: Arc<Broadcaster<Arc<RoutingTable>>>,
    tx: mpsc::Sender<Arc<RoutingTable>>,
}

impl RoutingSubscription {
    /// Idempotent
    pub fn stop(&self) {
        let _: Result<(), SubscriptionError> = self.subscribers.unsubscribe(&self.tx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docker::DaemonEvent;
    use crate::testing::StubDocker;

    fn defaults() -> RouteDefaults {
        RouteDefaults::default()
    }

    fn router_with(stub: &Arc<StubDocker>) -> Arc<Router> {
        Arc::new(Router::new(Arc::clone(stub) as Arc<dyn DockerApi>, defaults()))
    }

    async fn wait_until<F: Fn() -> bool>(condition: F) -> bool {
        for _ in 0..200 {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[test]
    fn test_normalize_hostname() {
        assert_eq!(normalize_hostname("  Foo ", DEFAULT_HOST_SUFFIX), "foo");
        assert_eq!(normalize_hostname("foo.indocker.app", DEFAULT_HOST_SUFFIX), "foo");
        assert_eq!(normalize_hostname("FOO.InDocker.APP", DEFAULT_HOST_SUFFIX), "foo");
        assert_eq!(normalize_hostname("a.b.indocker.app", DEFAULT_HOST_SUFFIX), "a.b");
        assert_eq!(normalize_hostname("foo.indocker.app.", DEFAULT_HOST_SUFFIX), "foo");
        assert_eq!(normalize_hostname("indocker.app", DEFAULT_HOST_SUFFIX), "indocker.app");
        assert_eq!(normalize_hostname("foo.example.com", DEFAULT_HOST_SUFFIX), "foo.example.com");
    }

    #[test]
    fn test_normalize_hostname_is_idempotent() {
        for input in [
            "foo",
            "FOO.INDOCKER.APP",
            "foo.indocker.app.indocker.app",
            " bar .indocker.app",
            "x.indocker.app.",
            ".indocker.app",
            "",
        ] {
            let once = normalize_hostname(input, DEFAULT_HOST_SUFFIX);
            let twice = normalize_hostname(&once, DEFAULT_HOST_SUFFIX);
            assert_eq!(once, twice, "input {:?}", input);
        }
    }

    #[test]
    fn test_container_without_host_label_has_no_route() {
        let container = ContainerRecord::new("c1")
            .with_label("indocker.port", "8080")
            .with_network("bridge", "10.0.0.5");

        assert!(derive_route(&container, &defaults()).is_none());
        assert!(build_table([&container], &defaults()).is_empty());
    }

    #[test]
    fn test_blank_host_label_has_no_route() {
        let container = ContainerRecord::new("c1")
            .with_label("indocker.host", "   ")
            .with_network("bridge", "10.0.0.5");

        assert!(derive_route(&container, &defaults()).is_none());
    }

    #[test]
    fn test_host_label_priority() {
        let container = ContainerRecord::new("c1")
            .with_label("hostname", "fourth")
            .with_label("host", "third")
            .with_label("indocker.host", "first")
            .with_network("bridge", "10.0.0.5");

        let (host, _) = derive_route(&container, &defaults()).unwrap();
        assert_eq!(host, "first");

        let container = ContainerRecord::new("c1")
            .with_label("host", "third")
            .with_label("indocker.hostname", "second")
            .with_network("bridge", "10.0.0.5");
        let (host, _) = derive_route(&container, &defaults()).unwrap();
        assert_eq!(host, "second");

        // Empty higher-priority value falls through
        let container = ContainerRecord::new("c1")
            .with_label("indocker.host", "")
            .with_label("host", "third")
            .with_network("bridge", "10.0.0.5");
        let (host, _) = derive_route(&container, &defaults()).unwrap();
        assert_eq!(host, "third");
    }

    #[test]
    fn test_scheme_and_port_defaults() {
        let container = ContainerRecord::new("c1")
            .with_label("host", "foo")
            .with_network("bridge", "10.0.0.5");
        let (_, route) = derive_route(&container, &defaults()).unwrap();
        assert_eq!(route.scheme, "http");
        assert_eq!(route.port, 80);
        assert_eq!(route.network_name, "bridge");

        let container = container.with_label("schema", "HTTPS");
        let (_, route) = derive_route(&container, &defaults()).unwrap();
        assert_eq!(route.scheme, "https");
        assert_eq!(route.port, 443);

        let container = container.with_label("port", "8443");
        let (_, route) = derive_route(&container, &defaults()).unwrap();
        assert_eq!(route.port, 8443);
    }

    #[test]
    fn test_invalid_port_keeps_default() {
        for bad in ["http", "70000", "-1", "80.5"] {
            let container = ContainerRecord::new("c1")
                .with_label("indocker.host", "foo")
                .with_label("indocker.port", bad)
                .with_label("port", "9000")
                .with_network("bridge", "10.0.0.5");

            let (_, route) = derive_route(&container, &defaults()).unwrap();
            assert_eq!(route.port, 80, "port label {:?}", bad);
        }
    }

    #[test]
    fn test_zero_port_is_not_routable() {
        let container = ContainerRecord::new("c1")
            .with_label("indocker.host", "foo")
            .with_label("indocker.port", "0")
            .with_network("bridge", "10.0.0.5");

        assert!(derive_route(&container, &defaults()).is_none());
    }

    #[test]
    fn test_named_network_is_preferred() {
        let container = ContainerRecord::new("c1")
            .with_label("indocker.host", "foo")
            .with_label("indocker.net", "backend")
            .with_network("bridge", "172.17.0.2")
            .with_network("backend", "10.1.0.7");

        let (_, route) = derive_route(&container, &defaults()).unwrap();
        assert_eq!(route.ip_address, "10.1.0.7");
        assert_eq!(route.network_name, "backend");
    }

    #[test]
    fn test_missing_network_falls_back_to_an_attached_one() {
        let container = ContainerRecord::new("c1")
            .with_label("indocker.host", "foo")
            .with_label("indocker.network", "absent")
            .with_network("a", "10.0.0.1")
            .with_network("b", "10.0.0.2");

        let (_, route) = derive_route(&container, &defaults()).unwrap();
        // Either attached network is acceptable
        assert!(
            (route.network_name == "a" && route.ip_address == "10.0.0.1")
                || (route.network_name == "b" && route.ip_address == "10.0.0.2"),
            "{:?}",
            route
        );
    }

    #[test]
    fn test_unattached_or_addressless_container_is_not_routable() {
        let container = ContainerRecord::new("c1").with_label("indocker.host", "foo");
        assert!(derive_route(&container, &defaults()).is_none());

        let container = container.with_network("bridge", "");
        assert!(derive_route(&container, &defaults()).is_none());
    }

    #[test]
    fn test_route_url() {
        let route = Route {
            scheme: "http".to_string(),
            ip_address: "10.0.0.5".to_string(),
            port: 9000,
            network_name: "bridge".to_string(),
        };
        assert_eq!(route.url(), "http://10.0.0.5:9000");
        assert_eq!(route.to_string(), "http://10.0.0.5:9000");

        let v6 = Route {
            ip_address: "fd00::5".to_string(),
            ..route
        };
        assert_eq!(v6.authority(), "[fd00::5]:9000");
    }

    #[test]
    fn test_suffixed_and_bare_hosts_share_a_key() {
        let suffixed = ContainerRecord::new("c1")
            .with_label("indocker.host", "FOO.InDocker.App")
            .with_network("bridge", "10.0.0.5");
        let bare = ContainerRecord::new("c2")
            .with_label("indocker.host", "foo")
            .with_network("bridge", "10.0.0.6");

        let table = build_table([&suffixed, &bare], &defaults());
        assert_eq!(table.len(), 1);
        assert_eq!(table["foo"].len(), 2);
    }

    #[tokio::test]
    async fn test_update_builds_expected_table() {
        let stub = Arc::new(StubDocker::new());
        stub.set_containers(vec![ContainerRecord::new("c1")
            .with_label("indocker.host", "foo")
            .with_label("indocker.port", "9000")
            .with_network("bridge", "10.0.0.5")]);
        let router = router_with(&stub);

        assert!(router.update().await.unwrap());

        let backends = router.lookup_by_hostname("foo").unwrap();
        assert_eq!(backends.len(), 1);
        assert_eq!(backends["c1"].url(), "http://10.0.0.5:9000");

        let backends = router.lookup_by_hostname("FOO.indocker.app").unwrap();
        assert_eq!(backends["c1"].port, 9000);
    }

    #[tokio::test]
    async fn test_shared_hostname_keeps_both_backends() {
        let stub = Arc::new(StubDocker::new());
        stub.set_containers(vec![
            ContainerRecord::new("c1")
                .with_label("indocker.host", "bar")
                .with_network("bridge", "10.0.0.5"),
            ContainerRecord::new("c2")
                .with_label("indocker.host", "bar")
                .with_network("bridge", "10.0.0.6"),
        ]);
        let router = router_with(&stub);
        router.update().await.unwrap();

        let backends = router.lookup_by_hostname("bar").unwrap();
        assert_eq!(backends.len(), 2);
        assert_eq!(backends["c1"].ip_address, "10.0.0.5");
        assert_eq!(backends["c2"].ip_address, "10.0.0.6");
    }

    #[tokio::test]
    async fn test_lookup_miss_states() {
        let stub = Arc::new(StubDocker::new());
        let router = router_with(&stub);

        assert_eq!(
            router.lookup_by_hostname("foo"),
            Err(LookupError::NoRegisteredRoutes)
        );

        stub.set_containers(vec![ContainerRecord::new("c1")
            .with_label("indocker.host", "foo")
            .with_network("bridge", "10.0.0.5")]);
        router.update().await.unwrap();

        assert_eq!(router.lookup_by_hostname("nope"), Err(LookupError::NoRouteFound));
    }

    #[tokio::test]
    async fn test_update_error_keeps_previous_table() {
        let stub = Arc::new(StubDocker::new());
        stub.set_containers(vec![ContainerRecord::new("c1")
            .with_label("indocker.host", "foo")
            .with_network("bridge", "10.0.0.5")]);
        let router = router_with(&stub);
        router.update().await.unwrap();

        stub.fail_list(true);
        assert!(router.update().await.is_err());
        assert!(router.lookup_by_hostname("foo").is_ok());
    }

    #[tokio::test]
    async fn test_all_routes_is_a_copy() {
        let stub = Arc::new(StubDocker::new());
        stub.set_containers(vec![ContainerRecord::new("c1")
            .with_label("indocker.host", "foo")
            .with_network("bridge", "10.0.0.5")]);
        let router = router_with(&stub);
        router.update().await.unwrap();

        let mut copy = router.all_routes();
        copy.clear();
        assert_eq!(router.routes_count(), 1);
        assert_eq!(router.hostnames(), vec!["foo"]);
    }

    #[tokio::test]
    async fn test_subscribers_notified_only_on_change() {
        let stub = Arc::new(StubDocker::new());
        stub.set_containers(vec![ContainerRecord::new("c1")
            .with_label("indocker.host", "foo")
            .with_network("bridge", "10.0.0.5")]);
        let router = router_with(&stub);
        let (mut rx, subscription) = router.subscribe_for_routing_updates();

        assert!(router.update().await.unwrap());
        let table = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(table.contains_key("foo"));

        // Same daemon state: no notification
        assert!(!router.update().await.unwrap());
        let nothing = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(nothing.is_err());

        stub.set_containers(vec![ContainerRecord::new("c1")
            .with_label("indocker.host", "foo")
            .with_label("indocker.port", "8080")
            .with_network("bridge", "10.0.0.5")]);
        assert!(router.update().await.unwrap());
        let table = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(table["foo"]["c1"].port, 8080);

        subscription.stop();
        subscription.stop();
        stub.set_containers(Vec::new());
        assert!(router.update().await.unwrap());
        let nothing = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(!matches!(nothing, Ok(Some(_))));
    }

    #[tokio::test]
    async fn test_watch_follows_container_source() {
        let stub = Arc::new(StubDocker::new());
        stub.set_containers(vec![ContainerRecord::new("c1")
            .with_label("indocker.host", "foo")
            .with_network("bridge", "10.0.0.5")]);
        let source = Arc::new(ContainerSource::new(
            Arc::clone(&stub) as Arc<dyn DockerApi>,
            Duration::from_millis(100),
        ));
        let router = router_with(&stub);
        let ctx = CancellationToken::new();

        let source_task = {
            let source = Arc::clone(&source);
            let ctx = ctx.clone();
            tokio::spawn(async move { source.watch(ctx).await })
        };
        let router_task = {
            let router = Arc::clone(&router);
            let source = Arc::clone(&source);
            let ctx = ctx.clone();
            tokio::spawn(async move { router.watch(ctx, &source).await })
        };

        assert!(wait_until(|| router.lookup_by_hostname("foo").is_ok()).await);

        ctx.cancel();
        let result = router_task.await.unwrap();
        assert!(matches!(result, Err(WatchError::Cancelled)));
        let _ = source_task.await;
    }

    #[tokio::test]
    async fn test_auto_update_follows_events() {
        let stub = Arc::new(StubDocker::new());
        let router = router_with(&stub);
        let ctx = CancellationToken::new();
        let handle = router.start_auto_update(&ctx);

        assert!(wait_until(|| stub.events_opened() == 1).await);

        stub.set_containers(vec![ContainerRecord::new("c1")
            .with_label("indocker.host", "foo")
            .with_network("bridge", "10.0.0.5")]);
        assert!(stub.emit_event(DaemonEvent {
            kind: "container".to_string(),
            action: "start".to_string(),
            actor_id: Some("c1".to_string()),
        }));

        assert!(wait_until(|| router.lookup_by_hostname("foo").is_ok()).await);

        handle.stop();
        assert!(wait_until(|| handle.is_finished()).await);
    }

    #[tokio::test]
    async fn test_auto_update_retries_then_gives_up() {
        let stub = Arc::new(StubDocker::new());
        stub.fail_list(true);
        let router = router_with(&stub);
        let ctx = CancellationToken::new();
        let handle = router.start_auto_update(&ctx);

        assert!(wait_until(|| stub.events_opened() == 1).await);
        stub.emit_event(DaemonEvent::default());

        assert!(wait_until(|| stub.list_calls() == 1 + EVENT_UPDATE_RETRIES).await);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(stub.list_calls(), 1 + EVENT_UPDATE_RETRIES);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_auto_update_reopens_broken_stream() {
        let stub = Arc::new(StubDocker::new());
        let router = router_with(&stub);
        let ctx = CancellationToken::new();
        let handle = router.start_auto_update(&ctx);

        assert!(wait_until(|| stub.events_opened() == 1).await);
        stub.set_containers(vec![ContainerRecord::new("c1")
            .with_label("indocker.host", "foo")
            .with_network("bridge", "10.0.0.5")]);
        assert!(stub.break_event_stream());

        assert!(wait_until(|| stub.events_opened() == 2).await);
        // Reopening refreshes the table
        assert!(wait_until(|| router.lookup_by_hostname("foo").is_ok()).await);

        // Parent cancellation stops the loop too
        ctx.cancel();
        assert!(wait_until(|| handle.is_finished()).await);
    }
}
