use indocker::config::Config;
use indocker::detail::{DetailSnapshot, DetailWatcher};
use indocker::docker::{DockerApi, DockerClient};
use indocker::error::WatchError;
use indocker::pool::BackendClient;
use indocker::proxy::{Dispatcher, ProxyServer};
use indocker::routing::{RouteResolver, Router};
use indocker::source::ContainerSource;
use indocker::tls::TlsMaterial;
use indocker::{PKG_NAME, VERSION};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("indocker=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), exists = config_path.exists(), "Configuration loaded");
    print_startup_banner(&config);

    let ctx = CancellationToken::new();

    let docker: Arc<dyn DockerApi> = Arc::new(DockerClient::connect(config.server.docker_host.as_deref()).await?);

    // Discovery pipeline
    let source = Arc::new(ContainerSource::new(
        Arc::clone(&docker),
        config.discovery.poll_interval(),
    ));
    let router = Arc::new(Router::new(
        Arc::clone(&docker),
        config.discovery.route_defaults(),
    ));
    let details = Arc::new(DetailWatcher::new(Arc::clone(&docker)));

    match router.update().await {
        Ok(_) => info!(hosts = ?router.hostnames(), "Initial routing table built"),
        Err(e) => warn!(error = %e, "Initial routing update failed, waiting for the next poll"),
    }

    let auto_update = router.start_auto_update(&ctx);

    let mut tasks = Vec::new();

    {
        let (source, ctx) = (Arc::clone(&source), ctx.clone());
        tasks.push(tokio::spawn(async move {
            if let Err(e) = source.watch(ctx.clone()).await {
                log_watch_exit("container source", e, &ctx);
            }
        }));
    }
    {
        let (router, source, ctx) = (Arc::clone(&router), Arc::clone(&source), ctx.clone());
        tasks.push(tokio::spawn(async move {
            if let Err(e) = router.watch(ctx.clone(), &source).await {
                log_watch_exit("routing table", e, &ctx);
            }
        }));
    }
    {
        let (details, source, ctx) = (Arc::clone(&details), Arc::clone(&source), ctx.clone());
        tasks.push(tokio::spawn(async move {
            if let Err(e) = details.watch(ctx.clone(), &source).await {
                log_watch_exit("detail watcher", e, &ctx);
            }
        }));
    }
    tasks.push(tokio::spawn(log_container_details(Arc::clone(&details), ctx.clone())));

    // Proxy
    let client = BackendClient::new(config.proxy.pool_config())?;
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&router) as Arc<dyn RouteResolver>,
        config.proxy.balance.selector(),
        client,
        VERSION,
        config.proxy.request_timeout(),
    ));

    let http_port = config.server.http_port();
    let https_port = config.server.https_port();

    if https_port > 0 {
        let material = load_tls_material(&config)?;
        let https_addr = listen_addr(&config.server.bind, https_port)?;
        let server = ProxyServer::bind(https_addr, Arc::clone(&dispatcher))
            .await
            .map_err(|e| anyhow::anyhow!("Failed to listen on HTTPS {}: {}", https_addr, e))?
            .with_tls(material.acceptor()?);

        let ctx = ctx.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = server.run(ctx).await {
                error!(error = %e, "HTTPS proxy server error");
            }
        }));
    }

    if http_port > 0 {
        let http_addr = listen_addr(&config.server.bind, http_port)?;
        let mut server = ProxyServer::bind(http_addr, Arc::clone(&dispatcher))
            .await
            .map_err(|e| anyhow::anyhow!("Failed to listen on HTTP {}: {}", http_addr, e))?;

        if config.server.force_https && https_port > 0 {
            server = server.with_https_redirect(https_port);
            info!(http_port, https_port, "HTTP to HTTPS redirect enabled");
        }

        let ctx = ctx.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = server.run(ctx).await {
                error!(error = %e, "HTTP proxy server error");
            }
        }));
    }

    wait_for_shutdown_signal(&ctx).await;
    ctx.cancel();

    // Wait for loops and servers to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        auto_update.shutdown().await;
        for task in tasks {
            let _ = task.await;
        }
    })
    .await;

    info!("Shutdown complete");
    Ok(())
}

/// Wait for Ctrl+C, SIGTERM, or an internal cancellation
async fn wait_for_shutdown_signal(ctx: &CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received SIGINT (Ctrl+C), shutting down..."),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
                    _ = ctx.cancelled() => {}
                }
                return;
            }
            Err(e) => warn!(error = %e, "Failed to install SIGTERM handler"),
        }
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C, shutting down..."),
        _ = ctx.cancelled() => {}
    }
}

fn log_watch_exit(name: &str, err: WatchError, ctx: &CancellationToken) {
    match err {
        WatchError::Cancelled => debug!(name, "Watch loop stopped"),
        other => {
            error!(name, error = %other, "Watch loop failed, shutting down");
            ctx.cancel();
        }
    }
}

/// Summarize each detail batch at debug level
async fn log_container_details(details: Arc<DetailWatcher>, ctx: CancellationToken) {
    let (tx, mut rx) = mpsc::channel::<Arc<DetailSnapshot>>(1);
    if let Err(e) = details.subscribe(tx.clone()) {
        warn!(error = %e, "Failed to subscribe to container details");
        return;
    }

    loop {
        tokio::select! {
            _ = ctx.cancelled() => break,
            batch = rx.recv() => {
                let Some(batch) = batch else { break };
                let missing_stats = batch.containers.values().filter(|d| d.stats.is_none()).count();
                let memory: u64 = batch
                    .containers
                    .values()
                    .filter_map(|d| d.stats.as_ref().and_then(|s| s.memory_usage))
                    .sum();
                debug!(
                    containers = batch.containers.len(),
                    missing_stats,
                    memory_bytes = memory,
                    created_at = %batch.created_at,
                    retained = details.snapshots().len(),
                    "Container details refreshed"
                );
            }
        }
    }

    let _ = details.unsubscribe(&tx);
}

fn listen_addr(bind: &str, port: u16) -> anyhow::Result<SocketAddr> {
    format!("{}:{}", bind, port).parse().map_err(|e| {
        error!(bind, port, error = %e, "Invalid bind address");
        anyhow::anyhow!("Invalid bind address {}:{}: {}", bind, port, e)
    })
}

fn load_tls_material(config: &Config) -> anyhow::Result<TlsMaterial> {
    match (&config.server.tls_cert, &config.server.tls_key) {
        (Some(cert), Some(key)) => {
            let material = TlsMaterial::from_files(Path::new(cert), Path::new(key))?;
            info!(cert = %cert, key = %key, "TLS enabled with provided certificates");
            Ok(material)
        }
        _ => {
            let suffix = config.discovery.host_suffix.trim_start_matches('.');
            let mut names = vec!["localhost".to_string(), "127.0.0.1".to_string()];
            if !suffix.is_empty() {
                names.push(suffix.to_string());
                names.push(format!("*.{}", suffix));
            }
            let material = TlsMaterial::self_signed(names)?;
            warn!("TLS enabled with auto-generated self-signed certificate (not for production)");
            Ok(material)
        }
    }
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting proxy server");
    let http_port = config.server.http_port();
    let https_port = config.server.https_port();
    info!(
        bind = %config.server.bind,
        http_port = if http_port > 0 { Some(http_port) } else { None },
        https_port = if https_port > 0 { Some(https_port) } else { None },
        force_https = config.server.force_https,
        docker_host = config.server.docker_host.as_deref().unwrap_or("auto"),
        "Server configuration"
    );
    info!(
        poll_interval_ms = config.discovery.poll_interval_ms,
        host_suffix = %config.discovery.host_suffix,
        default_scheme = %config.discovery.default_scheme,
        default_port = config.discovery.default_port,
        default_network = %config.discovery.default_network,
        "Discovery settings"
    );
    info!(
        request_timeout_secs = config.proxy.request_timeout_secs,
        pool_max_idle = config.proxy.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.proxy.pool_idle_timeout_secs,
        balance = ?config.proxy.balance,
        "Proxy settings"
    );
}
