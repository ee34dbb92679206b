//! Backend HTTP client
//!
//! Plain `http` backends go through a pooled hyper client so keep-alive
//! connections are reused across requests. `https` backends and protocol
//! upgrades get a dedicated connection: TLS backends are not verified, and an
//! upgraded connection cannot go back to a pool.

use crate::routing::Route;
use crate::tls::{backend_connector, TlsError};
use http_body_util::combinators::BoxBody;
use hyper::body::{Bytes, Incoming};
use hyper::{Request, Response, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use rustls::pki_types::ServerName;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

/// Request body type sent to backends
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("client error: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("TLS handshake with {addr} failed: {source}")]
    Handshake {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid backend address: {0}")]
    InvalidAddress(String),

    #[error("unsupported backend scheme: {0}")]
    UnsupportedScheme(String),

    #[error("request build error: {0}")]
    RequestBuild(#[from] hyper::http::Error),

    #[error(transparent)]
    Tls(#[from] TlsError),
}

/// Counters for backend traffic
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Requests sent through the pooled client
    pub pooled_requests: AtomicU64,
    /// Requests sent over a dedicated connection
    pub direct_requests: AtomicU64,
}

impl PoolStats {
    pub fn get_pooled_requests(&self) -> u64 {
        self.pooled_requests.load(Ordering::Relaxed)
    }

    pub fn get_direct_requests(&self) -> u64 {
        self.direct_requests.load(Ordering::Relaxed)
    }
}

/// Configuration for the pooled client
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections per host
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

trait BackendIo: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> BackendIo for T {}

pub struct BackendClient {
    client: Client<HttpConnector, ProxyBody>,
    tls: TlsConnector,
    stats: Arc<PoolStats>,
    config: PoolConfig,
}

impl BackendClient {
    pub fn new(config: PoolConfig) -> Result<Self, ForwardError> {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Backend client initialized"
        );

        Ok(Self {
            client,
            tls: backend_connector()?,
            stats: Arc::new(PoolStats::default()),
            config,
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn stats(&self) -> Arc<PoolStats> {
        Arc::clone(&self.stats)
    }

    /// Send `req` to `route`. The request URI must be absolute.
    pub async fn send(&self, req: Request<ProxyBody>, route: &Route) -> Result<Response<Incoming>, ForwardError> {
        match route.scheme.as_str() {
            "http" => {
                self.stats.pooled_requests.fetch_add(1, Ordering::Relaxed);
                Ok(self.client.request(req).await?)
            }
            "https" => self.send_direct(req, route).await,
            other => Err(ForwardError::UnsupportedScheme(other.to_string())),
        }
    }

    /// Send an upgrade request over a dedicated connection that stays usable
    /// after a `101 Switching Protocols` answer
    pub async fn send_upgrade(&self, req: Request<ProxyBody>, route: &Route) -> Result<Response<Incoming>, ForwardError> {
        match route.scheme.as_str() {
            "http" | "https" => self.send_direct(req, route).await,
            other => Err(ForwardError::UnsupportedScheme(other.to_string())),
        }
    }

    async fn send_direct(&self, mut req: Request<ProxyBody>, route: &Route) -> Result<Response<Incoming>, ForwardError> {
        let io = self.connect(route).await?;
        self.stats.direct_requests.fetch_add(1, Ordering::Relaxed);

        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(io)).await?;
        let backend = route.url();
        tokio::spawn(async move {
            if let Err(e) = conn.with_upgrades().await {
                debug!(backend, error = %e, "Backend connection closed with error");
            }
        });

        *req.uri_mut() = origin_form(req.uri())?;
        Ok(sender.send_request(req).await?)
    }

    async fn connect(&self, route: &Route) -> Result<Box<dyn BackendIo>, ForwardError> {
        let addr = route.authority();
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|source| ForwardError::Connect {
                addr: addr.clone(),
                source,
            })?;
        let _ = stream.set_nodelay(true);

        if route.scheme != "https" {
            return Ok(Box::new(stream));
        }

        let ip: IpAddr = route
            .ip_address
            .parse()
            .map_err(|_| ForwardError::InvalidAddress(route.ip_address.clone()))?;
        let tls_stream = self
            .tls
            .connect(ServerName::IpAddress(ip.into()), stream)
            .await
            .map_err(|source| ForwardError::Handshake { addr, source })?;

        Ok(Box::new(tls_stream))
    }
}

/// Strip scheme and authority, keeping path and query
fn origin_form(uri: &Uri) -> Result<Uri, ForwardError> {
    let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    Ok(Uri::builder().path_and_query(path).build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::TlsMaterial;
    use http_body_util::{BodyExt, Empty, Full};
    use hyper::service::service_fn;
    use tokio::net::TcpListener;

    fn route(scheme: &str, port: u16) -> Route {
        Route {
            scheme: scheme.to_string(),
            ip_address: "127.0.0.1".to_string(),
            port,
            network_name: "bridge".to_string(),
        }
    }

    fn get(uri: &str) -> Request<ProxyBody> {
        Request::builder()
            .uri(uri)
            .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
            .unwrap()
    }

    #[test]
    fn test_pool_config_default() {
        let config = PoolConfig::default();
        assert_eq!(config.max_idle_per_host, 10);
        assert_eq!(config.idle_timeout, Duration::from_secs(90));
    }

    #[test]
    fn test_origin_form() {
        let uri: Uri = "http://10.0.0.5:9000/a/b?x=1".parse().unwrap();
        assert_eq!(origin_form(&uri).unwrap(), "/a/b?x=1");

        let uri: Uri = "http://10.0.0.5:9000".parse().unwrap();
        assert_eq!(origin_form(&uri).unwrap(), "/");
    }

    #[tokio::test]
    async fn test_unsupported_scheme() {
        let client = BackendClient::new(PoolConfig::default()).unwrap();
        let result = client.send(get("ftp://127.0.0.1:21/"), &route("ftp", 21)).await;
        assert!(matches!(result, Err(ForwardError::UnsupportedScheme(s)) if s == "ftp"));
    }

    #[tokio::test]
    async fn test_connect_failure() {
        // Grab a free port and close it again
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let client = BackendClient::new(PoolConfig::default()).unwrap();
        let result = client
            .send(get(&format!("https://127.0.0.1:{}/", port)), &route("https", port))
            .await;
        assert!(matches!(result, Err(ForwardError::Connect { .. })));
    }

    #[tokio::test]
    async fn test_https_backend_with_self_signed_cert() {
        let material = TlsMaterial::self_signed(vec!["backend.internal".to_string()]).unwrap();
        let acceptor = material.acceptor().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let stream = acceptor.accept(stream).await.unwrap();
            let service = service_fn(|req: Request<Incoming>| async move {
                let body = format!("secure {}", req.uri());
                Ok::<_, hyper::Error>(Response::new(Full::new(Bytes::from(body))))
            });
            let _ = hyper::server::conn::http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await;
        });

        let client = BackendClient::new(PoolConfig::default()).unwrap();
        let response = client
            .send(get(&format!("https://127.0.0.1:{}/path?q=1", port)), &route("https", port))
            .await
            .unwrap();
        assert_eq!(response.status(), 200);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"secure /path?q=1");
        assert_eq!(client.stats().get_direct_requests(), 1);
        assert_eq!(client.stats().get_pooled_requests(), 0);
    }
}
