//! Reverse proxy: the per-request [`Dispatcher`] and the [`ProxyServer`]
//! listener that feeds it.
//!
//! Every request is either forwarded to exactly one backend or answered with
//! a diagnostic [`ErrorPage`].

use crate::error::{ErrorPage, ProxyErrorCode};
use crate::loadbalancer::BackendSelector;
use crate::pool::{BackendClient, ProxyBody};
use crate::routing::{Route, RouteResolver};
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Bytes, Incoming};
use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use hyper::http::uri::Authority;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode, Uri, Version};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
/// Backend that served the response
pub const X_DOWNSTREAM_URL: &str = "x-indocker-downstream-url";

/// Connection-scoped headers that never cross the proxy
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
];

/// Maximum hostname length (RFC 1035)
const MAX_HOSTNAME_LEN: usize = 253;

/// Resolves, selects and forwards one request at a time
pub struct Dispatcher {
    resolver: Arc<dyn RouteResolver>,
    selector: Arc<dyn BackendSelector>,
    client: BackendClient,
    version: String,
    request_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        resolver: Arc<dyn RouteResolver>,
        selector: Arc<dyn BackendSelector>,
        client: BackendClient,
        version: impl Into<String>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            resolver,
            selector,
            client,
            version: version.into(),
            request_timeout,
        }
    }

    pub fn client(&self) -> &BackendClient {
        &self.client
    }

    /// Answer one request. Never fails: errors become diagnostic pages.
    pub async fn handle<B>(&self, mut req: Request<B>, client_addr: SocketAddr, is_tls: bool) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes, Error = hyper::Error> + Send + Sync + 'static,
    {
        let as_json = prefers_json(req.headers());

        // Generate or propagate request ID
        let request_id = req
            .headers()
            .get(X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(String::from)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let raw_host = request_authority(&req).unwrap_or_default();
        let hostname = match extract_hostname(&raw_host) {
            Some(h) => h,
            None => {
                debug!(host = %raw_host.escape_debug(), request_id, "Rejected request with invalid host");
                return self.error_page(ProxyErrorCode::InvalidHost, "invalid host", &raw_host, as_json);
            }
        };

        debug!(hostname, method = %req.method(), uri = %req.uri(), request_id, "Incoming request");

        let backends = match self.resolver.lookup_by_hostname(&hostname) {
            Ok(backends) => backends,
            Err(e) => {
                debug!(hostname, error = %e, "No backend for host");
                return self.error_page(e.into(), e.to_string(), &hostname, as_json);
            }
        };

        let Some((container_id, route)) = self.selector.select(&hostname, &backends) else {
            error!(hostname, "Backend selection returned nothing for a non-empty set");
            return self.error_page(ProxyErrorCode::InternalError, "no backend selected", &hostname, as_json);
        };

        let upgrade = is_upgrade_request(req.headers());
        let client_upgrade = upgrade.then(|| hyper::upgrade::on(&mut req));

        let backend_req = match build_backend_request(req, &route, &raw_host, client_addr, is_tls, &request_id, upgrade) {
            Ok(r) => r,
            Err(e) => {
                error!(hostname, error = %e, "Failed to build backend request");
                return self.error_page(ProxyErrorCode::InternalError, "failed to build backend request", &hostname, as_json);
            }
        };

        let send = async {
            if upgrade {
                self.client.send_upgrade(backend_req, &route).await
            } else {
                self.client.send(backend_req, &route).await
            }
        };

        let mut response = match tokio::time::timeout(self.request_timeout, send).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                error!(hostname, container = %container_id, backend = %route, error = %e, "Failed to forward request");
                return self.error_page(ProxyErrorCode::ConnectionFailed, "failed to connect to backend", &hostname, as_json);
            }
            Err(_) => {
                warn!(
                    hostname,
                    backend = %route,
                    timeout_secs = self.request_timeout.as_secs(),
                    "Request timed out"
                );
                return self.error_page(
                    ProxyErrorCode::RequestTimeout,
                    format!("request timed out after {} seconds", self.request_timeout.as_secs()),
                    &hostname,
                    as_json,
                );
            }
        };

        if let Some(client_upgrade) = client_upgrade {
            if response.status() == StatusCode::SWITCHING_PROTOCOLS {
                let backend_upgrade = hyper::upgrade::on(&mut response);
                let backend = route.url();
                info!(hostname, request_id, backend, "Upgrade accepted by backend");

                tokio::spawn(async move {
                    match tokio::try_join!(client_upgrade, backend_upgrade) {
                        Ok((client, backend_conn)) => {
                            forward_bidirectional(client, backend_conn, &hostname, &request_id).await;
                        }
                        Err(e) => {
                            debug!(hostname, request_id, error = %e, "Upgrade failed");
                        }
                    }
                });
            } else {
                debug!(hostname, status = %response.status(), "Backend declined upgrade");
            }
        }

        let (mut parts, body) = response.into_parts();
        if parts.status != StatusCode::SWITCHING_PROTOCOLS {
            strip_hop_by_hop(&mut parts.headers);
        }
        if let Ok(value) = HeaderValue::from_str(&route.url()) {
            parts.headers.insert(X_DOWNSTREAM_URL, value);
        }

        Response::from_parts(parts, body.boxed())
    }

    fn error_page(
        &self,
        code: ProxyErrorCode,
        message: impl Into<String>,
        hostname: &str,
        as_json: bool,
    ) -> Response<ProxyBody> {
        ErrorPage::new(code, message, hostname, &self.version, self.resolver.hostnames()).into_response(as_json)
    }
}

/// Authority from the request target (HTTP/2, absolute-form) or the Host header
fn request_authority<B>(req: &Request<B>) -> Option<String> {
    req.uri()
        .authority()
        .map(|a| a.as_str().to_string())
        .or_else(|| {
            req.headers()
                .get(hyper::header::HOST)
                .map(|h| String::from_utf8_lossy(h.as_bytes()).into_owned())
        })
}

/// Host part of an authority, lower-cased, without the port
fn extract_hostname(raw: &str) -> Option<String> {
    let authority: Authority = raw.trim().parse().ok()?;
    let hostname = authority.host();

    if hostname.is_empty() || hostname.len() > MAX_HOSTNAME_LEN {
        return None;
    }

    // Alphanumeric, hyphen, underscore and dot only
    if !hostname
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return None;
    }

    Some(hostname.to_lowercase())
}

/// Whether the Accept header ranks JSON above HTML
fn prefers_json(headers: &HeaderMap) -> bool {
    let Some(accept) = headers.get(hyper::header::ACCEPT).and_then(|v| v.to_str().ok()) else {
        return false;
    };

    let mut json = 0.0f32;
    let mut html = 0.0f32;

    for entry in accept.split(',') {
        let mut params = entry.split(';');
        let media = params.next().unwrap_or("").trim().to_ascii_lowercase();
        let q = params
            .filter_map(|p| p.trim().strip_prefix("q="))
            .find_map(|q| q.trim().parse::<f32>().ok())
            .unwrap_or(1.0);

        match media.as_str() {
            "application/json" | "application/*" => json = json.max(q),
            "text/html" | "text/*" | "*/*" => html = html.max(q),
            _ => {}
        }
    }

    json > html
}

/// Check if a request asks for a protocol upgrade
fn is_upgrade_request(headers: &HeaderMap) -> bool {
    let has_upgrade_connection = headers
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);

    has_upgrade_connection && headers.contains_key(hyper::header::UPGRADE)
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
    headers.remove(hyper::header::UPGRADE);
}

/// Rewrite the client request for `route`.
///
/// Method, path, query, body and end-to-end headers are preserved. The
/// forwarding headers are overwritten rather than appended: this proxy is the
/// first trusted hop.
fn build_backend_request<B>(
    req: Request<B>,
    route: &Route,
    original_host: &str,
    client_addr: SocketAddr,
    is_tls: bool,
    request_id: &str,
    upgrade: bool,
) -> Result<Request<ProxyBody>, hyper::http::Error>
where
    B: Body<Data = Bytes, Error = hyper::Error> + Send + Sync + 'static,
{
    let (mut parts, body) = req.into_parts();

    let path = parts.uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    parts.uri = format!("{}{}", route.url(), path).parse::<Uri>()?;
    parts.version = Version::HTTP_11;

    let headers = &mut parts.headers;
    if !upgrade {
        strip_hop_by_hop(headers);
    }

    headers.insert(hyper::header::HOST, HeaderValue::from_str(&route.authority())?);

    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    if let Ok(value) = HeaderValue::from_str(original_host) {
        headers.insert(X_FORWARDED_HOST, value);
    }
    let proto = if is_tls { "https" } else { "http" };
    headers.insert(HeaderName::from_static(X_FORWARDED_PROTO), HeaderValue::from_static(proto));

    Ok(Request::from_parts(parts, body.boxed()))
}

/// Forward bytes between client and backend until either side closes
async fn forward_bidirectional(
    client: hyper::upgrade::Upgraded,
    backend: hyper::upgrade::Upgraded,
    hostname: &str,
    request_id: &str,
) {
    let mut client_io = TokioIo::new(client);
    let mut backend_io = TokioIo::new(backend);

    match tokio::io::copy_bidirectional(&mut client_io, &mut backend_io).await {
        Ok((client_to_backend, backend_to_client)) => {
            debug!(
                hostname,
                request_id,
                client_to_backend,
                backend_to_client,
                "Upgraded connection closed normally"
            );
        }
        Err(e) => {
            debug!(hostname, request_id, error = %e, "Upgraded connection closed with error");
        }
    }
}

/// Build an HTTPS redirect response (301 Moved Permanently)
fn build_https_redirect<B>(req: &Request<B>, https_port: u16) -> Response<ProxyBody> {
    let authority = request_authority(req).unwrap_or_default();
    let host = extract_hostname(&authority).unwrap_or_else(|| "localhost".to_string());

    let path = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");

    let location = if https_port == 443 {
        format!("https://{}{}", host, path)
    } else {
        format!("https://{}:{}{}", host, https_port, path)
    };

    Response::builder()
        .status(StatusCode::MOVED_PERMANENTLY)
        .header(hyper::header::LOCATION, location)
        .header(hyper::header::CONTENT_TYPE, "text/plain")
        .body(
            Full::new(Bytes::from("Redirecting to HTTPS"))
                .map_err(|never| match never {})
                .boxed(),
        )
        .expect("valid response builder")
}

/// Accept loop serving one address, plain or TLS
pub struct ProxyServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    tls_acceptor: Option<TlsAcceptor>,
    /// If set, redirect all plain HTTP requests to this HTTPS port
    https_redirect_port: Option<u16>,
}

impl ProxyServer {
    pub async fn bind(addr: SocketAddr, dispatcher: Arc<Dispatcher>) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        Ok(Self {
            listener,
            local_addr,
            dispatcher,
            tls_acceptor: None,
            https_redirect_port: None,
        })
    }

    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls_acceptor = Some(acceptor);
        self
    }

    /// Redirect every plain HTTP request to HTTPS on `port`
    pub fn with_https_redirect(mut self, port: u16) -> Self {
        self.https_redirect_port = Some(port);
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls_acceptor.is_some()
    }

    /// Serve until `ctx` is cancelled
    pub async fn run(self, ctx: CancellationToken) -> anyhow::Result<()> {
        let protocol = if self.tls_enabled() { "HTTPS" } else { "HTTP" };
        info!(addr = %self.local_addr, protocol, "Proxy server listening (HTTP/1.1 and HTTP/2)");

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let dispatcher = Arc::clone(&self.dispatcher);
                            let tls_acceptor = self.tls_acceptor.clone();
                            let https_redirect_port = self.https_redirect_port;

                            tokio::spawn(async move {
                                if let Some(acceptor) = tls_acceptor {
                                    match acceptor.accept(stream).await {
                                        Ok(tls_stream) => {
                                            if let Err(e) = handle_connection(tls_stream, addr, dispatcher, true, None).await {
                                                debug!(addr = %addr, error = %e, "TLS connection error");
                                            }
                                        }
                                        Err(e) => {
                                            debug!(addr = %addr, error = %e, "TLS handshake failed");
                                        }
                                    }
                                } else if let Err(e) = handle_connection(stream, addr, dispatcher, false, https_redirect_port).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = ctx.cancelled() => {
                    info!(addr = %self.local_addr, protocol, "Proxy server shutting down");
                    break;
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(
    stream: S,
    addr: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    is_tls: bool,
    https_redirect_port: Option<u16>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let dispatcher = Arc::clone(&dispatcher);
        async move {
            if let Some(port) = https_redirect_port {
                return Ok::<_, hyper::Error>(build_https_redirect(&req, port));
            }
            Ok(dispatcher.handle(req, addr, is_tls).await)
        }
    });

    // HTTP/1.1 connections can still use upgrades
    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}
