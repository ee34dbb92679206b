//! Error types and the diagnostic error page rendered by the proxy

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use thiserror::Error;

/// Subscription protocol violations returned by every broadcaster
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionError {
    #[error("already subscribed")]
    AlreadySubscribed,
    #[error("not subscribed")]
    NotSubscribed,
}

/// Routing table miss
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum LookupError {
    /// The table is empty
    #[error("no registered routes")]
    NoRegisteredRoutes,
    /// The table has entries, but none for the requested host
    #[error("no route found")]
    NoRouteFound,
}

/// Terminal result of a long-running watch loop
#[derive(Debug, Error)]
pub enum WatchError {
    #[error("watch cancelled")]
    Cancelled,
    #[error("failed to subscribe to the container source: {0}")]
    Subscription(#[from] SubscriptionError),
}

/// Error codes surfaced by the dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// Host header or authority missing or unparsable
    InvalidHost,
    /// Routing table is empty
    NoRegisteredRoutes,
    /// Routes exist but none match the host
    NoRouteFound,
    /// Forwarding to the backend failed
    ConnectionFailed,
    /// Backend did not answer in time
    RequestTimeout,
    /// Internal proxy error
    InternalError,
}

impl ProxyErrorCode {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::InvalidHost => StatusCode::BAD_REQUEST,
            ProxyErrorCode::NoRegisteredRoutes => StatusCode::UNPROCESSABLE_ENTITY,
            ProxyErrorCode::NoRouteFound => StatusCode::NOT_FOUND,
            ProxyErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::InvalidHost => "INVALID_HOST",
            ProxyErrorCode::NoRegisteredRoutes => "NO_REGISTERED_ROUTES",
            ProxyErrorCode::NoRouteFound => "NO_ROUTE_FOUND",
            ProxyErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ProxyErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ProxyErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl From<LookupError> for ProxyErrorCode {
    fn from(err: LookupError) -> Self {
        match err {
            LookupError::NoRegisteredRoutes => ProxyErrorCode::NoRegisteredRoutes,
            LookupError::NoRouteFound => ProxyErrorCode::NoRouteFound,
        }
    }
}

/// Everything an operator needs to debug a failed request
#[derive(Debug, Serialize)]
pub struct ErrorPage {
    /// The error code
    pub code: ProxyErrorCode,
    /// HTTP status code (for reference)
    pub status: u16,
    /// Human-readable error message
    pub message: String,
    /// The requested hostname, as the client sent it
    pub hostname: String,
    /// Version of the running proxy
    pub version: String,
    /// Every hostname currently known to the routing table, sorted
    pub registered_hosts: Vec<String>,
}

impl ErrorPage {
    pub fn new(
        code: ProxyErrorCode,
        message: impl Into<String>,
        hostname: impl Into<String>,
        version: impl Into<String>,
        mut registered_hosts: Vec<String>,
    ) -> Self {
        registered_hosts.sort();
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
            hostname: hostname.into(),
            version: version.into(),
            registered_hosts,
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }

    /// Render a self-contained HTML page
    pub fn to_html(&self) -> String {
        let hosts = if self.registered_hosts.is_empty() {
            "<p class=\"muted\">No hosts are registered. Add an <code>indocker.host</code> label to a container.</p>".to_string()
        } else {
            let items: String = self
                .registered_hosts
                .iter()
                .map(|h| format!("<li><code>{}</code></li>", escape_html(h)))
                .collect();
            format!("<ul>{}</ul>", items)
        };

        format!(
            r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>{status} {message}</title>
<style>
body {{ font-family: system-ui, sans-serif; background: #f5f6f8; color: #222; margin: 0; padding: 3rem 1rem; }}
main {{ max-width: 40rem; margin: 0 auto; background: #fff; border-radius: 8px; padding: 2rem; box-shadow: 0 1px 4px rgba(0,0,0,.08); }}
h1 {{ margin: 0 0 .5rem; font-size: 3rem; }}
.muted {{ color: #777; }}
footer {{ margin-top: 2rem; font-size: .8rem; color: #999; }}
</style>
</head>
<body>
<main>
<h1>{status}</h1>
<p><strong>{message}</strong></p>
<p>Requested host: <code>{hostname}</code></p>
<h2>Registered hosts</h2>
{hosts}
<footer>indocker {version}</footer>
</main>
</body>
</html>
"#,
            status = self.status,
            message = escape_html(&self.message),
            hostname = escape_html(&self.hostname),
            hosts = hosts,
            version = escape_html(&self.version),
        )
    }

    /// Build the HTTP response, as JSON or HTML
    pub fn into_response(self, as_json: bool) -> Response<BoxBody<Bytes, hyper::Error>> {
        let (content_type, body) = if as_json {
            ("application/json", self.to_json())
        } else {
            ("text/html; charset=utf-8", self.to_html())
        };

        Response::builder()
            .status(self.code.status_code())
            .header(hyper::header::CONTENT_TYPE, content_type)
            .header("X-Proxy-Error", self.code.as_header_value())
            .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
            .expect("valid response with StatusCode enum and static headers")
    }
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(code: ProxyErrorCode) -> ErrorPage {
        ErrorPage::new(
            code,
            "no route found",
            "typo.indocker.app",
            "1.2.3",
            vec!["zeta".to_string(), "alpha".to_string(), "mid".to_string()],
        )
    }

    #[test]
    fn test_error_code_status_codes() {
        assert_eq!(ProxyErrorCode::InvalidHost.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ProxyErrorCode::NoRegisteredRoutes.status_code(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(ProxyErrorCode::NoRouteFound.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            ProxyErrorCode::ConnectionFailed.status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ProxyErrorCode::RequestTimeout.status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
    }

    #[test]
    fn test_lookup_error_maps_to_code() {
        assert_eq!(
            ProxyErrorCode::from(LookupError::NoRegisteredRoutes),
            ProxyErrorCode::NoRegisteredRoutes
        );
        assert_eq!(
            ProxyErrorCode::from(LookupError::NoRouteFound),
            ProxyErrorCode::NoRouteFound
        );
    }

    #[test]
    fn test_subscription_error_messages() {
        assert_eq!(SubscriptionError::AlreadySubscribed.to_string(), "already subscribed");
        assert_eq!(SubscriptionError::NotSubscribed.to_string(), "not subscribed");
    }

    #[test]
    fn test_error_page_sorts_hosts() {
        let page = page(ProxyErrorCode::NoRouteFound);
        assert_eq!(page.registered_hosts, vec!["alpha", "mid", "zeta"]);
        assert_eq!(page.status, 404);
    }

    #[test]
    fn test_error_page_json() {
        let json = page(ProxyErrorCode::NoRouteFound).to_json();

        assert!(json.contains("\"code\":\"NO_ROUTE_FOUND\""));
        assert!(json.contains("\"status\":404"));
        assert!(json.contains("\"hostname\":\"typo.indocker.app\""));
        assert!(json.contains("\"version\":\"1.2.3\""));
        assert!(json.contains("\"registered_hosts\":[\"alpha\",\"mid\",\"zeta\"]"));
    }

    #[test]
    fn test_error_page_html_contains_diagnostics() {
        let html = page(ProxyErrorCode::NoRegisteredRoutes).to_html();

        assert!(html.contains("<h1>422</h1>"));
        assert!(html.contains("typo.indocker.app"));
        assert!(html.contains("1.2.3"));
        let alpha = html.find("<code>alpha</code>").unwrap();
        let zeta = html.find("<code>zeta</code>").unwrap();
        assert!(alpha < zeta);
    }

    #[test]
    fn test_error_page_html_escapes_input() {
        let html = ErrorPage::new(
            ProxyErrorCode::InvalidHost,
            "bad",
            "<script>alert(1)</script>",
            "dev",
            Vec::new(),
        )
        .to_html();

        assert!(!html.contains("<script>"));
        assert!(html.contains("&lt;script&gt;"));
    }

    #[test]
    fn test_into_response_headers() {
        let response = page(ProxyErrorCode::RequestTimeout).into_response(false);

        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "text/html; charset=utf-8"
        );
        assert_eq!(
            response.headers().get("X-Proxy-Error").unwrap(),
            "REQUEST_TIMEOUT"
        );

        let response = page(ProxyErrorCode::RequestTimeout).into_response(true);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "application/json"
        );
    }
}
