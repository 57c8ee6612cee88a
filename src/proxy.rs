use crate::error::{json_error_response, ProxyErrorCode};
use crate::pool::{ConnectionPool, PoolConfig};
use crate::routes::SharedRouteTable;
use http_body_util::combinators::BoxBody;
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderMap, HeaderValue};
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use hyper_util::server::graceful::GracefulShutdown;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
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

/// Default time to wait for in-flight connections after shutdown
const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// The reverse proxy listener, routing by Host header through the route table
pub struct ProxyServer {
    routes: SharedRouteTable,
    shutdown_rx: watch::Receiver<bool>,
    pool: Arc<ConnectionPool>,
    drain_timeout: Duration,
}

impl ProxyServer {
    pub fn new(
        routes: SharedRouteTable,
        shutdown_rx: watch::Receiver<bool>,
        pool_config: PoolConfig,
    ) -> Self {
        Self {
            routes,
            shutdown_rx,
            pool: Arc::new(ConnectionPool::new(pool_config)),
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }

    /// Set how long in-flight connections may run after shutdown
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Serve on an already bound listener until shutdown
    ///
    /// Once shutdown is signalled the listener is closed and open connections
    /// are given `drain_timeout` to finish their current requests.
    pub async fn serve(self, listener: TcpListener) -> std::io::Result<()> {
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "Proxy server listening");

        let mut shutdown_rx = self.shutdown_rx.clone();
        let builder = AutoBuilder::new(TokioExecutor::new());
        let graceful = GracefulShutdown::new();

        if !*shutdown_rx.borrow() {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, addr)) => {
                                let routes = Arc::clone(&self.routes);
                                let pool = Arc::clone(&self.pool);
                                let service = service_fn(move |req: Request<Incoming>| {
                                    let routes = Arc::clone(&routes);
                                    let pool = Arc::clone(&pool);
                                    async move { handle_request(req, routes, pool, addr).await }
                                });

                                let conn = builder.serve_connection_with_upgrades(TokioIo::new(stream), service);
                                let conn = graceful.watch(conn.into_owned());
                                tokio::spawn(async move {
                                    if let Err(e) = conn.await {
                                        debug!(addr = %addr, error = %e, "Connection error");
                                    }
                                });
                            }
                            Err(e) => {
                                error!(error = %e, "Failed to accept connection");
                            }
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        // A dropped sender counts as shutdown
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        }

        drop(listener);
        info!(addr = %local_addr, "Proxy server shutting down, draining connections");

        tokio::select! {
            _ = graceful.shutdown() => {
                debug!("All connections drained");
            }
            _ = tokio::time::sleep(self.drain_timeout) => {
                warn!(
                    timeout_secs = self.drain_timeout.as_secs(),
                    "Timed out waiting for connections to drain"
                );
            }
        }

        let stats = self.pool.stats();
        info!(
            addr = %local_addr,
            requests = stats.requests(),
            failures = stats.failures(),
            "Proxy server stopped"
        );
        Ok(())
    }
}

/// Route one request by its Host header
pub async fn handle_request(
    mut req: Request<Incoming>,
    routes: SharedRouteTable,
    pool: Arc<ConnectionPool>,
    client_addr: SocketAddr,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let hostname = match extract_hostname(req.headers()) {
        Some(h) => h,
        None => {
            return Ok(json_error_response(
                ProxyErrorCode::MissingHostHeader,
                "Missing or invalid Host header",
            ));
        }
    };

    debug!(hostname, method = %req.method(), uri = %req.uri(), client = %client_addr, "Request received");

    let target = match routes.lookup(&hostname) {
        Some(target) => target,
        None => {
            debug!(hostname, "Route not found");
            return Ok(json_error_response(
                ProxyErrorCode::UnknownHost,
                "Unknown or unconfigured host",
            ));
        }
    };

    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let headers = req.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
    set_forwarded_headers(headers, client_addr.ip());

    match pool.send_request(req, &target).await {
        Ok(response) => Ok(response),
        Err(e) => {
            error!(hostname, target = %target, request_id, error = %e, "Failed to forward request");
            Ok(json_error_response(
                ProxyErrorCode::ConnectionFailed,
                "Failed to connect to backend",
            ))
        }
    }
}

/// Routing key from the Host header: port stripped, lowercased
///
/// `None` only when the header is absent, not visible ASCII, or has no host
/// part. Any other value is a lookup key, so unmatched hosts get a 404.
fn extract_hostname(headers: &HeaderMap) -> Option<String> {
    let host = headers.get(hyper::header::HOST)?.to_str().ok()?.trim();

    let hostname = if let Some(rest) = host.strip_prefix('[') {
        // IPv6 literal, e.g. [::1]:8080
        rest.split(']').next()?
    } else {
        host.rsplit_once(':').map_or(host, |(name, _)| name)
    };

    let hostname = hostname.trim();
    if hostname.is_empty() {
        return None;
    }

    Some(hostname.to_ascii_lowercase())
}

/// Set the X-Forwarded-* headers for a request from `client_ip`
///
/// The client IP is appended to any existing X-Forwarded-For chain. The
/// protocol is always reported as `http`; TLS is terminated elsewhere if at all.
fn set_forwarded_headers(headers: &mut HeaderMap, client_ip: IpAddr) {
    let mut chain: Vec<String> = headers
        .get_all(X_FORWARDED_FOR)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect();
    chain.push(client_ip.to_string());

    if let Ok(value) = HeaderValue::from_str(&chain.join(", ")) {
        headers.insert(X_FORWARDED_FOR, value);
    }

    if let Some(host) = headers.get(hyper::header::HOST).cloned() {
        headers.insert(X_FORWARDED_HOST, host);
    }

    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host_headers(host: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(hyper::header::HOST, HeaderValue::from_str(host).unwrap());
        headers
    }

    #[test]
    fn test_extract_hostname_strips_port() {
        assert_eq!(
            extract_hostname(&host_headers("app.example.com:8080")),
            Some("app.example.com".to_string())
        );
        assert_eq!(
            extract_hostname(&host_headers("app.example.com")),
            Some("app.example.com".to_string())
        );
    }

    #[test]
    fn test_extract_hostname_lowercases() {
        assert_eq!(
            extract_hostname(&host_headers("App.Example.COM")),
            Some("app.example.com".to_string())
        );
    }

    #[test]
    fn test_extract_hostname_ipv6() {
        assert_eq!(extract_hostname(&host_headers("[::1]:8080")), Some("::1".to_string()));
    }

    #[test]
    fn test_extract_hostname_rejects_missing() {
        assert_eq!(extract_hostname(&HeaderMap::new()), None);
        assert_eq!(extract_hostname(&host_headers(":8080")), None);
        assert_eq!(extract_hostname(&host_headers("  ")), None);
    }

    #[test]
    fn test_extract_hostname_keeps_unusual_characters() {
        // Looked up as-is; an unmatched value becomes a 404, not a 400
        assert_eq!(extract_hostname(&host_headers("bad host")), Some("bad host".to_string()));
        assert_eq!(extract_hostname(&host_headers("App~1.Test:80")), Some("app~1.test".to_string()));
        let long = "a".repeat(300);
        assert_eq!(extract_hostname(&host_headers(&long)), Some(long));
    }

    #[test]
    fn test_forwarded_headers_new_chain() {
        let mut headers = host_headers("app.example.com:8080");
        set_forwarded_headers(&mut headers, "192.168.1.10".parse().unwrap());

        assert_eq!(headers.get(X_FORWARDED_FOR).unwrap(), "192.168.1.10");
        assert_eq!(headers.get(X_FORWARDED_HOST).unwrap(), "app.example.com:8080");
        assert_eq!(headers.get(X_FORWARDED_PROTO).unwrap(), "http");
    }

    #[test]
    fn test_forwarded_for_appends_to_chain() {
        let mut headers = host_headers("app.example.com");
        headers.append(X_FORWARDED_FOR, HeaderValue::from_static("10.0.0.1, 10.0.0.2"));
        headers.append(X_FORWARDED_FOR, HeaderValue::from_static("10.0.0.3"));
        headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("https"));

        set_forwarded_headers(&mut headers, "192.168.1.10".parse().unwrap());

        assert_eq!(
            headers.get(X_FORWARDED_FOR).unwrap(),
            "10.0.0.1, 10.0.0.2, 10.0.0.3, 192.168.1.10"
        );
        assert_eq!(headers.get_all(X_FORWARDED_FOR).iter().count(), 1);
        assert_eq!(headers.get(X_FORWARDED_PROTO).unwrap(), "http");
    }
}
