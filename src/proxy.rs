use hyper::client::HttpConnector;
use hyper::header::{HeaderName, HeaderValue, CONTENT_TYPE, HOST};
use hyper::server::conn::AddrStream;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Client, Request, Response, Server, StatusCode, Uri};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::auth_filter::{EdgeAuthFilter, FilterOutcome, RequestContext};
use crate::route::{RouteDefinition, RouteTable};
use crate::snowflake::SnowflakeIdGenerator;

/// Maximum length for header values
pub const MAX_HEADER_VALUE_LENGTH: usize = 8192;

pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const ROUTE_HEADER: &str = "x-gateway-route";
/// Logical destination handed to the upstream engine for non-HTTP route uris
pub const TARGET_HEADER: &str = "x-gateway-target";

/// Sanitize a header value to prevent header injection
///
/// - Removes CR (\\r) and LF (\\n) characters that could split headers
/// - Removes null bytes (\\0) that could cause truncation
/// - Truncates excessively long values
///
/// # Examples
/// ```
/// use aegis_gateway::proxy::sanitize_header_value;
///
/// assert_eq!(sanitize_header_value("text/html"), "text/html");
/// assert_eq!(sanitize_header_value("value\r\nX-Injected: evil"), "valueX-Injected: evil");
/// ```
pub fn sanitize_header_value(value: &str) -> String {
    let sanitized: String = value
        .chars()
        .filter(|c| *c != '\r' && *c != '\n' && *c != '\0')
        .take(MAX_HEADER_VALUE_LENGTH)
        .collect();

    if sanitized.len() != value.len() {
        warn!(
            "Header value sanitized (removed {} chars, original len: {})",
            value.len() - sanitized.len(),
            value.len()
        );
    }

    sanitized
}

/// Where a request for `route` should be sent. `http://` route uris are
/// dialed directly; every other scheme (`lb://`, `https://`) goes to the
/// upstream engine, which owns service discovery and TLS origination.
pub fn resolve_target(route: &RouteDefinition, upstream: &str, path_and_query: &str) -> Option<Uri> {
    let base = if route.uri.starts_with("http://") {
        route.uri.as_str()
    } else {
        upstream
    };
    format!("{}{}", base.trim_end_matches('/'), path_and_query)
        .parse()
        .ok()
}

/// Route-table aware forwarding stage behind the edge filter
pub struct GatewayProxy {
    filter: Arc<EdgeAuthFilter>,
    routes: watch::Receiver<Arc<RouteTable>>,
    ids: Arc<SnowflakeIdGenerator>,
    upstream: String,
    client: Client<HttpConnector>,
}

impl GatewayProxy {
    pub fn new(
        filter: Arc<EdgeAuthFilter>,
        routes: watch::Receiver<Arc<RouteTable>>,
        ids: Arc<SnowflakeIdGenerator>,
        upstream: impl Into<String>,
    ) -> Self {
        Self {
            filter,
            routes,
            ids,
            upstream: upstream.into(),
            client: Client::new(),
        }
    }

    pub async fn handle(&self, req: Request<Body>, remote_addr: SocketAddr) -> Response<Body> {
        let start_time = Instant::now();
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        let req = match self.filter.filter(req, remote_addr).await {
            FilterOutcome::Forward(req) => req,
            FilterOutcome::Deny(response) => {
                info!(
                    "{} {} {} {}ms [denied]",
                    method,
                    path,
                    response.status().as_u16(),
                    start_time.elapsed().as_millis()
                );
                return response;
            }
        };
        let client_ip = req
            .extensions()
            .get::<RequestContext>()
            .map(|ctx| ctx.client_ip.clone())
            .unwrap_or_default();

        let table = Arc::clone(&self.routes.borrow());
        let Some(route) = table.find_for_path(&path) else {
            info!(
                "{} {} 404 {}ms ip={} [no_route]",
                method,
                path,
                start_time.elapsed().as_millis(),
                client_ip
            );
            return plain_response(StatusCode::NOT_FOUND, "404 Not Found - No matching route");
        };

        let request_id = match self.ids.next_id() {
            Ok(id) => id,
            Err(e) => {
                error!("Cannot stamp request id: {}", e);
                return plain_response(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "503 Service Unavailable - Request id source halted",
                );
            }
        };

        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| path.clone());
        let Some(target) = resolve_target(route, &self.upstream, &path_and_query) else {
            warn!("Route {} yields an invalid target uri ({})", route.id, route.uri);
            return plain_response(StatusCode::BAD_GATEWAY, "502 Bad Gateway - Invalid route target");
        };

        let direct = route.uri.starts_with("http://");
        let (mut parts, body) = req.into_parts();
        parts.uri = target;
        if direct {
            parts.headers.remove(HOST);
        } else {
            insert_header(&mut parts.headers, TARGET_HEADER, &route.uri);
        }
        insert_header(&mut parts.headers, REQUEST_ID_HEADER, &request_id.to_string());
        insert_header(&mut parts.headers, ROUTE_HEADER, &route.id);

        match self.client.request(Request::from_parts(parts, body)).await {
            Ok(response) => {
                info!(
                    "{} {} {} {}ms route={} ip={} id={}",
                    method,
                    path,
                    response.status().as_u16(),
                    start_time.elapsed().as_millis(),
                    route.id,
                    client_ip,
                    request_id
                );
                response
            }
            Err(e) => {
                error!("Upstream error for route {}: {}", route.id, e);
                info!(
                    "{} {} 502 {}ms route={} ip={} id={} [upstream_error]",
                    method,
                    path,
                    start_time.elapsed().as_millis(),
                    route.id,
                    client_ip,
                    request_id
                );
                plain_response(StatusCode::BAD_GATEWAY, "502 Bad Gateway - Upstream Error")
            }
        }
    }
}

fn insert_header(headers: &mut hyper::HeaderMap, name: &'static str, value: &str) {
    match HeaderValue::from_str(&sanitize_header_value(value)) {
        Ok(value) => {
            headers.insert(HeaderName::from_static(name), value);
        }
        Err(e) => warn!("Skipping header {}: {}", name, e),
    }
}

fn plain_response(status: StatusCode, message: &'static str) -> Response<Body> {
    let mut response = Response::new(Body::from(message));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
}

/// Serve the gateway listener
///
/// The TCP peer address is handed to the edge filter as the last-resort
/// client address.
pub async fn run_gateway(addr: SocketAddr, proxy: Arc<GatewayProxy>) -> anyhow::Result<()> {
    info!("Starting gateway listener on {}", addr);

    let make_svc = make_service_fn(move |conn: &AddrStream| {
        let proxy = Arc::clone(&proxy);
        let remote_addr = conn.remote_addr();

        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let proxy = Arc::clone(&proxy);
                async move { Ok::<_, Infallible>(proxy.handle(req, remote_addr).await) }
            }))
        }
    });

    let server = Server::try_bind(&addr)?.serve(make_svc);

    info!("Gateway listening on http://{}", addr);

    if let Err(e) = server.await {
        error!("Gateway server error: {}", e);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_strips_injection() {
        assert_eq!(sanitize_header_value("a\r\nb\0c"), "abc");
        let long = "x".repeat(MAX_HEADER_VALUE_LENGTH + 10);
        assert_eq!(sanitize_header_value(&long).len(), MAX_HEADER_VALUE_LENGTH);
    }

    #[test]
    fn test_resolve_target() {
        let direct = RouteDefinition::new("a", "http://10.0.0.5:8080/");
        assert_eq!(
            resolve_target(&direct, "http://engine:9000", "/a/x?q=1").unwrap(),
            "http://10.0.0.5:8080/a/x?q=1"
        );

        let balanced = RouteDefinition::new("b", "lb://svc-b");
        assert_eq!(
            resolve_target(&balanced, "http://engine:9000/", "/b").unwrap(),
            "http://engine:9000/b"
        );

        let tls = RouteDefinition::new("c", "https://secure.example");
        assert_eq!(
            resolve_target(&tls, "http://engine:9000", "/c").unwrap(),
            "http://engine:9000/c"
        );
    }
}
