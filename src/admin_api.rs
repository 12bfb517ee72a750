//! Route and blacklist management HTTP API
//!
//! Endpoints:
//! - `GET /routes`, `GET /routes/{id}`, `GET /routes/reload`
//! - `POST /routes`, `PUT /routes`, `DELETE /routes/{id}`
//! - `POST /routes/broadcast-reload`
//! - `GET /blacklist`, `POST /blacklist`, `DELETE /blacklist/{ip}`, `PUT /blacklist/reload`
//! - `GET /health`

use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

use crate::blacklist::{BlacklistEntry, BlacklistRegistry};
use crate::error::GatewayError;
use crate::route::RouteDefinition;
use crate::route_manager::DynamicRouteManager;

// =============================================================================
// API RESPONSE
// =============================================================================

/// Standard API response format
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            message: "Success".to_string(),
            data: Some(data),
        }
    }

    pub fn success_message(message: &str) -> Self {
        Self {
            success: true,
            message: message.to_string(),
            data: None,
        }
    }
}

impl ApiResponse<()> {
    pub fn error(message: &str) -> Self {
        Self {
            success: false,
            message: message.to_string(),
            data: None,
        }
    }
}

// =============================================================================
// REQUEST/RESPONSE TYPES
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlacklistAddRequest {
    pub ip: String,
    /// Omit for a permanent entry
    pub ttl_secs: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct BlacklistView {
    #[serde(rename = "static")]
    pub static_ips: Vec<String>,
    pub dynamic: Vec<BlacklistEntry>,
}

#[derive(Debug, Serialize)]
pub struct CountResponse {
    pub count: usize,
}

// =============================================================================
// ADMIN API
// =============================================================================

pub struct AdminApi {
    manager: Arc<DynamicRouteManager>,
    blacklist: Arc<BlacklistRegistry>,
}

impl AdminApi {
    pub fn new(manager: Arc<DynamicRouteManager>, blacklist: Arc<BlacklistRegistry>) -> Self {
        Self { manager, blacklist }
    }

    /// Handle an incoming HTTP request
    pub async fn handle_request(&self, req: Request<Body>) -> Result<Response<Body>, Infallible> {
        let path = req.uri().path().to_string();
        let method = req.method().clone();

        debug!("Admin API request: {} {}", method, path);

        let response = match (method, path.as_str()) {
            (Method::GET, "/health") => self.handle_health(),

            // Routes
            (Method::GET, "/routes") => self.handle_list_routes(),
            (Method::GET, "/routes/reload") => self.handle_reload().await,
            (Method::POST, "/routes/broadcast-reload") => self.handle_broadcast_reload().await,
            (Method::POST, "/routes") => self.handle_add_route(req).await,
            (Method::PUT, "/routes") => self.handle_update_route(req).await,
            (Method::GET, p) if p.starts_with("/routes/") => {
                match extract_segment(p, "/routes/") {
                    Some(id) => self.handle_get_route(&id),
                    None => self.not_found(),
                }
            }
            (Method::DELETE, p) if p.starts_with("/routes/") => {
                match extract_segment(p, "/routes/") {
                    Some(id) => self.handle_delete_route(&id).await,
                    None => self.not_found(),
                }
            }

            // Blacklist
            (Method::GET, "/blacklist") => self.handle_list_blacklist(),
            (Method::POST, "/blacklist") => self.handle_add_blacklist(req).await,
            (Method::PUT, "/blacklist/reload") => self.handle_reload_blacklist().await,
            (Method::DELETE, p) if p.starts_with("/blacklist/") => {
                match extract_segment(p, "/blacklist/") {
                    Some(ip) => self.handle_remove_blacklist(&ip),
                    None => self.not_found(),
                }
            }

            _ => self.not_found(),
        };

        Ok(response)
    }

    fn handle_health(&self) -> Response<Body> {
        let response = serde_json::json!({
            "status": "healthy",
            "service": "aegis-gateway",
            "route_count": self.manager.table().len(),
        });
        json_response(StatusCode::OK, &response)
    }

    // =========================================================================
    // ROUTE HANDLERS
    // =========================================================================

    fn handle_list_routes(&self) -> Response<Body> {
        json_response(StatusCode::OK, &ApiResponse::success(self.manager.list_routes()))
    }

    fn handle_get_route(&self, id: &str) -> Response<Body> {
        match self.manager.get_route(id) {
            Ok(route) => json_response(StatusCode::OK, &ApiResponse::success(route)),
            Err(e) => error_response(&e),
        }
    }

    async fn handle_reload(&self) -> Response<Body> {
        match self.manager.reload().await {
            Ok(count) => json_response(StatusCode::OK, &ApiResponse::success(CountResponse { count })),
            Err(e) => error_response(&e),
        }
    }

    async fn handle_broadcast_reload(&self) -> Response<Body> {
        match self.manager.broadcast_reload().await {
            Ok(()) => json_response(
                StatusCode::ACCEPTED,
                &ApiResponse::<()>::success_message("Reload broadcast"),
            ),
            Err(e) => error_response(&e),
        }
    }

    async fn handle_add_route(&self, req: Request<Body>) -> Response<Body> {
        let definition = match parse_body::<RouteDefinition>(req).await {
            Ok(d) => d,
            Err(e) => return json_error(StatusCode::BAD_REQUEST, &e),
        };

        match self.manager.add_route(definition).await {
            Ok(stored) => json_response(StatusCode::CREATED, &ApiResponse::success(stored)),
            Err(e) => error_response(&e),
        }
    }

    async fn handle_update_route(&self, req: Request<Body>) -> Response<Body> {
        let definition = match parse_body::<RouteDefinition>(req).await {
            Ok(d) => d,
            Err(e) => return json_error(StatusCode::BAD_REQUEST, &e),
        };

        match self.manager.update_route(definition).await {
            Ok(updated) => json_response(StatusCode::OK, &ApiResponse::success(updated)),
            Err(e) => error_response(&e),
        }
    }

    async fn handle_delete_route(&self, id: &str) -> Response<Body> {
        match self.manager.delete_route(id).await {
            Ok(()) => json_response(
                StatusCode::OK,
                &ApiResponse::<()>::success_message("Route deleted"),
            ),
            Err(e) => error_response(&e),
        }
    }

    // =========================================================================
    // BLACKLIST HANDLERS
    // =========================================================================

    fn handle_list_blacklist(&self) -> Response<Body> {
        let view = BlacklistView {
            static_ips: self.blacklist.static_entries(),
            dynamic: self.blacklist.entries(),
        };
        json_response(StatusCode::OK, &ApiResponse::success(view))
    }

    async fn handle_add_blacklist(&self, req: Request<Body>) -> Response<Body> {
        let body = match parse_body::<BlacklistAddRequest>(req).await {
            Ok(b) => b,
            Err(e) => return json_error(StatusCode::BAD_REQUEST, &e),
        };

        let result = match body.ttl_secs {
            Some(0) => return json_error(StatusCode::BAD_REQUEST, "ttlSecs must be positive"),
            Some(secs) => self.blacklist.add_for(&body.ip, Duration::from_secs(secs)),
            None => self.blacklist.add(&body.ip, 0),
        };

        match result {
            Ok(()) => json_response(
                StatusCode::CREATED,
                &ApiResponse::<()>::success_message("IP blacklisted"),
            ),
            Err(e) => json_error(StatusCode::BAD_REQUEST, &e.to_string()),
        }
    }

    fn handle_remove_blacklist(&self, ip: &str) -> Response<Body> {
        if self.blacklist.remove(ip) {
            json_response(
                StatusCode::OK,
                &ApiResponse::<()>::success_message("IP removed from blacklist"),
            )
        } else {
            json_error(StatusCode::NOT_FOUND, "IP not in dynamic blacklist")
        }
    }

    async fn handle_reload_blacklist(&self) -> Response<Body> {
        match self.blacklist.reload_static().await {
            Ok(count) => json_response(StatusCode::OK, &ApiResponse::success(CountResponse { count })),
            Err(e) => {
                error!("Static blacklist reload failed: {:#}", e);
                json_error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to reload static blacklist")
            }
        }
    }

    fn not_found(&self) -> Response<Body> {
        json_error(StatusCode::NOT_FOUND, "Endpoint not found")
    }

    /// Run the API server
    pub async fn run(self: Arc<Self>, addr: SocketAddr) -> anyhow::Result<()> {
        let api = self;
        let make_svc = make_service_fn(move |_conn| {
            let api = Arc::clone(&api);
            async move {
                Ok::<_, Infallible>(service_fn(move |req| {
                    let api = Arc::clone(&api);
                    async move { api.handle_request(req).await }
                }))
            }
        });

        let server = Server::try_bind(&addr)?.serve(make_svc);
        info!("Admin API listening on http://{}", addr);

        if let Err(e) = server.await {
            error!("Admin API server error: {}", e);
        }
        Ok(())
    }
}

// =============================================================================
// HELPER FUNCTIONS
// =============================================================================

/// HTTP status for a manager error
pub fn status_for(err: &GatewayError) -> StatusCode {
    match err {
        GatewayError::DuplicateRouteId(_) => StatusCode::CONFLICT,
        GatewayError::RouteNotFound(_) => StatusCode::NOT_FOUND,
        GatewayError::NoRoutesDefined => StatusCode::UNPROCESSABLE_ENTITY,
        GatewayError::InvalidRoute(_) | GatewayError::InvalidLockArgument(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: &GatewayError) -> Response<Body> {
    let status = status_for(err);
    if status.is_server_error() {
        error!("Admin operation failed: {}", err);
    }
    json_error(status, &err.to_string())
}

/// Parse JSON body from request
async fn parse_body<T: for<'de> Deserialize<'de>>(req: Request<Body>) -> Result<T, String> {
    let bytes = hyper::body::to_bytes(req.into_body())
        .await
        .map_err(|e| format!("Failed to read body: {}", e))?;

    serde_json::from_slice(&bytes).map_err(|e| format!("Invalid JSON: {}", e))
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Body> {
    let json = serde_json::to_string(body).unwrap_or_else(|_| "{}".to_string());
    let mut response = Response::new(Body::from(json));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

fn json_error(status: StatusCode, message: &str) -> Response<Body> {
    json_response(status, &ApiResponse::<()>::error(message))
}

/// "/routes/svc-a" with prefix "/routes/" -> "svc-a"
fn extract_segment(path: &str, prefix: &str) -> Option<String> {
    path.strip_prefix(prefix)
        .and_then(|rest| rest.split('/').next())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}
