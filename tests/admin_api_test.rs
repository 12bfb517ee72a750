/// Integration tests for the admin HTTP API
///
/// Requests go straight to `AdminApi::handle_request`; no socket is bound.
use std::sync::Arc;
use std::time::Duration;

use aegis_gateway::admin_api::AdminApi;
use aegis_gateway::blacklist::{BlacklistRegistry, FileBlacklist};
use aegis_gateway::route_bus::{LocalRouteBus, RouteEventBus};
use aegis_gateway::route_manager::DynamicRouteManager;
use aegis_gateway::route_store::SqliteRouteStore;
use hyper::{Body, Method, Request, StatusCode};
use serde_json::{json, Value};
use tempfile::tempdir;

struct Harness {
    api: AdminApi,
    manager: Arc<DynamicRouteManager>,
}

async fn harness(blacklist: BlacklistRegistry) -> Harness {
    let bus = Arc::new(LocalRouteBus::new());
    let store = Arc::new(SqliteRouteStore::open_in_memory().unwrap());
    let manager = Arc::new(DynamicRouteManager::new(store, bus.clone()));
    manager.spawn_sync(bus.subscribe().await.unwrap());
    Harness {
        api: AdminApi::new(manager.clone(), Arc::new(blacklist)),
        manager,
    }
}

async fn call(api: &AdminApi, method: Method, path: &str, body: Option<Value>) -> (StatusCode, Value) {
    let body = body.map(|b| Body::from(b.to_string())).unwrap_or_else(Body::empty);
    let req = Request::builder().method(method).uri(path).body(body).unwrap();
    let resp = api.handle_request(req).await.unwrap();
    let status = resp.status();
    let bytes = hyper::body::to_bytes(resp.into_body()).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

async fn wait_for_route(manager: &DynamicRouteManager, id: &str) {
    for _ in 0..200 {
        if manager.get_route(id).is_ok() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("route {} never applied", id);
}

fn svc_a() -> Value {
    json!({
        "id": "svc-a",
        "uri": "lb://svc-a",
        "predicates": ["Path=/svc-a/**"],
        "filters": [{"name": "StripPrefix", "args": {"parts": "1"}}],
        "order": 1
    })
}

#[tokio::test]
async fn test_route_lifecycle() {
    let h = harness(BlacklistRegistry::empty()).await;

    let (status, body) = call(&h.api, Method::POST, "/routes", Some(svc_a())).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["version"], 0);
    assert_eq!(body["data"]["predicates"][0]["args"]["_genkey_0"], "/svc-a/**");
    wait_for_route(&h.manager, "svc-a").await;

    let (status, body) = call(&h.api, Method::GET, "/routes/svc-a", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["uri"], "lb://svc-a");

    let (status, body) = call(&h.api, Method::POST, "/routes", Some(svc_a())).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["success"], false);

    let mut update = svc_a();
    update["uri"] = json!("http://10.0.0.8:8080");
    update["version"] = json!(0);
    let (status, body) = call(&h.api, Method::PUT, "/routes", Some(update.clone())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["version"], 1);

    // Same stale version again
    let (status, _) = call(&h.api, Method::PUT, "/routes", Some(update)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = call(&h.api, Method::GET, "/routes/reload", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["count"], 1);

    let (status, _) = call(&h.api, Method::DELETE, "/routes/svc-a", None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = call(&h.api, Method::DELETE, "/routes/svc-a", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = call(&h.api, Method::GET, "/routes/reload", None).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn test_bad_route_payloads() {
    let h = harness(BlacklistRegistry::empty()).await;

    let (status, _) = call(&h.api, Method::POST, "/routes", Some(json!({"id": "x"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = call(
        &h.api,
        Method::POST,
        "/routes",
        Some(json!({"id": "x", "uri": "no-scheme"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = call(&h.api, Method::GET, "/routes/ghost", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = call(&h.api, Method::PATCH, "/routes", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_blacklist_endpoints() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("static.txt");
    std::fs::write(&path, "203.0.113.1").unwrap();
    let h = harness(BlacklistRegistry::new(
        Arc::new(FileBlacklist::new(&path)),
        Duration::from_secs(3600),
    ))
    .await;

    let (status, body) = call(&h.api, Method::PUT, "/blacklist/reload", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["count"], 1);

    std::fs::write(&path, "203.0.113.1, 203.0.113.2").unwrap();
    let (_, body) = call(&h.api, Method::PUT, "/blacklist/reload", None).await;
    assert_eq!(body["data"]["count"], 2);

    let (status, _) = call(
        &h.api,
        Method::POST,
        "/blacklist",
        Some(json!({"ip": "198.51.100.7", "ttlSecs": 600})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let (status, _) = call(&h.api, Method::POST, "/blacklist", Some(json!({"ip": "nope"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (_, body) = call(&h.api, Method::GET, "/blacklist", None).await;
    assert_eq!(body["data"]["static"], json!(["203.0.113.1", "203.0.113.2"]));
    assert_eq!(body["data"]["dynamic"][0]["ip"], "198.51.100.7");

    let (status, _) = call(&h.api, Method::DELETE, "/blacklist/198.51.100.7", None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = call(&h.api, Method::DELETE, "/blacklist/198.51.100.7", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_health_and_broadcast_reload() {
    let h = harness(BlacklistRegistry::empty()).await;

    let (status, body) = call(&h.api, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");

    let (status, _) = call(&h.api, Method::POST, "/routes/broadcast-reload", None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
}
