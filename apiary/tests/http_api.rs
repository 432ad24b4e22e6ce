//! Control-plane HTTP tests driven through the router with in-memory
//! backends behind it.

use std::sync::Arc;
use std::time::Duration;

use apiary::api::{self, AppState};
use apiary::handler::JsonLogHandler;
use apiary::manager::{TenantManager, TenantManagerConfig};
use apiary_testkit::{InMemoryBroker, InMemoryStore};
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

fn build_router() -> Router {
    let broker = InMemoryBroker::new();
    let store = InMemoryStore::new();
    let manager = Arc::new(TenantManager::new(
        Arc::new(store.clone()),
        Arc::new(broker),
        Arc::new(JsonLogHandler),
        TenantManagerConfig {
            default_workers: 3,
            shutdown_timeout: Duration::from_secs(5),
        },
    ));
    api::router(AppState {
        manager,
        store: Arc::new(store),
    })
}

fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn empty_request(method: &str, uri: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn tenant_lifecycle_over_http() {
    let app = build_router();

    let created = app
        .clone()
        .oneshot(json_request("POST", "/api/v1/tenants", json!({"name": "Acme"})))
        .await
        .unwrap();
    assert_eq!(created.status(), StatusCode::CREATED);
    let tenant = json_body(created).await;
    let id = tenant["id"].as_str().expect("tenant id").to_string();
    assert_eq!(tenant["name"], "Acme");

    let fetched = app
        .clone()
        .oneshot(empty_request("GET", &format!("/api/v1/tenants/{id}")))
        .await
        .unwrap();
    assert_eq!(fetched.status(), StatusCode::OK);

    let listed = app
        .clone()
        .oneshot(empty_request("GET", "/api/v1/tenants"))
        .await
        .unwrap();
    assert_eq!(listed.status(), StatusCode::OK);
    assert_eq!(json_body(listed).await.as_array().unwrap().len(), 1);

    let retuned = app
        .clone()
        .oneshot(json_request(
            "PUT",
            &format!("/api/v1/tenants/{id}/config/concurrency"),
            json!({"workers": 5}),
        ))
        .await
        .unwrap();
    assert_eq!(retuned.status(), StatusCode::OK);

    let deleted = app
        .clone()
        .oneshot(empty_request("DELETE", &format!("/api/v1/tenants/{id}")))
        .await
        .unwrap();
    assert_eq!(deleted.status(), StatusCode::OK);

    let gone = app
        .clone()
        .oneshot(empty_request("GET", &format!("/api/v1/tenants/{id}")))
        .await
        .unwrap();
    assert_eq!(gone.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn invalid_concurrency_values_are_rejected() {
    let app = build_router();

    let created = app
        .clone()
        .oneshot(json_request("POST", "/api/v1/tenants", json!({"name": "Acme"})))
        .await
        .unwrap();
    let tenant = json_body(created).await;
    let id = tenant["id"].as_str().unwrap().to_string();

    for workers in [0, 101] {
        let response = app
            .clone()
            .oneshot(json_request(
                "PUT",
                &format!("/api/v1/tenants/{id}/config/concurrency"),
                json!({"workers": workers}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert_eq!(body["error"], "invalid request");
    }

    let unknown = app
        .clone()
        .oneshot(json_request(
            "PUT",
            &format!(
                "/api/v1/tenants/{}/config/concurrency",
                uuid::Uuid::now_v7()
            ),
            json!({"workers": 5}),
        ))
        .await
        .unwrap();
    assert_eq!(unknown.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn blank_tenant_name_is_a_bad_request() {
    let app = build_router();
    let response = app
        .oneshot(json_request("POST", "/api/v1/tenants", json!({"name": ""})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn message_pagination_over_http() {
    let app = build_router();

    let created = app
        .clone()
        .oneshot(json_request("POST", "/api/v1/tenants", json!({"name": "Acme"})))
        .await
        .unwrap();
    let tenant = json_body(created).await;
    let id = tenant["id"].as_str().unwrap().to_string();

    for i in 0..5 {
        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                &format!("/api/v1/messages/{id}"),
                json!({"payload": {"test": "data", "number": i}}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    let first_page = app
        .clone()
        .oneshot(empty_request(
            "GET",
            &format!("/api/v1/messages?tenant_id={id}&limit=3"),
        ))
        .await
        .unwrap();
    assert_eq!(first_page.status(), StatusCode::OK);
    let first = json_body(first_page).await;
    assert_eq!(first["data"].as_array().unwrap().len(), 3);
    let cursor = first["next_cursor"].as_str().expect("cursor").to_string();

    let second_page = app
        .clone()
        .oneshot(empty_request(
            "GET",
            &format!("/api/v1/messages?tenant_id={id}&limit=3&cursor={cursor}"),
        ))
        .await
        .unwrap();
    assert_eq!(second_page.status(), StatusCode::OK);
    let second = json_body(second_page).await;
    assert_eq!(second["data"].as_array().unwrap().len(), 2);
    assert!(second["next_cursor"].is_null());

    let stats = app
        .clone()
        .oneshot(empty_request(
            "GET",
            &format!("/api/v1/stats/tenants/{id}/messages"),
        ))
        .await
        .unwrap();
    assert_eq!(stats.status(), StatusCode::OK);
    assert_eq!(json_body(stats).await["total_messages"], 5);
}

#[tokio::test]
async fn message_crud_over_http() {
    let app = build_router();

    let created = app
        .clone()
        .oneshot(json_request("POST", "/api/v1/tenants", json!({"name": "Acme"})))
        .await
        .unwrap();
    let tenant = json_body(created).await;
    let tenant_id = tenant["id"].as_str().unwrap().to_string();

    let posted = app
        .clone()
        .oneshot(json_request(
            "POST",
            &format!("/api/v1/messages/{tenant_id}"),
            json!({"payload": {"hello": "world"}}),
        ))
        .await
        .unwrap();
    assert_eq!(posted.status(), StatusCode::CREATED);
    let message = json_body(posted).await;
    let message_id = message["id"].as_str().unwrap().to_string();
    assert_eq!(message["payload"]["hello"], "world");

    let fetched = app
        .clone()
        .oneshot(empty_request("GET", &format!("/api/v1/messages/{message_id}")))
        .await
        .unwrap();
    assert_eq!(fetched.status(), StatusCode::OK);

    let deleted = app
        .clone()
        .oneshot(empty_request(
            "DELETE",
            &format!("/api/v1/messages/{message_id}"),
        ))
        .await
        .unwrap();
    assert_eq!(deleted.status(), StatusCode::OK);

    let missing = app
        .clone()
        .oneshot(empty_request("GET", &format!("/api/v1/messages/{message_id}")))
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);

    let unknown_tenant = app
        .clone()
        .oneshot(json_request(
            "POST",
            &format!("/api/v1/messages/{}", uuid::Uuid::now_v7()),
            json!({"payload": {}}),
        ))
        .await
        .unwrap();
    assert_eq!(unknown_tenant.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn health_and_metrics_respond() {
    let app = build_router();

    let health = app
        .clone()
        .oneshot(empty_request("GET", "/health"))
        .await
        .unwrap();
    assert_eq!(health.status(), StatusCode::OK);
    assert_eq!(json_body(health).await["status"], "healthy");

    apiary::metrics::init_metrics().unwrap();
    let metrics = app
        .oneshot(empty_request("GET", "/metrics"))
        .await
        .unwrap();
    assert_eq!(metrics.status(), StatusCode::OK);
}
