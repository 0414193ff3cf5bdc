use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use estate::api::{router, AppState};
use estate_core::{ImportConfig, ImportService, MemoryStore};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

const RAINFALL: &str = "Date,Inches\n2024-01-01,1.5\n2024-01-02,0.25\n";

fn app() -> (Arc<MemoryStore>, Router) {
    let store = Arc::new(MemoryStore::new());
    let imports =
        ImportService::new(store.clone(), store.clone(), store.clone(), ImportConfig::default());
    (store, router(Arc::new(AppState { imports })))
}

fn post_import(tenant: Uuid, role: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/imports")
        .header("content-type", "application/json")
        .header("x-tenant-id", tenant.to_string())
        .header("x-user", "asha")
        .header("x-role", role)
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

#[tokio::test]
async fn validate_then_commit_over_http() {
    let (store, app) = app();
    let tenant = Uuid::new_v4();

    let (status, preview) = send(
        &app,
        post_import(
            tenant,
            "owner",
            json!({ "dataset": "rainfall", "mode": "validate", "csv": RAINFALL }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(preview["valid"], true);
    assert_eq!(preview["rowCount"], 2);
    assert_eq!(preview["imported"], 0);
    assert!(preview["expiresAt"].is_string());
    let token = preview["validationToken"].as_str().unwrap().to_string();

    let (status, committed) = send(
        &app,
        post_import(
            tenant,
            "owner",
            json!({ "dataset": "rainfall", "mode": "commit", "validationToken": token }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(committed["imported"], 2);
    assert_eq!(committed["validationToken"], token);
    assert_eq!(store.row_count(tenant, "rainfall"), 2);

    let (status, again) = send(
        &app,
        post_import(
            tenant,
            "owner",
            json!({ "dataset": "rainfall", "mode": "commit", "validationToken": token }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(again["code"], "token_already_committed");

    let job_request = Request::builder()
        .uri(format!("/imports/{token}"))
        .header("x-tenant-id", tenant.to_string())
        .header("x-user", "asha")
        .body(Body::empty())
        .unwrap();
    let (status, job) = send(&app, job_request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(job["status"], "committed");
    assert_eq!(job["importedCount"], 2);
    assert!(job.get("rawContent").is_none());
}

#[tokio::test]
async fn errors_map_to_distinct_statuses() {
    let (_store, app) = app();
    let tenant = Uuid::new_v4();

    let (status, body) = send(
        &app,
        post_import(
            tenant,
            "owner",
            json!({ "dataset": "weather", "mode": "validate", "csv": RAINFALL }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "unsupported_dataset");

    let (status, body) = send(
        &app,
        post_import(
            tenant,
            "viewer",
            json!({ "dataset": "rainfall", "mode": "validate", "csv": RAINFALL }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "read_only_role");

    let (status, body) = send(
        &app,
        post_import(
            tenant,
            "owner",
            json!({ "dataset": "rainfall", "mode": "commit", "validationToken": Uuid::new_v4() }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "token_not_found");

    let (status, body) = send(
        &app,
        post_import(
            tenant,
            "owner",
            json!({ "dataset": "rainfall", "mode": "validate", "csv": "" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "empty_input");
}

#[tokio::test]
async fn invalid_token_returns_stored_errors() {
    let (store, app) = app();
    let tenant = Uuid::new_v4();
    let csv = "Date,Inches\n2024-01-01,\n";

    let (_, preview) = send(
        &app,
        post_import(
            tenant,
            "owner",
            json!({ "dataset": "rainfall", "mode": "validate", "csv": csv }),
        ),
    )
    .await;
    assert_eq!(preview["valid"], false);
    assert_eq!(preview["errors"][0]["row"], 2);
    assert!(preview["validationToken"].is_null());
    let token = store.jobs()[0].id;

    let (status, body) = send(
        &app,
        post_import(
            tenant,
            "owner",
            json!({ "dataset": "rainfall", "mode": "commit", "validationToken": token }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["code"], "token_invalid");
    assert_eq!(body["errors"][0]["message"], "Missing rainfall amount (inches or mm)");
}

#[tokio::test]
async fn missing_caller_headers_are_rejected() {
    let (_store, app) = app();
    let request = Request::builder()
        .method("POST")
        .uri("/imports")
        .header("content-type", "application/json")
        .body(Body::from(
            json!({ "dataset": "rainfall", "mode": "validate", "csv": RAINFALL }).to_string(),
        ))
        .unwrap();

    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "unauthorized");
}

#[tokio::test]
async fn module_header_limits_datasets() {
    let (_store, app) = app();
    let request = Request::builder()
        .method("POST")
        .uri("/imports")
        .header("content-type", "application/json")
        .header("x-tenant-id", Uuid::new_v4().to_string())
        .header("x-user", "clerk")
        .header("x-modules", "processing, rainfall")
        .body(Body::from(
            json!({ "dataset": "sales", "mode": "validate", "csv": "Date\n2024-01-01\n" })
                .to_string(),
        ))
        .unwrap();

    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "module_disabled");
}
