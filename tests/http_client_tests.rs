//! `HttpWorkspaceClient` against a local axum server speaking the REST shapes.

use axum::Json;
use axum::Router;
use axum::extract::{Path, Query};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use demo_setup::errors::ApiError;
use demo_setup::workspace::{HttpWorkspaceClient, WorkspaceApi};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::time::Duration;
use tokio::net::TcpListener;

const TOKEN: &str = "dapi-test-token";

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        == Some(format!("Bearer {}", TOKEN).as_str())
}

async fn me(headers: HeaderMap) -> (StatusCode, Json<Value>) {
    if !authorized(&headers) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error_code": "UNAUTHENTICATED", "message": "invalid token"})),
        );
    }
    (
        StatusCode::OK,
        Json(json!({"userName": "ada@example.com", "id": "42"})),
    )
}

async fn catalogs(Query(params): Query<HashMap<String, String>>) -> Json<Value> {
    match params.get("page_token").map(String::as_str) {
        None => Json(json!({
            "catalogs": [{"name": "main"}, {"name": "workspace"}],
            "next_page_token": "p2"
        })),
        Some("p2") => Json(json!({"catalogs": [{"name": "sandbox"}]})),
        Some(_) => Json(json!({"catalogs": []})),
    }
}

async fn schema(Path(full_name): Path<String>) -> (StatusCode, Json<Value>) {
    if full_name == "main.default" {
        (
            StatusCode::OK,
            Json(json!({"name": "default", "catalog_name": "main", "full_name": "main.default"})),
        )
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(json!({
                "error_code": "SCHEMA_DOES_NOT_EXIST",
                "message": format!("Schema '{}' does not exist.", full_name)
            })),
        )
    }
}

async fn create_schema(Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    if body["catalog_name"] == "locked" {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({
                "error_code": "PERMISSION_DENIED",
                "message": "User does not have CREATE SCHEMA on Catalog 'locked'."
            })),
        );
    }
    (
        StatusCode::OK,
        Json(json!({
            "name": body["name"],
            "catalog_name": body["catalog_name"],
            "full_name": format!("{}.{}", body["catalog_name"].as_str().unwrap_or(""), body["name"].as_str().unwrap_or(""))
        })),
    )
}

async fn apps() -> (StatusCode, Json<Value>) {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({"error_code": "TEMPORARILY_UNAVAILABLE", "message": "try later"})),
    )
}

async fn spawn() -> String {
    let app = Router::new()
        .route("/api/2.0/preview/scim/v2/Me", get(me))
        .route("/api/2.1/unity-catalog/catalogs", get(catalogs))
        .route("/api/2.1/unity-catalog/schemas", post(create_schema))
        .route("/api/2.1/unity-catalog/schemas/{full_name}", get(schema))
        .route("/api/2.0/apps", get(apps));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

fn client(host: &str, token: &str) -> HttpWorkspaceClient {
    HttpWorkspaceClient::new(host, token, Duration::from_secs(5)).unwrap()
}

#[tokio::test]
async fn test_current_user_with_bearer_token() {
    let host = spawn().await;
    let user = client(&host, TOKEN).current_user().await.unwrap();
    assert_eq!(user.user_name, "ada@example.com");

    let err = client(&host, "wrong").current_user().await.unwrap_err();
    assert!(matches!(err, ApiError::Unauthenticated(_)), "{:?}", err);
}

#[tokio::test]
async fn test_catalog_listing_follows_pages() {
    let host = spawn().await;
    let names: Vec<String> = client(&host, TOKEN)
        .list_catalogs()
        .await
        .unwrap()
        .into_iter()
        .map(|c| c.name)
        .collect();
    assert_eq!(names, ["main", "workspace", "sandbox"]);
}

#[tokio::test]
async fn test_schema_lookup_and_creation_errors_are_classified() {
    let host = spawn().await;
    let api = client(&host, TOKEN);

    let found = api.get_schema("main.default").await.unwrap();
    assert_eq!(found.full_name(), "main.default");

    assert!(api.get_schema("main.missing").await.unwrap_err().is_not_found());

    let created = api.create_schema("main", "demo", "demo data").await.unwrap();
    assert_eq!(created.full_name(), "main.demo");

    let denied = api.create_schema("locked", "demo", "").await.unwrap_err();
    assert!(denied.is_permission_denied(), "{:?}", denied);
    assert!(denied.to_string().contains("CREATE SCHEMA"));
}

#[tokio::test]
async fn test_unavailable_service_is_transient() {
    let host = spawn().await;
    let err = client(&host, TOKEN).list_apps().await.unwrap_err();
    assert!(matches!(err, ApiError::Transient(_)), "{:?}", err);
}

#[tokio::test]
async fn test_connection_refused_is_transient() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    let err = client(&format!("http://{}", addr), TOKEN)
        .current_user()
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::Transient(_)), "{:?}", err);
}
