//! Axum surface for the webhook-driven reconciliation entry points.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use mailattrib_recon::{ReconError, Reconciler};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::warn;
use uuid::Uuid;

pub const CRATE_NAME: &str = "mailattrib-web";

#[derive(Clone)]
pub struct AppState {
    pub reconciler: Arc<Reconciler>,
}

impl AppState {
    pub fn new(reconciler: Arc<Reconciler>) -> Self {
        Self { reconciler }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route(
            "/webhooks/bulk-operation-finished",
            post(bulk_operation_finished_handler),
        )
        .route("/api/users/{user_id}/sync", post(trigger_sync_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, host: &str, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind((host, port)).await?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}

/// Storefront completion webhook body. `state` round-trips the internal
/// user id handed to the bulk-operation mutation.
#[derive(Debug, Deserialize)]
pub struct BulkOperationFinishedPayload {
    #[serde(default)]
    pub admin_graphql_api_id: String,
    #[serde(default)]
    pub shop: String,
    #[serde(default)]
    pub state: String,
}

async fn health_handler() -> Response {
    Json(json!({ "status": "ok" })).into_response()
}

async fn bulk_operation_finished_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<BulkOperationFinishedPayload>,
) -> Response {
    if payload.admin_graphql_api_id.is_empty() {
        return validation_error("admin_graphql_api_id");
    }
    if payload.shop.is_empty() {
        return validation_error("shop");
    }
    let Ok(user_id) = payload.state.parse::<Uuid>() else {
        return validation_error("state");
    };

    match state
        .reconciler
        .on_bulk_export_finished(user_id, &payload.admin_graphql_api_id)
        .await
    {
        Ok(summary) => (StatusCode::OK, Json(summary)).into_response(),
        Err(err) => error_response(err),
    }
}

async fn trigger_sync_handler(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<Uuid>,
) -> Response {
    match state.reconciler.trigger_bulk_export(user_id).await {
        Ok(operation_id) => (
            StatusCode::ACCEPTED,
            Json(json!({ "operation_id": operation_id })),
        )
            .into_response(),
        Err(err) => error_response(err),
    }
}

fn validation_error(field: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": format!("missing or invalid parameter {field}") })),
    )
        .into_response()
}

/// No automatic retry here: the storefront redelivers the webhook on
/// non-2xx responses.
fn error_response(err: ReconError) -> Response {
    let status = match &err {
        ReconError::UserNotFound(_) => StatusCode::NOT_FOUND,
        ReconError::Fetch(_) => StatusCode::BAD_GATEWAY,
        ReconError::Repo(_) | ReconError::PartialImport { .. } => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    warn!(error = %err, "reconciliation request failed");
    (status, Json(json!({ "error": err.to_string() }))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request};
    use http_body_util::BodyExt;
    use mailattrib_recon::ReconConfig;
    use mailattrib_shopify::{build_http_client, ShopifyClient};
    use mailattrib_storage::MemoryRepository;
    use tower::ServiceExt;

    fn test_app() -> Router {
        let config = ReconConfig::default();
        let http = build_http_client(config.http_timeout).unwrap();
        let reconciler = Reconciler::new(
            Arc::new(MemoryRepository::new()),
            ShopifyClient::new(http, config.api_version.clone()),
            &config,
        );
        app(AppState::new(Arc::new(reconciler)))
    }

    fn webhook_request(body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/webhooks/bulk-operation-finished")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn health_endpoint_answers_ok() {
        let resp = test_app()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn webhook_without_operation_id_is_rejected() {
        let resp = test_app()
            .oneshot(webhook_request(json!({
                "shop": "demo-shop.myshopify.com",
                "state": Uuid::new_v4().to_string(),
            })))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("admin_graphql_api_id"));
    }

    #[tokio::test]
    async fn webhook_with_non_uuid_state_is_rejected() {
        let resp = test_app()
            .oneshot(webhook_request(json!({
                "admin_graphql_api_id": "gid://shopify/BulkOperation/1",
                "shop": "demo-shop.myshopify.com",
                "state": "not-a-user-id",
            })))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn webhook_for_unknown_user_is_not_found() {
        let resp = test_app()
            .oneshot(webhook_request(json!({
                "admin_graphql_api_id": "gid://shopify/BulkOperation/1",
                "shop": "demo-shop.myshopify.com",
                "state": Uuid::new_v4().to_string(),
            })))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn manual_sync_for_unknown_user_is_not_found() {
        let resp = test_app()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/api/users/{}/sync", Uuid::new_v4()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
