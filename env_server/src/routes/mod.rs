//! HTTP routes: GitHub webhook, environment read API, health checks.

pub mod api;
pub mod webhook;

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use diesel_async::RunQueryDsl;
use serde_json::{json, Value};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::config::AppConfig;
use crate::db::DbPool;
use crate::services::dispatcher::TaskDispatcher;
use crate::services::environment_service::EnvironmentFilter;

/// Shared state for route handlers.
#[derive(Clone)]
pub struct AppState {
    pub pool: DbPool,
    pub config: Arc<AppConfig>,
    pub dispatcher: TaskDispatcher,
}

/// Build the control plane's Axum router.
pub fn app_router(state: AppState) -> Router {
    let timeout = Duration::from_secs(state.config.request_timeout_secs);
    Router::new()
        // Health
        .route("/health", get(health))
        .route("/health/ready", get(ready))
        // Webhook
        .route("/webhooks/github", post(webhook_handler))
        // Environment API
        .route("/api/environments", get(list_environments))
        .route("/api/environments/{env_id}", get(get_environment))
        .route(
            "/api/environments/namespace/{namespace}",
            get(get_environment_by_namespace),
        )
        .route(
            "/api/environments/{env_id}/deployments",
            get(list_deployments),
        )
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            timeout,
        ))
        .with_state(state)
}

// ── Health ──

async fn health() -> Json<Value> {
    Json(json!({ "status": "healthy" }))
}

async fn ready(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let check = async {
        let mut conn = state
            .pool
            .get()
            .await
            .map_err(|e| anyhow::anyhow!("pool: {e}"))?;
        diesel::sql_query("SELECT 1").execute(&mut *conn).await?;
        anyhow::Ok(())
    };
    match check.await {
        Ok(()) => (StatusCode::OK, Json(json!({ "status": "ready" }))),
        Err(e) => {
            tracing::warn!("Readiness check failed: {e}");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "not ready", "error": e.to_string() })),
            )
        }
    }
}

// ── Webhook ──

async fn webhook_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<Value>), StatusCode> {
    crate::metrics::webhook_received(
        headers
            .get("x-github-event")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("unknown"),
    );

    webhook::handle_webhook(&state, &headers, body).await
}

// ── Environment API ──

#[derive(serde::Deserialize)]
pub struct ListEnvironmentsQuery {
    pub repository: Option<String>,
    pub active_only: Option<bool>,
    pub limit: Option<i64>,
}

async fn list_environments(
    State(state): State<AppState>,
    Query(query): Query<ListEnvironmentsQuery>,
) -> Result<Json<Vec<api::EnvironmentJson>>, StatusCode> {
    let mut conn = state
        .pool
        .get()
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    let filter = EnvironmentFilter {
        repository: query.repository,
        active_only: query.active_only.unwrap_or(false),
        limit: query.limit.unwrap_or(100).clamp(1, 1000),
    };
    api::list_environments(&mut conn, &filter)
        .await
        .map(Json)
        .map_err(|e| {
            tracing::error!("List environments error: {e}");
            StatusCode::INTERNAL_SERVER_ERROR
        })
}

async fn get_environment(
    State(state): State<AppState>,
    Path(env_id): Path<i64>,
) -> Result<Json<api::EnvironmentJson>, StatusCode> {
    let mut conn = state
        .pool
        .get()
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    api::get_environment(&mut conn, env_id)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

async fn get_environment_by_namespace(
    State(state): State<AppState>,
    Path(namespace): Path<String>,
) -> Result<Json<api::EnvironmentJson>, StatusCode> {
    let mut conn = state
        .pool
        .get()
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    api::get_environment_by_namespace(&mut conn, &namespace)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

#[derive(serde::Deserialize)]
pub struct ListDeploymentsQuery {
    pub limit: Option<i64>,
}

async fn list_deployments(
    State(state): State<AppState>,
    Path(env_id): Path<i64>,
    Query(query): Query<ListDeploymentsQuery>,
) -> Result<Json<Vec<api::DeploymentJson>>, StatusCode> {
    let mut conn = state
        .pool
        .get()
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    api::list_deployments(&mut conn, env_id, query.limit.unwrap_or(10).clamp(1, 1000))
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use hmac::{Hmac, Mac};
    use sha2::Sha256;
    use tower::ServiceExt;

    use super::*;

    const SECRET: &str = "webhook-secret";

    fn app() -> Router {
        let mut config = AppConfig::for_tests();
        config.github_webhook_secret = SECRET.to_string();
        let pool = crate::db::create_pool("postgres://ephemera@127.0.0.1:1/ephemera", 1).unwrap();
        let (dispatcher, _rx) = TaskDispatcher::channel(4);
        app_router(AppState {
            pool,
            config: Arc::new(config),
            dispatcher,
        })
    }

    fn sign(body: &[u8]) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(SECRET.as_bytes()).unwrap();
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    fn webhook(body: &'static str, signature: Option<String>, delivery: Option<&str>) -> Request<Body> {
        let mut req = Request::builder()
            .uri("/webhooks/github")
            .method("POST")
            .header("x-github-event", "pull_request");
        if let Some(sig) = signature {
            req = req.header("x-hub-signature-256", sig);
        }
        if let Some(id) = delivery {
            req = req.header("x-github-delivery", id);
        }
        req.body(Body::from(body)).unwrap()
    }

    #[tokio::test]
    async fn health_reports_healthy() {
        let response = app()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "healthy");
    }

    #[tokio::test]
    async fn webhook_rejects_bad_signature() {
        let body = r#"{"action":"opened"}"#;
        let response = app()
            .oneshot(webhook(body, Some("sha256=deadbeef".to_string()), Some("d-1")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app().oneshot(webhook(body, None, Some("d-1"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn webhook_requires_delivery_id() {
        let body = r#"{"action":"opened"}"#;
        let response = app()
            .oneshot(webhook(body, Some(sign(body.as_bytes())), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn webhook_rejects_non_json_body() {
        let body = "action=opened";
        let response = app()
            .oneshot(webhook(body, Some(sign(body.as_bytes())), Some("d-2")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_route_is_not_found() {
        let response = app()
            .oneshot(Request::builder().uri("/api/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
