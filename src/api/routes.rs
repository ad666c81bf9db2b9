//! API route definitions.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{routing::get, Json, Router};
use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::{json, Value};

use super::state::AppState;
use crate::scheduler::history;
use crate::storage::derived::{list_materializations, read_view};
use crate::storage::schema;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/materializations", get(materializations))
        .route("/runs", get(runs))
        .route("/views/{name}", get(view_rows))
}

enum ApiError {
    NotFound(String),
    BadRequest(String),
    Internal(anyhow::Error),
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        ApiError::Internal(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m),
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            ApiError::Internal(e) => {
                tracing::error!("API request failed: {:#}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
        };
        (status, Json(json!({ "error": { "message": message } }))).into_response()
    }
}

fn conn(state: &AppState) -> Result<crate::storage::PooledConn, ApiError> {
    state
        .pool
        .get()
        .map_err(|e| ApiError::Internal(anyhow::Error::new(e).context("Failed to get DB connection")))
}

async fn health() -> Json<Value> {
    Json(json!({
        "data": {
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION")
        },
        "meta": {
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "version": env!("CARGO_PKG_VERSION")
        }
    }))
}

async fn materializations(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let list = list_materializations(&*conn(&state)?)?;
    Ok(Json(json!({ "data": list, "meta": { "total": list.len() } })))
}

#[derive(Debug, Deserialize)]
struct RunsQuery {
    limit: Option<usize>,
}

async fn runs(
    State(state): State<AppState>,
    Query(q): Query<RunsQuery>,
) -> Result<Json<Value>, ApiError> {
    let entries = history::recent(&*conn(&state)?, q.limit.unwrap_or(50).min(1000))?;
    Ok(Json(json!({ "data": entries, "meta": { "total": entries.len() } })))
}

#[derive(Debug, Deserialize)]
struct RangeQuery {
    from: NaiveDate,
    to: Option<NaiveDate>,
}

async fn view_rows(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(q): Query<RangeQuery>,
) -> Result<Json<Value>, ApiError> {
    let view = schema::public_view(&name)
        .ok_or_else(|| ApiError::NotFound(format!("unknown materialization '{name}'")))?;
    let to = q.to.unwrap_or(q.from);
    if to < q.from {
        return Err(ApiError::BadRequest(format!("'to' ({to}) is before 'from' ({})", q.from)));
    }
    let rows = read_view(&*conn(&state)?, view, q.from, to)?;
    Ok(Json(json!({
        "data": rows,
        "meta": { "view": view.name, "version": view.version, "total": rows.len() }
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::router;
    use crate::storage::open_pool;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
        let resp = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    fn app() -> (tempfile::TempDir, Router) {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_pool(&dir.path().join("api.db")).unwrap();
        (dir, router(AppState { pool }))
    }

    #[tokio::test]
    async fn test_health() {
        let (_dir, app) = app();
        let (status, body) = get_json(app, "/api/v1/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["status"], "ok");
    }

    #[tokio::test]
    async fn test_materializations_listed() {
        let (_dir, app) = app();
        let (status, body) = get_json(app, "/api/v1/materializations").await;
        assert_eq!(status, StatusCode::OK);
        let names: Vec<&str> = body["data"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["name"].as_str().unwrap())
            .collect();
        assert!(names.contains(&"user_behavior_profile"));
        assert!(!names.contains(&"baseline_snapshots"));
    }

    #[tokio::test]
    async fn test_view_rows_empty_range() {
        let (_dir, app) = app();
        let (status, body) =
            get_json(app, "/api/v1/views/daily_consumption?from=2025-08-18&to=2025-08-19").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["meta"]["total"], 0);
    }

    #[tokio::test]
    async fn test_unknown_view_is_404() {
        let (_dir, app) = app();
        let (status, _) = get_json(app.clone(), "/api/v1/views/nope?from=2025-08-18").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        // Internal tables are not exposed.
        let (status, _) = get_json(app, "/api/v1/views/baseline_snapshots?from=2025-08-18").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_reversed_range_is_400() {
        let (_dir, app) = app();
        let (status, body) =
            get_json(app, "/api/v1/views/daily_consumption?from=2025-08-19&to=2025-08-18").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"]["message"].as_str().is_some());
    }
}
