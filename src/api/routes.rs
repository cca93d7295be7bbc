//! Axum routes exposing job, reset and reset-all operations.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use tracing::{debug, error};

use super::ErrorBody;
use crate::error::JobError;
use crate::jobs::settings::Settings;
use crate::orchestrator::{
    GlobalStatus, JobStatusView, JobSummary, MessageResponse, Orchestrator, ResetAllStep,
    ResetCheck, StartJobResponse, StartResetAllResponse, StartResetResponse, StepResponse,
};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Arc<Orchestrator>,
}

/// Build the Axum router with every seeder endpoint.
pub fn seeder_routes(orchestrator: Arc<Orchestrator>) -> Router {
    let state = ApiState { orchestrator };

    Router::new()
        .route("/health", get(health))
        .route("/api/status", get(global_status))
        .route("/api/jobs", get(list_jobs))
        .route("/api/jobs/{key}/status", get(job_status))
        .route("/api/jobs/{key}/start", post(start_job))
        .route("/api/jobs/{key}/step", post(step_batch))
        .route("/api/jobs/{key}/cancel", post(cancel_job))
        .route("/api/jobs/{key}/can-reset", get(can_reset))
        .route("/api/jobs/{key}/reset/start", post(start_reset))
        .route("/api/jobs/{key}/reset/step", post(step_reset))
        .route("/api/jobs/{key}/reset/now", post(reset_job_now))
        .route("/api/reset-all/start", post(start_reset_all))
        .route("/api/reset-all/step", post(step_reset_all))
        .route("/api/reset-all/cancel", post(cancel_reset_all))
        .route("/api/reset-all/now", post(reset_all_now))
        .with_state(state)
}

// ── Errors ──────────────────────────────────────────────────────────────

/// A `JobError` rendered as an HTTP response.
pub struct ApiError(JobError);

impl From<JobError> for ApiError {
    fn from(e: JobError) -> Self {
        Self(e)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            JobError::NotFound { .. } => StatusCode::NOT_FOUND,
            JobError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            JobError::AlreadyRunning { .. }
            | JobError::NotRunning { .. }
            | JobError::BlockedByDependents { .. } => StatusCode::CONFLICT,
            JobError::Hook { .. } | JobError::Batch { .. } | JobError::Database(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self.0, "Request failed");
        } else {
            debug!(error = %self.0, status = status.as_u16(), "Request refused");
        }

        let body = ErrorBody {
            error: self.0.to_string(),
            job_key: match &self.0 {
                JobError::NotFound { key }
                | JobError::NotRunning { key }
                | JobError::Hook { key, .. }
                | JobError::Batch { key, .. }
                | JobError::BlockedByDependents { key, .. } => Some(key.clone()),
                _ => None,
            },
            job_name: match &self.0 {
                JobError::BlockedByDependents { name, .. } => Some(name.clone()),
                _ => None,
            },
            running_job: match &self.0 {
                JobError::AlreadyRunning { running_job } => Some(running_job.clone()),
                _ => None,
            },
            blocking_dependents: match &self.0 {
                JobError::BlockedByDependents { blocking, .. } => Some(blocking.clone()),
                _ => None,
            },
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "data-seeder"
    }))
}

// ── Jobs ────────────────────────────────────────────────────────────────

async fn global_status(State(state): State<ApiState>) -> ApiResult<GlobalStatus> {
    Ok(Json(state.orchestrator.get_global_status().await?))
}

async fn list_jobs(State(state): State<ApiState>) -> ApiResult<Vec<JobSummary>> {
    Ok(Json(state.orchestrator.list_jobs().await?))
}

async fn job_status(
    State(state): State<ApiState>,
    Path(key): Path<String>,
) -> ApiResult<JobStatusView> {
    Ok(Json(state.orchestrator.get_status(&key).await?))
}

async fn start_job(
    State(state): State<ApiState>,
    Path(key): Path<String>,
    Json(settings): Json<Settings>,
) -> ApiResult<StartJobResponse> {
    Ok(Json(state.orchestrator.start_job(&key, settings).await?))
}

async fn step_batch(
    State(state): State<ApiState>,
    Path(key): Path<String>,
) -> ApiResult<StepResponse> {
    Ok(Json(state.orchestrator.step_batch(&key).await?))
}

async fn cancel_job(
    State(state): State<ApiState>,
    Path(key): Path<String>,
) -> ApiResult<MessageResponse> {
    Ok(Json(state.orchestrator.cancel_job(&key).await?))
}

// ── Resets ──────────────────────────────────────────────────────────────

async fn can_reset(
    State(state): State<ApiState>,
    Path(key): Path<String>,
) -> ApiResult<ResetCheck> {
    Ok(Json(state.orchestrator.can_reset(&key).await?))
}

async fn start_reset(
    State(state): State<ApiState>,
    Path(key): Path<String>,
) -> ApiResult<StartResetResponse> {
    Ok(Json(state.orchestrator.start_reset(&key).await?))
}

async fn step_reset(
    State(state): State<ApiState>,
    Path(key): Path<String>,
) -> ApiResult<StepResponse> {
    Ok(Json(state.orchestrator.step_reset(&key).await?))
}

async fn reset_job_now(
    State(state): State<ApiState>,
    Path(key): Path<String>,
) -> ApiResult<MessageResponse> {
    Ok(Json(state.orchestrator.reset_job_now(&key).await?))
}

async fn start_reset_all(State(state): State<ApiState>) -> ApiResult<StartResetAllResponse> {
    Ok(Json(state.orchestrator.start_reset_all().await?))
}

async fn step_reset_all(State(state): State<ApiState>) -> ApiResult<ResetAllStep> {
    Ok(Json(state.orchestrator.step_reset_all().await?))
}

async fn cancel_reset_all(State(state): State<ApiState>) -> ApiResult<MessageResponse> {
    Ok(Json(state.orchestrator.cancel_reset_all().await?))
}

async fn reset_all_now(State(state): State<ApiState>) -> ApiResult<MessageResponse> {
    Ok(Json(state.orchestrator.reset_all_now().await?))
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::jobs::registry::JobRegistry;
    use crate::store::{LibSqlBackend, ProgressStore};

    async fn app() -> Router {
        let registry = Arc::new(JobRegistry::new());
        let backend = LibSqlBackend::new_memory().await.unwrap();
        crate::jobs::builtin::register_demo_jobs(&registry, backend.connection())
            .await
            .unwrap();
        let store: Arc<dyn ProgressStore> = Arc::new(backend);
        seeder_routes(Arc::new(Orchestrator::new(registry, store)))
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let response = app()
            .await
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unknown_job_is_404() {
        let response = app()
            .await
            .oneshot(
                Request::post("/api/jobs/nope/step")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = body_json(response).await;
        assert_eq!(body["error"], "Job nope not found");
    }

    #[tokio::test]
    async fn test_missing_setting_is_422() {
        let response = app()
            .await
            .oneshot(
                Request::post("/api/jobs/users/start")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"count": 5}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[test]
    fn test_error_status_mapping() {
        let cases = [
            (JobError::NotFound { key: "x".into() }, StatusCode::NOT_FOUND),
            (JobError::Validation("bad".into()), StatusCode::UNPROCESSABLE_ENTITY),
            (
                JobError::AlreadyRunning {
                    running_job: "y".into(),
                },
                StatusCode::CONFLICT,
            ),
            (JobError::NotRunning { key: "x".into() }, StatusCode::CONFLICT),
            (
                JobError::BlockedByDependents {
                    key: "x".into(),
                    name: "X".into(),
                    blocking: vec!["Y".into()],
                },
                StatusCode::CONFLICT,
            ),
            (
                JobError::Batch {
                    key: "x".into(),
                    reason: "boom".into(),
                },
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError(err).status(), status);
        }
    }

    #[tokio::test]
    async fn test_already_running_body_names_job() {
        let response = ApiError(JobError::AlreadyRunning {
            running_job: "users".into(),
        })
        .into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let body = body_json(response).await;
        assert_eq!(body["running_job"], "users");
        assert!(body.get("blocking_dependents").is_none());
        assert!(body.get("job_key").is_none());
    }

    #[tokio::test]
    async fn test_blocked_body_carries_job_and_dependents() {
        let response = ApiError(JobError::BlockedByDependents {
            key: "users".into(),
            name: "Users".into(),
            blocking: vec!["Subscriptions".into()],
        })
        .into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let body = body_json(response).await;
        assert_eq!(body["job_key"], "users");
        assert_eq!(body["job_name"], "Users");
        assert_eq!(body["blocking_dependents"], serde_json::json!(["Subscriptions"]));
    }
}
