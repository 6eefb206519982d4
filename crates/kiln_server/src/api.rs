use crate::state::AppState;

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use kiln_core::prelude::*;
use tracing::error;

pub struct ApiError(anyhow::Error);

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

/// Status code and stable error name for a job error.
fn classify(err: &JobError) -> (StatusCode, &'static str) {
    match err {
        JobError::Validation(_) => (StatusCode::BAD_REQUEST, "validation"),
        JobError::ModelNotFound(_) => (StatusCode::NOT_FOUND, "model_not_found"),
        JobError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
        JobError::ModelDisabled(_) => (StatusCode::CONFLICT, "model_disabled"),
        JobError::DuplicateJob(_) => (StatusCode::CONFLICT, "duplicate_job"),
        JobError::Active(_) => (StatusCode::CONFLICT, "active"),
        JobError::Cancelled(_) => (StatusCode::CONFLICT, "cancelled"),
        JobError::AdmissionTimeout(_) => (StatusCode::SERVICE_UNAVAILABLE, "admission_timeout"),
        JobError::SubmissionFailed(_) => (StatusCode::BAD_GATEWAY, "submission_failed"),
        JobError::Execution(_) => (StatusCode::UNPROCESSABLE_ENTITY, "execution"),
        JobError::PollingExhausted(_) => (StatusCode::UNPROCESSABLE_ENTITY, "polling_exhausted"),
        JobError::OutputMissing(_) => (StatusCode::GONE, "output_missing"),
        JobError::System(_) => (StatusCode::INTERNAL_SERVER_ERROR, "system"),
    }
}

fn body(status: StatusCode, error: &str, message: String) -> Response {
    let body = ErrorBody {
        error: error.to_string(),
        message,
    };
    (status, Json(body)).into_response()
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let Some(err) = self.0.downcast_ref::<JobError>() {
            let (status, name) = classify(err);
            if status.is_server_error() {
                error!("Job error: {:?}", self.0);
            }
            return body(status, name, err.to_string());
        }

        if let Some(err) = self.0.downcast_ref::<TemplateError>() {
            return body(StatusCode::BAD_REQUEST, "validation", err.to_string());
        }

        error!("Internal Server Error: {:?}", self.0);
        body(
            StatusCode::INTERNAL_SERVER_ERROR,
            "system",
            "Internal Server Error".to_string(),
        )
    }
}

/// GET /models
pub async fn list_models<C: ClusterBackend, S: OutputStore>(
    State(state): State<AppState<C, S>>,
) -> Json<Vec<ModelSummary>> {
    let registry = state.orchestrator.registry();
    let models = state
        .orchestrator
        .models()
        .into_iter()
        .map(|m| ModelSummary {
            available: registry.is_available(&m.id),
            descriptor: m.as_ref().clone(),
        })
        .collect();

    Json(models)
}

/// POST /jobs
pub async fn submit_job<C: ClusterBackend, S: OutputStore>(
    State(state): State<AppState<C, S>>,
    Json(request): Json<JobRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let id = state.orchestrator.submit(request)?;
    Ok((StatusCode::ACCEPTED, Json(SubmitResponse { id })))
}

#[derive(serde::Deserialize)]
pub struct ListParams {
    model: Option<String>,
}

/// GET /jobs
pub async fn list_jobs<C: ClusterBackend, S: OutputStore>(
    State(state): State<AppState<C, S>>,
    Query(params): Query<ListParams>,
) -> Json<Vec<JobRecord>> {
    let jobs = match params.model {
        Some(model) => state.orchestrator.jobs_for_model(&model),
        None => state.orchestrator.jobs(),
    };
    Json(jobs)
}

/// GET /jobs/{id}
pub async fn get_job<C: ClusterBackend, S: OutputStore>(
    State(state): State<AppState<C, S>>,
    Path(id): Path<String>,
) -> Result<Json<JobRecord>, ApiError> {
    Ok(Json(state.orchestrator.record(&id)?))
}

/// DELETE /jobs/{id}
pub async fn purge_job<C: ClusterBackend, S: OutputStore>(
    State(state): State<AppState<C, S>>,
    Path(id): Path<String>,
) -> Result<Json<JobRecord>, ApiError> {
    Ok(Json(state.orchestrator.purge(&id)?))
}

/// GET /jobs/{id}/status
pub async fn job_status<C: ClusterBackend, S: OutputStore>(
    State(state): State<AppState<C, S>>,
    Path(id): Path<String>,
) -> Result<Json<StatusResponse>, ApiError> {
    let phase = state.orchestrator.status(&id)?;
    Ok(Json(StatusResponse { id, phase }))
}

/// GET /jobs/{id}/output
///
/// `200` once the output is ready, `202` while the job is still going.
pub async fn job_output<C: ClusterBackend, S: OutputStore>(
    State(state): State<AppState<C, S>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let output = state.orchestrator.output(&id)?;
    let status = match output {
        OutputStatus::Ready { .. } => StatusCode::OK,
        OutputStatus::Pending { .. } => StatusCode::ACCEPTED,
    };
    Ok((status, Json(output)))
}

/// GET /jobs/{id}/logs
pub async fn job_logs<C: ClusterBackend, S: OutputStore>(
    State(state): State<AppState<C, S>>,
    Path(id): Path<String>,
) -> Result<Json<LogsResponse>, ApiError> {
    let logs = state.orchestrator.logs(&id).await?;
    Ok(Json(LogsResponse { id, logs }))
}

/// POST /jobs/{id}/cancel
pub async fn cancel_job<C: ClusterBackend, S: OutputStore>(
    State(state): State<AppState<C, S>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let ack = state.orchestrator.cancel(&id)?;
    let status = match ack {
        CancelAck::Cancelling => StatusCode::ACCEPTED,
        CancelAck::AlreadyTerminal { .. } => StatusCode::OK,
    };
    Ok((status, Json(ack)))
}
