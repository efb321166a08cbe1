use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json,
    Router,
};
use runtime::{ErrorCode, JobConfig, JobError, JobFailure, JobStatus, JobSummary, StatusResponse};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{state::AppState, ws};

const DEFAULT_LIST_LIMIT: usize = 20;
const MAX_LIST_LIMIT: usize = 200;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/runs", post(start_run).get(list_runs))
        .route("/runs/:run_id", delete(abort_run))
        .route("/runs/:run_id/status", get(run_status))
        .route("/runs/:run_id/result", get(run_result))
        .route("/runs/:run_id/trades.csv", get(run_trades))
        .route("/ws/events", get(ws::events_socket))
        .with_state(state)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StartRunResponse {
    success: bool,
    run_id: String,
    status: JobStatus,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    success: bool,
    error: JobFailure,
}

#[derive(Debug, Serialize)]
struct RunListResponse {
    runs: Vec<JobSummary>,
}

#[derive(Debug, Default, Deserialize)]
struct ListParams {
    limit: Option<usize>,
}

fn error_status(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::ConfigInvalid | ErrorCode::TooManyCombinations => StatusCode::BAD_REQUEST,
        ErrorCode::DataNotFound => StatusCode::NOT_FOUND,
        ErrorCode::DataInsufficient => StatusCode::UNPROCESSABLE_ENTITY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: &JobError) -> Response {
    let body = ErrorResponse {
        success: false,
        error: JobFailure::from(err),
    };
    (error_status(err.code()), Json(body)).into_response()
}

fn status_response(response: StatusResponse) -> Response {
    let status = if response.status.is_some() {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    };
    (status, Json(response)).into_response()
}

async fn start_run(
    State(state): State<AppState>,
    payload: Result<Json<JobConfig>, JsonRejection>,
) -> Response {
    let config = match payload {
        Ok(Json(config)) => config,
        Err(rejection) => {
            return error_response(&JobError::ConfigInvalid(rejection.body_text()));
        }
    };

    match state.orchestrator().enqueue(config) {
        Ok(run_id) => {
            let location = format!("/runs/{run_id}/status");
            (
                StatusCode::ACCEPTED,
                [(header::LOCATION, location)],
                Json(StartRunResponse {
                    success: true,
                    run_id,
                    status: JobStatus::Queued,
                }),
            )
                .into_response()
        }
        Err(err) => {
            warn!(error = %err, code = err.code().as_str(), "run rejected");
            error_response(&err)
        }
    }
}

async fn list_runs(State(state): State<AppState>, Query(params): Query<ListParams>) -> Json<RunListResponse> {
    let limit = params
        .limit
        .unwrap_or(DEFAULT_LIST_LIMIT)
        .min(MAX_LIST_LIMIT);
    Json(RunListResponse {
        runs: state.orchestrator().recent(limit),
    })
}

async fn run_status(State(state): State<AppState>, Path(run_id): Path<String>) -> Response {
    status_response(state.orchestrator().status(&run_id))
}

async fn run_result(State(state): State<AppState>, Path(run_id): Path<String>) -> Response {
    status_response(state.orchestrator().result(&run_id))
}

async fn run_trades(State(state): State<AppState>, Path(run_id): Path<String>) -> Response {
    match state.orchestrator().trades_csv(&run_id) {
        Ok(Some(csv)) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/csv; charset=utf-8")],
            csv,
        )
            .into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(err) => error_response(&err),
    }
}

async fn abort_run(State(state): State<AppState>, Path(run_id): Path<String>) -> Response {
    status_response(state.orchestrator().abort(&run_id))
}
