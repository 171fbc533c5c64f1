use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};

use crate::{
    auth::Actor,
    errors::ServiceError,
    services::{
        batches::{BatchReport, BatchReturnInput, BatchSummary},
        requests::RejectInput,
    },
    ApiResponse, ApiResult, AppState,
};

type BatchResult = Result<(StatusCode, Json<ApiResponse<BatchReport>>), ServiceError>;

/// 200 when any member went through, 422 with the same report otherwise.
fn batch_response(report: BatchReport) -> BatchResult {
    if report.is_success() {
        return Ok((StatusCode::OK, Json(ApiResponse::success(report))));
    }
    let message = format!(
        "{} failed for all {} members of batch {}",
        report.operation, report.attempted, report.batch_group_id
    );
    let mut body = ApiResponse::success(report);
    body.success = false;
    body.message = Some(message);
    Ok((StatusCode::UNPROCESSABLE_ENTITY, Json(body)))
}

#[utoipa::path(
    get,
    path = "/api/v1/batches/{batch_id}",
    params(("batch_id" = String, Path, description = "Batch group id")),
    responses(
        (status = 200, description = "Batch members, loans and token"),
        (status = 404, description = "Not found", body = crate::errors::ErrorResponse)
    ),
    tag = "batches"
)]
pub async fn get_batch(
    State(state): State<AppState>,
    Path(batch_id): Path<String>,
) -> ApiResult<BatchSummary> {
    Ok(Json(ApiResponse::success(
        state.services.batches.batch_summary(&batch_id).await?,
    )))
}

#[utoipa::path(
    post,
    path = "/api/v1/batches/{batch_id}/approve",
    params(("batch_id" = String, Path, description = "Batch group id")),
    responses(
        (status = 200, description = "Per-member results"),
        (status = 422, description = "Every member failed")
    ),
    tag = "batches"
)]
pub async fn approve_batch(
    State(state): State<AppState>,
    actor: Actor,
    Path(batch_id): Path<String>,
) -> BatchResult {
    batch_response(state.services.batches.approve_batch(&batch_id, actor).await?)
}

#[utoipa::path(
    post,
    path = "/api/v1/batches/{batch_id}/reject",
    params(("batch_id" = String, Path, description = "Batch group id")),
    request_body = RejectInput,
    responses(
        (status = 200, description = "Per-member results"),
        (status = 422, description = "Every member failed")
    ),
    tag = "batches"
)]
pub async fn reject_batch(
    State(state): State<AppState>,
    actor: Actor,
    Path(batch_id): Path<String>,
    payload: Option<Json<RejectInput>>,
) -> BatchResult {
    let input = payload.map(|Json(input)| input).unwrap_or_default();
    batch_response(
        state
            .services
            .batches
            .reject_batch(&batch_id, input, actor)
            .await?,
    )
}

#[utoipa::path(
    post,
    path = "/api/v1/batches/{batch_id}/release",
    params(("batch_id" = String, Path, description = "Batch group id")),
    responses(
        (status = 200, description = "Per-member results"),
        (status = 422, description = "Every member failed")
    ),
    tag = "batches"
)]
pub async fn release_batch(
    State(state): State<AppState>,
    actor: Actor,
    Path(batch_id): Path<String>,
) -> BatchResult {
    batch_response(state.services.batches.release_batch(&batch_id, actor).await?)
}

#[utoipa::path(
    post,
    path = "/api/v1/batches/{batch_id}/return",
    params(("batch_id" = String, Path, description = "Batch group id")),
    request_body = BatchReturnInput,
    responses(
        (status = 200, description = "Per-loan results"),
        (status = 409, description = "No outstanding loans", body = crate::errors::ErrorResponse),
        (status = 422, description = "Every loan failed")
    ),
    tag = "batches"
)]
pub async fn return_batch(
    State(state): State<AppState>,
    actor: Actor,
    Path(batch_id): Path<String>,
    Json(payload): Json<BatchReturnInput>,
) -> BatchResult {
    batch_response(
        state
            .services
            .batches
            .return_batch(&batch_id, payload, actor)
            .await?,
    )
}
