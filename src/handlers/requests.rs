use axum::{
    extract::{Path, Query, State},
    response::Json,
};

use crate::{
    auth::Actor,
    entities::supply_request,
    services::requests::{
        ApprovalOutcome, BatchCreated, CreateBatchInput, CreateRequestInput, RejectInput,
        ReleaseOutcome, RequestDetails, RequestFilter,
    },
    ApiResponse, ApiResult, AppState,
};

#[utoipa::path(
    post,
    path = "/api/v1/requests",
    request_body = CreateRequestInput,
    responses(
        (status = 200, description = "Request created as pending"),
        (status = 400, description = "Invalid request or borrower has overdue loans", body = crate::errors::ErrorResponse),
        (status = 401, description = "Missing actor", body = crate::errors::ErrorResponse)
    ),
    tag = "requests"
)]
pub async fn create_request(
    State(state): State<AppState>,
    actor: Actor,
    Json(payload): Json<CreateRequestInput>,
) -> ApiResult<supply_request::Model> {
    let created = state.services.requests.create(payload, actor).await?;
    Ok(Json(ApiResponse::success(created)))
}

#[utoipa::path(
    post,
    path = "/api/v1/requests/batch",
    request_body = CreateBatchInput,
    responses((status = 200, description = "Batch created; returns its group id and token")),
    tag = "requests"
)]
pub async fn create_batch(
    State(state): State<AppState>,
    actor: Actor,
    Json(payload): Json<CreateBatchInput>,
) -> ApiResult<BatchCreated> {
    let created = state.services.requests.create_batch(payload, actor).await?;
    Ok(Json(ApiResponse::success(created)))
}

#[utoipa::path(
    get,
    path = "/api/v1/requests",
    params(RequestFilter),
    responses((status = 200, description = "Requests listed")),
    tag = "requests"
)]
pub async fn list_requests(
    State(state): State<AppState>,
    Query(filter): Query<RequestFilter>,
) -> ApiResult<Vec<supply_request::Model>> {
    Ok(Json(ApiResponse::success(
        state.services.requests.list(filter).await?,
    )))
}

#[utoipa::path(
    get,
    path = "/api/v1/requests/{id}",
    params(("id" = i32, Path, description = "Request id")),
    responses(
        (status = 200, description = "Request with its loans and scanner token"),
        (status = 404, description = "Not found", body = crate::errors::ErrorResponse)
    ),
    tag = "requests"
)]
pub async fn get_request(
    State(state): State<AppState>,
    Path(id): Path<i32>,
) -> ApiResult<RequestDetails> {
    Ok(Json(ApiResponse::success(state.services.requests.get(id).await?)))
}

/// Approves a pending request; pending siblings in the same batch follow.
#[utoipa::path(
    post,
    path = "/api/v1/requests/{id}/approve",
    params(("id" = i32, Path, description = "Request id")),
    responses(
        (status = 200, description = "Approved"),
        (status = 400, description = "Request is not pending", body = crate::errors::ErrorResponse)
    ),
    tag = "requests"
)]
pub async fn approve_request(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<i32>,
) -> ApiResult<ApprovalOutcome> {
    Ok(Json(ApiResponse::success(
        state.services.requests.approve(id, actor).await?,
    )))
}

#[utoipa::path(
    post,
    path = "/api/v1/requests/{id}/reject",
    params(("id" = i32, Path, description = "Request id")),
    request_body = RejectInput,
    responses(
        (status = 200, description = "Rejected"),
        (status = 400, description = "Request is not pending", body = crate::errors::ErrorResponse)
    ),
    tag = "requests"
)]
pub async fn reject_request(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<i32>,
    payload: Option<Json<RejectInput>>,
) -> ApiResult<supply_request::Model> {
    let input = payload.map(|Json(input)| input).unwrap_or_default();
    Ok(Json(ApiResponse::success(
        state.services.requests.reject(id, input, actor).await?,
    )))
}

#[utoipa::path(
    post,
    path = "/api/v1/requests/{id}/release",
    params(("id" = i32, Path, description = "Request id")),
    responses(
        (status = 200, description = "Released; stock decremented and loans opened"),
        (status = 409, description = "Already released", body = crate::errors::ErrorResponse),
        (status = 422, description = "Insufficient stock", body = crate::errors::ErrorResponse)
    ),
    tag = "requests"
)]
pub async fn release_request(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<i32>,
) -> ApiResult<ReleaseOutcome> {
    Ok(Json(ApiResponse::success(
        state.services.requests.release(id, actor).await?,
    )))
}
