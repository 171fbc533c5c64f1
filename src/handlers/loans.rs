use axum::{
    extract::{Path, Query, State},
    response::Json,
};
use serde::Deserialize;
use utoipa::ToSchema;
use validator::Validate;

use crate::{
    auth::Actor,
    entities::borrowed_item,
    services::{
        loans::{BulkDeleteReport, ExtendDeadlineInput, LoanFilter, ReturnLoanInput, ReturnOutcome},
        today,
    },
    ApiResponse, ApiResult, AppState,
};

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct BulkDeleteRequest {
    #[validate(length(min = 1, max = 500))]
    pub loan_ids: Vec<i32>,
}

#[utoipa::path(
    get,
    path = "/api/v1/loans",
    params(LoanFilter),
    responses((status = 200, description = "Loans listed")),
    tag = "loans"
)]
pub async fn list_loans(
    State(state): State<AppState>,
    Query(filter): Query<LoanFilter>,
) -> ApiResult<Vec<borrowed_item::Model>> {
    Ok(Json(ApiResponse::success(
        state.services.loans.list(filter).await?,
    )))
}

#[utoipa::path(
    get,
    path = "/api/v1/loans/overdue",
    responses((status = 200, description = "Outstanding loans past their deadline")),
    tag = "loans"
)]
pub async fn overdue_loans(State(state): State<AppState>) -> ApiResult<Vec<borrowed_item::Model>> {
    Ok(Json(ApiResponse::success(
        state.services.loans.overdue(today()).await?,
    )))
}

#[utoipa::path(
    get,
    path = "/api/v1/loans/{id}",
    params(("id" = i32, Path, description = "Loan id")),
    responses(
        (status = 200, description = "Loan"),
        (status = 404, description = "Not found", body = crate::errors::ErrorResponse)
    ),
    tag = "loans"
)]
pub async fn get_loan(
    State(state): State<AppState>,
    Path(id): Path<i32>,
) -> ApiResult<borrowed_item::Model> {
    Ok(Json(ApiResponse::success(state.services.loans.get(id).await?)))
}

#[utoipa::path(
    post,
    path = "/api/v1/loans/{id}/return",
    params(("id" = i32, Path, description = "Loan id")),
    request_body = ReturnLoanInput,
    responses(
        (status = 200, description = "Loan closed; stock and request status updated"),
        (status = 409, description = "Loan already returned", body = crate::errors::ErrorResponse)
    ),
    tag = "loans"
)]
pub async fn return_loan(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<i32>,
    Json(payload): Json<ReturnLoanInput>,
) -> ApiResult<ReturnOutcome> {
    Ok(Json(ApiResponse::success(
        state.services.loans.process_return(id, payload, actor).await?,
    )))
}

#[utoipa::path(
    post,
    path = "/api/v1/loans/{id}/extend",
    params(("id" = i32, Path, description = "Loan id")),
    request_body = ExtendDeadlineInput,
    responses(
        (status = 200, description = "Deadline moved"),
        (status = 400, description = "Loan closed or date invalid", body = crate::errors::ErrorResponse)
    ),
    tag = "loans"
)]
pub async fn extend_loan(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<i32>,
    Json(payload): Json<ExtendDeadlineInput>,
) -> ApiResult<borrowed_item::Model> {
    Ok(Json(ApiResponse::success(
        state.services.loans.extend_deadline(id, payload, actor).await?,
    )))
}

/// Administrative removal. Outstanding loans are reversed before deletion.
#[utoipa::path(
    post,
    path = "/api/v1/loans/bulk-delete",
    request_body = BulkDeleteRequest,
    responses((status = 200, description = "Per-loan results")),
    tag = "loans"
)]
pub async fn bulk_delete_loans(
    State(state): State<AppState>,
    actor: Actor,
    Json(payload): Json<BulkDeleteRequest>,
) -> ApiResult<BulkDeleteReport> {
    payload.validate()?;
    Ok(Json(ApiResponse::success(
        state
            .services
            .loans
            .bulk_delete(payload.loan_ids, actor)
            .await?,
    )))
}
