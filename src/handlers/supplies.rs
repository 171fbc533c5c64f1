use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
};
use serde::Serialize;
use utoipa::ToSchema;

use crate::{
    auth::Actor,
    entities::{equipment_instance, supply},
    errors::ServiceError,
    identifiers::ScanToken,
    services::{
        ledger::{LedgerAudit, LedgerEntry, RestockInput},
        supplies::{
            BulkCreateInstancesInput, CreateInstanceInput, CreateSupplyInput, SupplyDetails,
            SupplyFilter, UpdateSupplyInput,
        },
    },
    ApiResponse, ApiResult, AppState,
};

#[derive(Debug, Serialize, ToSchema)]
pub struct SupplyTransactions {
    pub entries: Vec<LedgerEntry>,
    pub audit: LedgerAudit,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct TokenResponse {
    pub token: String,
}

#[utoipa::path(
    post,
    path = "/api/v1/supplies",
    request_body = CreateSupplyInput,
    responses(
        (status = 200, description = "Supply created"),
        (status = 400, description = "Invalid request", body = crate::errors::ErrorResponse),
        (status = 401, description = "Missing actor", body = crate::errors::ErrorResponse),
        (status = 409, description = "Duplicate name", body = crate::errors::ErrorResponse)
    ),
    tag = "supplies"
)]
pub async fn create_supply(
    State(state): State<AppState>,
    actor: Actor,
    Json(payload): Json<CreateSupplyInput>,
) -> ApiResult<supply::Model> {
    let created = state.services.supplies.create_supply(payload, actor).await?;
    Ok(Json(ApiResponse::success(created)))
}

#[utoipa::path(
    get,
    path = "/api/v1/supplies",
    params(SupplyFilter),
    responses((status = 200, description = "Supplies listed")),
    tag = "supplies"
)]
pub async fn list_supplies(
    State(state): State<AppState>,
    Query(filter): Query<SupplyFilter>,
) -> ApiResult<Vec<supply::Model>> {
    Ok(Json(ApiResponse::success(
        state.services.supplies.list(filter).await?,
    )))
}

#[utoipa::path(
    get,
    path = "/api/v1/supplies/low-stock",
    responses((status = 200, description = "Supplies at or below their minimum level")),
    tag = "supplies"
)]
pub async fn low_stock(State(state): State<AppState>) -> ApiResult<Vec<supply::Model>> {
    Ok(Json(ApiResponse::success(
        state.services.supplies.low_stock().await?,
    )))
}

#[utoipa::path(
    get,
    path = "/api/v1/supplies/{id}",
    params(("id" = i32, Path, description = "Supply id")),
    responses(
        (status = 200, description = "Supply with instance counts"),
        (status = 404, description = "Not found", body = crate::errors::ErrorResponse)
    ),
    tag = "supplies"
)]
pub async fn get_supply(
    State(state): State<AppState>,
    Path(id): Path<i32>,
) -> ApiResult<SupplyDetails> {
    Ok(Json(ApiResponse::success(state.services.supplies.get(id).await?)))
}

/// Edits the descriptive fields of a supply. Stock moves only through the
/// ledger endpoints.
#[utoipa::path(
    put,
    path = "/api/v1/supplies/{id}",
    params(("id" = i32, Path, description = "Supply id")),
    request_body = UpdateSupplyInput,
    responses(
        (status = 200, description = "Supply updated"),
        (status = 400, description = "Invalid request", body = crate::errors::ErrorResponse),
        (status = 404, description = "Not found", body = crate::errors::ErrorResponse)
    ),
    tag = "supplies"
)]
pub async fn update_supply(
    State(state): State<AppState>,
    _actor: Actor,
    Path(id): Path<i32>,
    Json(payload): Json<UpdateSupplyInput>,
) -> ApiResult<supply::Model> {
    let updated = state.services.supplies.update_supply(id, payload).await?;
    Ok(Json(ApiResponse::success(updated)))
}

#[utoipa::path(
    delete,
    path = "/api/v1/supplies/{id}",
    params(("id" = i32, Path, description = "Supply id")),
    responses(
        (status = 204, description = "Supply deleted"),
        (status = 400, description = "Supply has outstanding loans or live requests", body = crate::errors::ErrorResponse),
        (status = 404, description = "Not found", body = crate::errors::ErrorResponse)
    ),
    tag = "supplies"
)]
pub async fn delete_supply(
    State(state): State<AppState>,
    _actor: Actor,
    Path(id): Path<i32>,
) -> Result<StatusCode, ServiceError> {
    state.services.supplies.delete_supply(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    post,
    path = "/api/v1/supplies/{id}/restock",
    params(("id" = i32, Path, description = "Supply id")),
    request_body = RestockInput,
    responses(
        (status = 200, description = "Stock added; returns the ledger row"),
        (status = 404, description = "Not found", body = crate::errors::ErrorResponse)
    ),
    tag = "supplies"
)]
pub async fn restock(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<i32>,
    Json(payload): Json<RestockInput>,
) -> ApiResult<LedgerEntry> {
    let entry = state.services.ledger.restock(id, payload, actor).await?;
    Ok(Json(ApiResponse::success(entry)))
}

#[utoipa::path(
    get,
    path = "/api/v1/supplies/{id}/transactions",
    params(("id" = i32, Path, description = "Supply id")),
    responses((status = 200, description = "Ledger history with a replay audit")),
    tag = "supplies"
)]
pub async fn transactions(
    State(state): State<AppState>,
    Path(id): Path<i32>,
) -> ApiResult<SupplyTransactions> {
    let audit = state.services.ledger.verify(id).await?;
    let entries = state.services.ledger.history(id).await?;
    Ok(Json(ApiResponse::success(SupplyTransactions { entries, audit })))
}

#[utoipa::path(
    get,
    path = "/api/v1/supplies/{id}/token",
    params(("id" = i32, Path, description = "Supply id")),
    responses((status = 200, description = "Scanner token for the supply label")),
    tag = "supplies"
)]
pub async fn supply_token(
    State(state): State<AppState>,
    Path(id): Path<i32>,
) -> ApiResult<TokenResponse> {
    // unknown supplies are 404
    state.services.supplies.get(id).await?;
    Ok(Json(ApiResponse::success(TokenResponse {
        token: ScanToken::for_supply(id).to_string(),
    })))
}

#[utoipa::path(
    get,
    path = "/api/v1/supplies/{id}/instances",
    params(("id" = i32, Path, description = "Supply id")),
    responses((status = 200, description = "Instances of the supply")),
    tag = "instances"
)]
pub async fn list_instances(
    State(state): State<AppState>,
    Path(id): Path<i32>,
) -> ApiResult<Vec<equipment_instance::Model>> {
    Ok(Json(ApiResponse::success(
        state.services.supplies.list_instances(id).await?,
    )))
}

#[utoipa::path(
    post,
    path = "/api/v1/supplies/{id}/instances",
    params(("id" = i32, Path, description = "Supply id")),
    request_body = CreateInstanceInput,
    responses(
        (status = 200, description = "Instance registered"),
        (status = 409, description = "Duplicate instance code", body = crate::errors::ErrorResponse)
    ),
    tag = "instances"
)]
pub async fn create_instance(
    State(state): State<AppState>,
    _actor: Actor,
    Path(id): Path<i32>,
    Json(payload): Json<CreateInstanceInput>,
) -> ApiResult<equipment_instance::Model> {
    let created = state.services.supplies.create_instance(id, payload).await?;
    Ok(Json(ApiResponse::success(created)))
}

#[utoipa::path(
    post,
    path = "/api/v1/supplies/{id}/instances/bulk",
    params(("id" = i32, Path, description = "Supply id")),
    request_body = BulkCreateInstancesInput,
    responses((status = 200, description = "Instances registered with sequential codes")),
    tag = "instances"
)]
pub async fn bulk_create_instances(
    State(state): State<AppState>,
    _actor: Actor,
    Path(id): Path<i32>,
    Json(payload): Json<BulkCreateInstancesInput>,
) -> ApiResult<Vec<equipment_instance::Model>> {
    let created = state
        .services
        .supplies
        .bulk_create_instances(id, payload)
        .await?;
    Ok(Json(ApiResponse::success(created)))
}
