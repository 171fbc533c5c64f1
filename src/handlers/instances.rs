use axum::{
    extract::{Path, State},
    response::Json,
};

use crate::{
    auth::Actor,
    entities::equipment_instance,
    services::supplies::{InstanceDetails, SetInstanceStatusInput, UpdateInstanceInput},
    ApiResponse, ApiResult, AppState,
};

#[utoipa::path(
    get,
    path = "/api/v1/instances/{id}",
    params(("id" = i32, Path, description = "Instance id")),
    responses(
        (status = 200, description = "Instance with its current loan"),
        (status = 404, description = "Not found", body = crate::errors::ErrorResponse)
    ),
    tag = "instances"
)]
pub async fn get_instance(
    State(state): State<AppState>,
    Path(id): Path<i32>,
) -> ApiResult<InstanceDetails> {
    Ok(Json(ApiResponse::success(
        state.services.supplies.get_instance(id).await?,
    )))
}

#[utoipa::path(
    put,
    path = "/api/v1/instances/{id}",
    params(("id" = i32, Path, description = "Instance id")),
    request_body = UpdateInstanceInput,
    responses(
        (status = 200, description = "Instance updated"),
        (status = 404, description = "Not found", body = crate::errors::ErrorResponse)
    ),
    tag = "instances"
)]
pub async fn update_instance(
    State(state): State<AppState>,
    _actor: Actor,
    Path(id): Path<i32>,
    Json(payload): Json<UpdateInstanceInput>,
) -> ApiResult<equipment_instance::Model> {
    let updated = state.services.supplies.update_instance(id, payload).await?;
    Ok(Json(ApiResponse::success(updated)))
}

/// Moves an instance between available, maintenance and retired.
#[utoipa::path(
    put,
    path = "/api/v1/instances/{id}/status",
    params(("id" = i32, Path, description = "Instance id")),
    request_body = SetInstanceStatusInput,
    responses(
        (status = 200, description = "Status changed"),
        (status = 400, description = "Instance is on loan or status not settable", body = crate::errors::ErrorResponse)
    ),
    tag = "instances"
)]
pub async fn set_instance_status(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<i32>,
    Json(payload): Json<SetInstanceStatusInput>,
) -> ApiResult<equipment_instance::Model> {
    let updated = state
        .services
        .supplies
        .set_instance_status(id, payload, actor)
        .await?;
    Ok(Json(ApiResponse::success(updated)))
}
