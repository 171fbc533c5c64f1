use axum::{extract::State, response::Json};
use tracing::info;

use crate::{
    auth::Actor, services::reconciler::ReconciliationReport, ApiResponse, ApiResult, AppState,
};

/// Runs the repair pass over loans and request statuses.
#[utoipa::path(
    post,
    path = "/api/v1/admin/reconcile",
    responses((status = 200, description = "Repair report")),
    tag = "admin"
)]
pub async fn reconcile(
    State(state): State<AppState>,
    actor: Actor,
) -> ApiResult<ReconciliationReport> {
    info!(actor = %actor, "repair pass requested");
    let report = state.services.reconciler.reconcile_all().await?;
    Ok(Json(ApiResponse::success(report)))
}
