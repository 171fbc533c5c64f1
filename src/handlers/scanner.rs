use axum::{
    extract::{Query, State},
    response::Json,
};

use crate::{
    auth::Actor,
    services::scanner::{RecentScansQuery, ScanFeedEntry, ScanInput, ScanResult},
    ApiResponse, ApiResult, AppState,
};

/// Single entry point for QR scanners.
///
/// `scan` resolves the token, `issue` releases a request or batch and
/// `return` previews the outstanding loans until a `return_status` is sent.
#[utoipa::path(
    post,
    path = "/api/v1/scanner",
    request_body = ScanInput,
    responses(
        (status = 200, description = "Action result"),
        (status = 400, description = "Malformed token or action not valid for it", body = crate::errors::ErrorResponse),
        (status = 404, description = "Token refers to nothing", body = crate::errors::ErrorResponse)
    ),
    tag = "scanner"
)]
pub async fn scan(
    State(state): State<AppState>,
    actor: Actor,
    Json(payload): Json<ScanInput>,
) -> ApiResult<ScanResult> {
    Ok(Json(ApiResponse::success(
        state.services.scanner.handle(payload, actor).await?,
    )))
}

/// The caller's recent scans, batch scans grouped together.
#[utoipa::path(
    get,
    path = "/api/v1/scanner/recent",
    params(RecentScansQuery),
    responses(
        (status = 200, description = "Recent scans, newest first", body = [ScanFeedEntry]),
        (status = 401, description = "Missing actor", body = crate::errors::ErrorResponse)
    ),
    tag = "scanner"
)]
pub async fn recent_scans(
    State(state): State<AppState>,
    actor: Actor,
    Query(query): Query<RecentScansQuery>,
) -> ApiResult<Vec<ScanFeedEntry>> {
    Ok(Json(ApiResponse::success(
        state.services.scanner.recent(actor, query).await?,
    )))
}
