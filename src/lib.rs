//! Supplyroom API Library
//!
//! Stock and equipment loan tracking: a stock ledger, the request lifecycle,
//! loan tracking with status reconciliation, batch operations and the QR
//! scanner gateway.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

pub mod auth;
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod handlers;
pub mod identifiers;
pub mod middleware_helpers;
pub mod migrator;
pub mod openapi;
pub mod services;
pub mod tracing;

use axum::{
    extract::State,
    response::Json,
    routing::{get, post, put},
    Router,
};
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use utoipa::ToSchema;

use crate::db::DbPool;

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DbPool>,
    pub config: config::AppConfig,
    pub event_sender: Arc<events::EventSender>,
    pub services: handlers::AppServices,
}

impl AppState {
    pub fn new(db: Arc<DbPool>, config: config::AppConfig, event_sender: events::EventSender) -> Self {
        let event_sender = Arc::new(event_sender);
        let services = handlers::AppServices::new(db.clone(), event_sender.clone(), &config);
        Self {
            db,
            config,
            event_sender,
            services,
        }
    }
}

// Common response wrappers
#[derive(Serialize, ToSchema)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub message: Option<String>,
    pub errors: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<ResponseMeta>,
}

#[derive(Serialize, ToSchema)]
pub struct ResponseMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub timestamp: String,
}

impl ResponseMeta {
    fn capture() -> Self {
        Self {
            request_id: crate::tracing::current_request_id().map(|rid| rid.as_str().to_string()),
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: None,
            errors: None,
            meta: Some(ResponseMeta::capture()),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            message: Some(message),
            errors: None,
            meta: Some(ResponseMeta::capture()),
        }
    }
}

#[cfg(test)]
mod response_tests {
    use super::*;
    use chrono::DateTime;

    #[tokio::test]
    async fn success_response_includes_request_metadata() {
        let response =
            crate::tracing::scope_request_id(crate::tracing::RequestId::new("meta-123"), async {
                ApiResponse::success("ok")
            })
            .await;

        let meta = response.meta.expect("metadata expected");
        assert_eq!(meta.request_id.as_deref(), Some("meta-123"));
        DateTime::parse_from_rfc3339(&meta.timestamp).expect("timestamp should parse");
    }

    #[tokio::test]
    async fn error_response_includes_request_metadata() {
        let response =
            crate::tracing::scope_request_id(crate::tracing::RequestId::new("meta-err"), async {
                ApiResponse::<()>::error("oops".into())
            })
            .await;

        assert!(!response.success);
        assert_eq!(response.message.as_deref(), Some("oops"));
        let meta = response.meta.expect("metadata expected");
        assert_eq!(meta.request_id.as_deref(), Some("meta-err"));
    }

    #[test]
    fn metadata_omits_request_id_outside_a_request() {
        let response = ApiResponse::success(1);
        let meta = response.meta.expect("metadata expected");
        assert!(meta.request_id.is_none());
    }
}

/// Standard API result type for JSON responses
pub type ApiResult<T> = Result<Json<ApiResponse<T>>, errors::ServiceError>;

pub fn api_v1_routes() -> Router<AppState> {
    let supplies = Router::new()
        .route(
            "/",
            get(handlers::supplies::list_supplies).post(handlers::supplies::create_supply),
        )
        .route("/low-stock", get(handlers::supplies::low_stock))
        .route(
            "/:id",
            get(handlers::supplies::get_supply)
                .put(handlers::supplies::update_supply)
                .delete(handlers::supplies::delete_supply),
        )
        .route("/:id/restock", post(handlers::supplies::restock))
        .route("/:id/transactions", get(handlers::supplies::transactions))
        .route("/:id/token", get(handlers::supplies::supply_token))
        .route(
            "/:id/instances",
            get(handlers::supplies::list_instances).post(handlers::supplies::create_instance),
        )
        .route(
            "/:id/instances/bulk",
            post(handlers::supplies::bulk_create_instances),
        );

    let instances = Router::new()
        .route(
            "/:id",
            get(handlers::instances::get_instance).put(handlers::instances::update_instance),
        )
        .route("/:id/status", put(handlers::instances::set_instance_status));

    let requests = Router::new()
        .route(
            "/",
            get(handlers::requests::list_requests).post(handlers::requests::create_request),
        )
        .route("/batch", post(handlers::requests::create_batch))
        .route("/:id", get(handlers::requests::get_request))
        .route("/:id/approve", post(handlers::requests::approve_request))
        .route("/:id/reject", post(handlers::requests::reject_request))
        .route("/:id/release", post(handlers::requests::release_request));

    let batches = Router::new()
        .route("/:batch_id", get(handlers::batches::get_batch))
        .route("/:batch_id/approve", post(handlers::batches::approve_batch))
        .route("/:batch_id/reject", post(handlers::batches::reject_batch))
        .route("/:batch_id/release", post(handlers::batches::release_batch))
        .route("/:batch_id/return", post(handlers::batches::return_batch));

    let loans = Router::new()
        .route("/", get(handlers::loans::list_loans))
        .route("/overdue", get(handlers::loans::overdue_loans))
        .route("/bulk-delete", post(handlers::loans::bulk_delete_loans))
        .route("/:id", get(handlers::loans::get_loan))
        .route("/:id/return", post(handlers::loans::return_loan))
        .route("/:id/extend", post(handlers::loans::extend_loan));

    Router::new()
        .route("/status", get(api_status))
        .route("/health", get(health_check))
        .nest("/supplies", supplies)
        .nest("/instances", instances)
        .nest("/requests", requests)
        .nest("/batches", batches)
        .nest("/loans", loans)
        .route("/scanner", post(handlers::scanner::scan))
        .route("/scanner/recent", get(handlers::scanner::recent_scans))
        .route("/admin/reconcile", post(handlers::admin::reconcile))
}

/// Full application router: the v1 API, the OpenAPI document, HTTP tracing
/// and request ids. CORS is layered on by the binary.
pub fn app_router(state: AppState) -> Router {
    Router::new()
        .nest("/api/v1", api_v1_routes())
        .merge(openapi::openapi_routes())
        .layer(crate::tracing::configure_http_tracing())
        .layer(axum::middleware::from_fn(
            middleware_helpers::request_id_middleware,
        ))
        .with_state(state)
}

async fn api_status(State(state): State<AppState>) -> ApiResult<Value> {
    Ok(Json(ApiResponse::success(json!({
        "status": "ok",
        "service": "supplyroom-api",
        "version": env!("CARGO_PKG_VERSION"),
        "environment": state.config.environment,
        "timestamp": Utc::now().to_rfc3339(),
    }))))
}

async fn health_check(State(state): State<AppState>) -> ApiResult<Value> {
    let db_status = match db::check_connection(&state.db).await {
        Ok(()) => "healthy",
        Err(_) => "unhealthy",
    };

    Ok(Json(ApiResponse::success(json!({
        "status": db_status,
        "checks": { "database": db_status },
        "timestamp": Utc::now().to_rfc3339(),
    }))))
}
