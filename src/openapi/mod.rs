use axum::{response::Json, routing::get, Router};
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Supplyroom API",
        version = "0.1.0",
        description = r#"
# Supplyroom API

Stock and equipment loan tracking for a shared supply room.

## Actor

Every mutating endpoint requires the `x-actor-id` header carrying the numeric
id of the authenticated user. Requests without it are rejected with `401`.

## Scanner tokens

QR labels carry compact tokens: `SUPPLY-{id}`, `INSTANCE-{id}`,
`BORROW-{req}-{user}-{supply}`, `SUPPLY-REQ-{req}-{user}-{supply}`,
`BORROW-BATCH-{user}-{timestamp}` and `SUPPLY-REQ-BATCH-{user}-{timestamp}`.
Post them to `/api/v1/scanner`.

## Errors

```json
{
  "error": "Unprocessable Entity",
  "message": "...",
  "request_id": "...",
  "timestamp": "2025-01-01T00:00:00Z"
}
```
        "#
    ),
    servers((url = "http://localhost:8080", description = "Local development")),
    tags(
        (name = "supplies", description = "Supply catalogue and stock ledger"),
        (name = "instances", description = "Trackable equipment units"),
        (name = "requests", description = "Request lifecycle"),
        (name = "batches", description = "Bulk operations on a request batch"),
        (name = "loans", description = "Loan tracking and returns"),
        (name = "scanner", description = "QR scanner gateway"),
        (name = "admin", description = "Repair pass")
    ),
    paths(
        crate::handlers::supplies::create_supply,
        crate::handlers::supplies::list_supplies,
        crate::handlers::supplies::low_stock,
        crate::handlers::supplies::get_supply,
        crate::handlers::supplies::update_supply,
        crate::handlers::supplies::delete_supply,
        crate::handlers::supplies::restock,
        crate::handlers::supplies::transactions,
        crate::handlers::supplies::supply_token,
        crate::handlers::supplies::list_instances,
        crate::handlers::supplies::create_instance,
        crate::handlers::supplies::bulk_create_instances,
        crate::handlers::instances::get_instance,
        crate::handlers::instances::update_instance,
        crate::handlers::instances::set_instance_status,
        crate::handlers::requests::create_request,
        crate::handlers::requests::create_batch,
        crate::handlers::requests::list_requests,
        crate::handlers::requests::get_request,
        crate::handlers::requests::approve_request,
        crate::handlers::requests::reject_request,
        crate::handlers::requests::release_request,
        crate::handlers::batches::get_batch,
        crate::handlers::batches::approve_batch,
        crate::handlers::batches::reject_batch,
        crate::handlers::batches::release_batch,
        crate::handlers::batches::return_batch,
        crate::handlers::loans::list_loans,
        crate::handlers::loans::overdue_loans,
        crate::handlers::loans::get_loan,
        crate::handlers::loans::return_loan,
        crate::handlers::loans::extend_loan,
        crate::handlers::loans::bulk_delete_loans,
        crate::handlers::scanner::scan,
        crate::handlers::scanner::recent_scans,
        crate::handlers::admin::reconcile,
    ),
    components(
        schemas(
            crate::entities::supply::Model,
            crate::entities::equipment_instance::Model,
            crate::entities::supply_request::Model,
            crate::entities::borrowed_item::Model,
            crate::entities::inventory_transaction::Model,
            crate::services::supplies::SupplyDetails,
            crate::services::supplies::InstanceDetails,
            crate::services::requests::RequestDetails,
            crate::services::requests::ReleaseOutcome,
            crate::services::batches::BatchReport,
            crate::services::batches::BatchSummary,
            crate::services::loans::ReturnOutcome,
            crate::services::scanner::ScanResult,
            crate::services::scanner::ScanFeedEntry,
            crate::services::reconciler::ReconciliationReport,
            crate::services::MemberResult,
            crate::errors::ErrorResponse
        )
    )
)]
pub struct ApiDocV1;

async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDocV1::openapi())
}

/// Serves the generated document at `/api-docs/openapi.json`.
pub fn openapi_routes<S>() -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    Router::new().route("/api-docs/openapi.json", get(openapi_json))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_lists_the_scanner_and_batch_paths() {
        let json = serde_json::to_string(&ApiDocV1::openapi()).unwrap();
        assert!(json.contains("Supplyroom API"));
        assert!(json.contains("/api/v1/scanner"));
        assert!(json.contains("/api/v1/batches/{batch_id}/return"));
    }
}
