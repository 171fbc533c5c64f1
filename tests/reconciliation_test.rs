mod common;

use chrono::Utc;
use common::{TestApp, BORROWER, CLERK};
use sea_orm::{ActiveModelTrait, Set};
use supplyroom_api::entities::{borrowed_item, supply_request, RequestKind, RequestStatus};

#[tokio::test]
async fn repair_pass_relinks_orphans_and_corrects_status() {
    let app = TestApp::new().await;
    let laptops = app.equipment("Laptop", 4, 4).await;
    let request = app.approved(BORROWER, laptops.id, RequestKind::Loan, 2).await;
    let released = app
        .services()
        .requests
        .release(request.id, CLERK)
        .await
        .expect("release");

    let orphan = released.loans[0].clone();
    let mut active: borrowed_item::ActiveModel = orphan.clone().into();
    active.supply_request_id = Set(None);
    active.update(app.db()).await.expect("orphan the loan");

    let mut active: supply_request::ActiveModel = app.request_row(request.id).await.into();
    active.status = Set(RequestStatus::Returned);
    active.update(app.db()).await.expect("corrupt the status");

    let report = app
        .services()
        .reconciler
        .reconcile_all()
        .await
        .expect("repair pass");

    assert_eq!(report.relinked.len(), 1);
    assert_eq!(report.relinked[0].loan_id, orphan.id);
    assert_eq!(report.relinked[0].request_id, request.id);
    assert!(report.ambiguous_loans.is_empty());
    assert_eq!(report.status_changes.len(), 1);
    assert_eq!(report.status_changes[0].from, RequestStatus::Returned);
    assert_eq!(report.status_changes[0].to, RequestStatus::Released);
    assert!(report.duplicate_outstanding.is_empty());
    assert!(report.ledger_mismatches.is_empty());

    assert_eq!(app.request_row(request.id).await.status, RequestStatus::Released);
    let relinked = app.services().loans.get(orphan.id).await.expect("loan");
    assert_eq!(relinked.supply_request_id, Some(request.id));

    let second = app
        .services()
        .reconciler
        .reconcile_all()
        .await
        .expect("second pass");
    assert!(second.is_clean());
    assert!(second.relinked.is_empty());
}

#[tokio::test]
async fn orphan_with_two_candidate_requests_is_left_alone() {
    let app = TestApp::new().await;
    let laptops = app.equipment("Laptop", 4, 4).await;

    let mut loans = Vec::new();
    for _ in 0..2 {
        let request = app.approved(BORROWER, laptops.id, RequestKind::Loan, 1).await;
        let released = app
            .services()
            .requests
            .release(request.id, CLERK)
            .await
            .expect("release");
        loans.extend(released.loans);
    }

    let mut active: borrowed_item::ActiveModel = loans[0].clone().into();
    active.supply_request_id = Set(None);
    active.update(app.db()).await.expect("orphan the loan");

    let report = app
        .services()
        .reconciler
        .reconcile_all()
        .await
        .expect("repair pass");
    assert!(report.relinked.is_empty());
    assert_eq!(report.ambiguous_loans, vec![loans[0].id]);

    let still_orphaned = app.services().loans.get(loans[0].id).await.expect("loan");
    assert_eq!(still_orphaned.supply_request_id, None);
}

#[tokio::test]
async fn ledger_drift_is_reported() {
    let app = TestApp::new().await;
    let paper = app.consumable("Printer paper", 10, 0).await;

    let mut active: supplyroom_api::entities::supply::ActiveModel = paper.clone().into();
    active.quantity = Set(7);
    active.update(app.db()).await.expect("edit quantity behind the ledger");

    let report = app
        .services()
        .reconciler
        .reconcile_all()
        .await
        .expect("repair pass");
    assert_eq!(report.ledger_mismatches.len(), 1);
    assert_eq!(report.ledger_mismatches[0].stored, 7);
    assert_eq!(report.ledger_mismatches[0].replayed, 10);
    assert!(!report.is_clean());
}

#[tokio::test]
async fn sweep_counts_low_stock_and_overdue_loans() {
    let app = TestApp::new().await;
    app.consumable("Printer paper", 2, 5).await;
    app.consumable("Pens", 50, 5).await;
    let laptops = app.equipment("Laptop", 2, 2).await;

    let request = app.approved(BORROWER, laptops.id, RequestKind::Loan, 1).await;
    let released = app
        .services()
        .requests
        .release(request.id, CLERK)
        .await
        .expect("release");
    app.make_overdue(&released.loans[0], 4).await;

    let summary = app
        .services()
        .notifications
        .sweep(Utc::now().date_naive())
        .await
        .expect("sweep");
    assert_eq!(summary.low_stock, 1);
    assert_eq!(summary.overdue, 1);

    let low = app.services().supplies.low_stock().await.expect("low stock");
    assert_eq!(low.len(), 1);
    assert_eq!(low[0].name, "Printer paper");
}
