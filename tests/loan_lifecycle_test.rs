mod common;

use assert_matches::assert_matches;
use chrono::{Duration, Utc};
use common::{TestApp, BORROWER, CLERK, OTHER_BORROWER};
use rstest::rstest;
use std::collections::HashSet;
use supplyroom_api::{
    entities::{InstanceStatus, RequestKind, RequestStatus, ReturnStatus, TransactionType},
    errors::ServiceError,
    services::{
        ledger::RestockInput,
        loans::{ExtendDeadlineInput, LoanFilter, ReturnLoanInput},
        requests::{BatchLineInput, CreateBatchInput, CreateRequestInput, RequestFilter},
        supplies::{SetInstanceStatusInput, UpdateInstanceInput, UpdateSupplyInput},
    },
};

fn returned_as(status: ReturnStatus) -> ReturnLoanInput {
    ReturnLoanInput {
        return_status: status,
        note: None,
    }
}

#[tokio::test]
async fn laptop_loan_runs_from_release_to_returned_with_issues() {
    let app = TestApp::new().await;
    let laptops = app.equipment("Laptop", 5, 3).await;

    let request = app.approved(BORROWER, laptops.id, RequestKind::Loan, 2).await;
    let released = app
        .services()
        .requests
        .release(request.id, CLERK)
        .await
        .expect("release");

    assert_eq!(released.request.status, RequestStatus::Released);
    assert_eq!(released.request.released_by, Some(CLERK.id));
    assert_eq!(released.loans.len(), 2);
    assert_eq!(released.shortfall, 0);
    assert_eq!(released.ledger_entry.transaction_type, TransactionType::Out);
    assert_eq!(released.ledger_entry.quantity, -2);
    assert_eq!(app.stock(laptops.id).await, 3);

    let borrowed: Vec<_> = app
        .instances(laptops.id)
        .await
        .into_iter()
        .filter(|i| i.status == InstanceStatus::Borrowed)
        .collect();
    assert_eq!(borrowed.len(), 2);
    for loan in &released.loans {
        assert_eq!(loan.borrower_id, BORROWER.id);
        assert_eq!(loan.borrowed_quantity, 1);
        assert_eq!(
            loan.return_deadline,
            Some(loan.borrowed_date + Duration::days(3))
        );
    }

    let first = &released.loans[0];
    let damaged = app
        .services()
        .loans
        .process_return(first.id, returned_as(ReturnStatus::Damaged), BORROWER)
        .await
        .expect("damaged return");
    assert_eq!(damaged.request_status, Some(RequestStatus::PartiallyReturned));
    assert_eq!(damaged.ledger_entry.transaction_type, TransactionType::Damaged);
    assert_eq!(damaged.ledger_entry.quantity, 0);
    assert_eq!(app.stock(laptops.id).await, 3);

    let second = &released.loans[1];
    let returned = app
        .services()
        .loans
        .process_return(second.id, returned_as(ReturnStatus::Returned), BORROWER)
        .await
        .expect("clean return");
    assert_eq!(returned.request_status, Some(RequestStatus::ReturnedWithIssues));
    assert_eq!(returned.ledger_entry.transaction_type, TransactionType::In);
    assert_eq!(app.stock(laptops.id).await, 4);

    let damaged_instance = app
        .services()
        .supplies
        .get_instance(first.equipment_instance_id.expect("tracked loan"))
        .await
        .expect("instance");
    assert_eq!(damaged_instance.instance.status, InstanceStatus::Maintenance);
    assert!(damaged_instance.current_loan.is_none());

    let audit = app.services().ledger.verify(laptops.id).await.expect("audit");
    assert!(audit.consistent);
}

#[tokio::test]
async fn second_return_of_a_loan_is_already_processed() {
    let app = TestApp::new().await;
    let laptops = app.equipment("Laptop", 2, 2).await;
    let request = app.approved(BORROWER, laptops.id, RequestKind::Loan, 1).await;
    let released = app
        .services()
        .requests
        .release(request.id, CLERK)
        .await
        .expect("release");
    let loan_id = released.loans[0].id;

    app.services()
        .loans
        .process_return(loan_id, returned_as(ReturnStatus::Returned), BORROWER)
        .await
        .expect("first return");
    let stock_after_first = app.stock(laptops.id).await;

    let err = app
        .services()
        .loans
        .process_return(loan_id, returned_as(ReturnStatus::Lost), BORROWER)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::AlreadyProcessed(_));
    assert_eq!(app.stock(laptops.id).await, stock_after_first);

    let loan = app.services().loans.get(loan_id).await.expect("loan");
    assert_eq!(loan.return_status, Some(ReturnStatus::Returned));
}

#[tokio::test]
async fn release_beyond_stock_changes_nothing() {
    let app = TestApp::new().await;
    let paper = app.consumable("Printer paper", 3, 0).await;
    let request = app
        .approved(BORROWER, paper.id, RequestKind::Consumption, 10)
        .await;

    let err = app
        .services()
        .requests
        .release(request.id, CLERK)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::InsufficientStock(_));

    assert_eq!(app.stock(paper.id).await, 3);
    assert_eq!(app.request_row(request.id).await.status, RequestStatus::Approved);
    let history = app.services().ledger.history(paper.id).await.expect("history");
    assert_eq!(history.len(), 1, "only the opening stock row");
}

#[tokio::test]
async fn consumption_release_debits_without_opening_loans() {
    let app = TestApp::new().await;
    let paper = app.consumable("Printer paper", 10, 2).await;
    let request = app
        .approved(BORROWER, paper.id, RequestKind::Consumption, 8)
        .await;

    let released = app
        .services()
        .requests
        .release(request.id, CLERK)
        .await
        .expect("release");
    assert!(released.loans.is_empty());
    assert!(released.low_stock);
    assert_eq!(app.stock(paper.id).await, 2);

    let again = app
        .services()
        .requests
        .release(request.id, CLERK)
        .await
        .unwrap_err();
    assert_matches!(again, ServiceError::AlreadyProcessed(_));
    assert_eq!(app.stock(paper.id).await, 2);
}

#[tokio::test]
async fn pending_request_cannot_be_released() {
    let app = TestApp::new().await;
    let paper = app.consumable("Printer paper", 10, 0).await;
    let request = app.submit(BORROWER, paper.id, RequestKind::Consumption, 1).await;

    let err = app
        .services()
        .requests
        .release(request.id, CLERK)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::InvalidStatus(_));
}

#[tokio::test]
async fn rejected_request_records_reason_and_stays_rejected() {
    let app = TestApp::new().await;
    let paper = app.consumable("Printer paper", 10, 0).await;
    let request = app.submit(BORROWER, paper.id, RequestKind::Consumption, 1).await;

    let rejected = app
        .services()
        .requests
        .reject(
            request.id,
            supplyroom_api::services::requests::RejectInput {
                reason: Some("  budget frozen ".to_string()),
            },
            CLERK,
        )
        .await
        .expect("reject");
    assert_eq!(rejected.status, RequestStatus::Rejected);
    assert_eq!(rejected.rejected_reason.as_deref(), Some("budget frozen"));

    let err = app
        .services()
        .requests
        .approve(request.id, CLERK)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::InvalidStatus(_));
}

#[tokio::test]
async fn untracked_loan_covers_units_with_one_block_loan() {
    let app = TestApp::new().await;
    let cables = app.equipment("HDMI cable", 6, 0).await;
    let request = app.approved(BORROWER, cables.id, RequestKind::Loan, 4).await;

    let released = app
        .services()
        .requests
        .release(request.id, CLERK)
        .await
        .expect("release");
    assert_eq!(released.shortfall, 0);
    assert_eq!(released.loans.len(), 1);
    assert_eq!(released.loans[0].borrowed_quantity, 4);
    assert!(released.loans[0].equipment_instance_id.is_none());

    app.services()
        .loans
        .process_return(released.loans[0].id, returned_as(ReturnStatus::Returned), BORROWER)
        .await
        .expect("return");
    assert_eq!(app.stock(cables.id).await, 6);
    assert_eq!(app.request_row(request.id).await.status, RequestStatus::Returned);
}

#[tokio::test]
async fn borrower_with_overdue_loan_is_refused() {
    let app = TestApp::new().await;
    let laptops = app.equipment("Laptop", 3, 3).await;
    let paper = app.consumable("Printer paper", 10, 0).await;

    let request = app.approved(BORROWER, laptops.id, RequestKind::Loan, 1).await;
    let released = app
        .services()
        .requests
        .release(request.id, CLERK)
        .await
        .expect("release");
    app.make_overdue(&released.loans[0], 2).await;

    let overdue = app
        .services()
        .loans
        .overdue(Utc::now().date_naive())
        .await
        .expect("overdue");
    assert_eq!(overdue.len(), 1);

    let err = app
        .services()
        .requests
        .create(
            CreateRequestInput {
                supply_id: laptops.id,
                kind: RequestKind::Loan,
                quantity_requested: 1,
                purpose: "second laptop".to_string(),
                equipment_instance_id: None,
                borrow_duration_days: None,
            },
            BORROWER,
        )
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::InvalidOperation(_));

    // consumption and other borrowers are unaffected
    app.submit(BORROWER, paper.id, RequestKind::Consumption, 1).await;
    app.submit(OTHER_BORROWER, laptops.id, RequestKind::Loan, 1).await;
}

#[tokio::test]
async fn extending_a_deadline_clears_overdue() {
    let app = TestApp::new().await;
    let laptops = app.equipment("Laptop", 1, 1).await;
    let request = app.approved(BORROWER, laptops.id, RequestKind::Loan, 1).await;
    let released = app
        .services()
        .requests
        .release(request.id, CLERK)
        .await
        .expect("release");
    app.make_overdue(&released.loans[0], 1).await;

    let new_deadline = Utc::now().date_naive() + Duration::days(7);
    let extended = app
        .services()
        .loans
        .extend_deadline(
            released.loans[0].id,
            ExtendDeadlineInput {
                new_deadline,
                reason: Some("conference".to_string()),
            },
            CLERK,
        )
        .await
        .expect("extend");
    assert_eq!(extended.return_deadline, Some(new_deadline));
    assert!(extended.notes.as_deref().unwrap_or_default().contains("conference"));

    let still_overdue = app
        .services()
        .loans
        .has_overdue(BORROWER.id, Utc::now().date_naive())
        .await
        .expect("overdue check");
    assert!(!still_overdue);
}

#[tokio::test]
async fn deleting_an_outstanding_loan_restores_stock_and_instance() {
    let app = TestApp::new().await;
    let laptops = app.equipment("Laptop", 2, 2).await;
    let request = app.approved(BORROWER, laptops.id, RequestKind::Loan, 1).await;
    let released = app
        .services()
        .requests
        .release(request.id, CLERK)
        .await
        .expect("release");
    let loan = &released.loans[0];
    assert_eq!(app.stock(laptops.id).await, 1);

    let report = app
        .services()
        .loans
        .bulk_delete(vec![loan.id, 9999], CLERK)
        .await
        .expect("bulk delete");
    assert_eq!(report.deleted, 1);
    assert!(report.results[0].ok);
    assert_eq!(report.results[1].error_code.as_deref(), Some("not_found"));

    assert_eq!(app.stock(laptops.id).await, 2);
    let instance = app
        .services()
        .supplies
        .get_instance(loan.equipment_instance_id.expect("tracked loan"))
        .await
        .expect("instance");
    assert_eq!(instance.instance.status, InstanceStatus::Available);

    let remaining = app
        .services()
        .loans
        .list(LoanFilter {
            request_id: Some(request.id),
            ..Default::default()
        })
        .await
        .expect("list loans");
    assert!(remaining.is_empty());
    assert!(app.services().ledger.verify(laptops.id).await.expect("audit").consistent);

    let report = app.services().reconciler.reconcile_all().await.expect("reconcile");
    assert_eq!(report.loanless_requests, vec![request.id]);
    assert!(report.status_changes.is_empty());
    assert_eq!(app.request_row(request.id).await.status, RequestStatus::Released);
}

#[tokio::test]
async fn restock_appends_an_in_row() {
    let app = TestApp::new().await;
    let paper = app.consumable("Printer paper", 1, 0).await;

    let entry = app
        .services()
        .ledger
        .restock(
            paper.id,
            RestockInput {
                quantity: 24,
                reason: Some("monthly order".to_string()),
            },
            CLERK,
        )
        .await
        .expect("restock");
    assert_eq!(entry.transaction_type, TransactionType::In);
    assert_eq!(entry.previous_quantity, 1);
    assert_eq!(entry.new_quantity, 25);
    assert_eq!(app.stock(paper.id).await, 25);
}

#[tokio::test]
async fn racing_releases_debit_stock_once() {
    let app = TestApp::new().await;
    let paper = app.consumable("Printer paper", 5, 0).await;
    let request = app
        .approved(BORROWER, paper.id, RequestKind::Consumption, 3)
        .await;

    let requests = &app.services().requests;
    let outcomes =
        futures::future::join_all((0..4).map(|_| requests.release(request.id, CLERK))).await;

    let succeeded = outcomes.iter().filter(|r| r.is_ok()).count();
    assert_eq!(succeeded, 1);
    for failure in outcomes.into_iter().filter_map(|r| r.err()) {
        assert_matches!(failure, ServiceError::AlreadyProcessed(_));
    }
    assert_eq!(app.stock(paper.id).await, 2);
}

#[rstest]
#[case::returned(ReturnStatus::Returned, InstanceStatus::Available, TransactionType::In, 2)]
#[case::damaged(ReturnStatus::Damaged, InstanceStatus::Maintenance, TransactionType::Damaged, 1)]
#[case::lost(ReturnStatus::Lost, InstanceStatus::Retired, TransactionType::Lost, 1)]
#[tokio::test]
async fn return_outcome_decides_instance_status_and_stock(
    #[case] outcome: ReturnStatus,
    #[case] instance_status: InstanceStatus,
    #[case] transaction_type: TransactionType,
    #[case] stock_after: i32,
) {
    let app = TestApp::new().await;
    let laptops = app.equipment("Laptop", 2, 2).await;
    let request = app.approved(BORROWER, laptops.id, RequestKind::Loan, 1).await;
    let released = app
        .services()
        .requests
        .release(request.id, CLERK)
        .await
        .expect("release");
    let loan = &released.loans[0];

    let done = app
        .services()
        .loans
        .process_return(loan.id, returned_as(outcome), BORROWER)
        .await
        .expect("return");
    assert_eq!(done.ledger_entry.transaction_type, transaction_type);
    assert_eq!(done.loan.return_status, Some(outcome));
    assert_eq!(app.stock(laptops.id).await, stock_after);

    let instance = app
        .services()
        .supplies
        .get_instance(loan.equipment_instance_id.expect("tracked loan"))
        .await
        .expect("instance");
    assert_eq!(instance.instance.status, instance_status);
}

#[tokio::test]
async fn instance_codes_and_administrative_status() {
    let app = TestApp::new().await;
    let laptops = app.equipment("Laptop", 2, 2).await;
    let codes: Vec<String> = app
        .instances(laptops.id)
        .await
        .into_iter()
        .map(|i| i.instance_code)
        .collect();
    assert_eq!(codes, vec!["LAP-001".to_string(), "LAP-002".to_string()]);

    let request = app.approved(BORROWER, laptops.id, RequestKind::Loan, 1).await;
    let released = app
        .services()
        .requests
        .release(request.id, CLERK)
        .await
        .expect("release");
    let on_loan = released.loans[0].equipment_instance_id.expect("tracked loan");
    let idle = app
        .instances(laptops.id)
        .await
        .into_iter()
        .find(|i| i.id != on_loan)
        .expect("idle instance");

    let set = |status| SetInstanceStatusInput { status, note: None };
    let err = app
        .services()
        .supplies
        .set_instance_status(on_loan, set(InstanceStatus::Maintenance), CLERK)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::InvalidOperation(_));

    let err = app
        .services()
        .supplies
        .set_instance_status(idle.id, set(InstanceStatus::Borrowed), CLERK)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::InvalidOperation(_));

    let retired = app
        .services()
        .supplies
        .set_instance_status(idle.id, set(InstanceStatus::Retired), CLERK)
        .await
        .expect("retire");
    assert_eq!(retired.status, InstanceStatus::Retired);

    let details = app.services().supplies.get(laptops.id).await.expect("supply");
    assert_eq!(details.total_instances, 2);
    assert_eq!(details.available_instances, 0);
}

fn request_for(supply_id: i32, kind: RequestKind, quantity: i32) -> CreateRequestInput {
    CreateRequestInput {
        supply_id,
        kind,
        quantity_requested: quantity,
        purpose: "lab session".to_string(),
        equipment_instance_id: None,
        borrow_duration_days: None,
    }
}

#[tokio::test]
async fn request_kind_must_match_the_supply() {
    let app = TestApp::new().await;
    let paper = app.consumable("Printer paper", 10, 0).await;
    let laptops = app.equipment("Laptop", 2, 2).await;
    let requests = &app.services().requests;

    let err = requests
        .create(request_for(paper.id, RequestKind::Loan, 1), BORROWER)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::InvalidInput(_));

    let err = requests
        .create(request_for(laptops.id, RequestKind::Consumption, 1), BORROWER)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::InvalidInput(_));

    let err = requests
        .create_batch(
            CreateBatchInput {
                kind: RequestKind::Loan,
                purpose: "workshop".to_string(),
                borrow_duration_days: None,
                lines: vec![
                    BatchLineInput {
                        supply_id: laptops.id,
                        quantity: 1,
                        equipment_instance_id: None,
                    },
                    BatchLineInput {
                        supply_id: paper.id,
                        quantity: 2,
                        equipment_instance_id: None,
                    },
                ],
            },
            BORROWER,
        )
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::InvalidInput(_));

    let stored = requests
        .list(RequestFilter {
            user_id: Some(BORROWER.id),
            ..Default::default()
        })
        .await
        .expect("list requests");
    assert!(stored.is_empty());
    assert_eq!(app.stock(paper.id).await, 10);
}

#[tokio::test]
async fn named_instance_is_released_alone() {
    let app = TestApp::new().await;
    let laptops = app.equipment("Laptop", 3, 3).await;
    let wanted = app
        .instances(laptops.id)
        .await
        .into_iter()
        .find(|i| i.instance_code == "LAP-003")
        .expect("LAP-003");

    let named = |quantity| CreateRequestInput {
        equipment_instance_id: Some(wanted.id),
        ..request_for(laptops.id, RequestKind::Loan, quantity)
    };
    let requests = &app.services().requests;

    let err = requests.create(named(3), BORROWER).await.unwrap_err();
    assert_matches!(err, ServiceError::InvalidInput(_));

    let request = requests.create(named(1), BORROWER).await.expect("create");
    requests.approve(request.id, CLERK).await.expect("approve");
    let released = requests.release(request.id, CLERK).await.expect("release");

    assert_eq!(released.allocated_instances, vec!["LAP-003".to_string()]);
    assert_eq!(released.substituted_for, None);
    assert_eq!(released.loans.len(), 1);
    assert_eq!(released.loans[0].equipment_instance_id, Some(wanted.id));
    assert_eq!(app.stock(laptops.id).await, 2);

    let available = app
        .instances(laptops.id)
        .await
        .into_iter()
        .filter(|i| i.status == InstanceStatus::Available)
        .count();
    assert_eq!(available, 2);
}

#[tokio::test]
async fn concurrent_releases_never_share_an_instance() {
    let app = TestApp::new().await;
    let laptops = app.equipment("Laptop", 4, 4).await;

    let mut approved = Vec::new();
    for borrower in [BORROWER, OTHER_BORROWER] {
        approved.push(app.approved(borrower, laptops.id, RequestKind::Loan, 2).await);
    }

    let requests = &app.services().requests;
    let outcomes = futures::future::join_all(
        approved.iter().map(|request| requests.release(request.id, CLERK)),
    )
    .await;

    let mut seen = HashSet::new();
    let mut total = 0;
    for outcome in outcomes {
        let released = outcome.expect("both releases succeed");
        assert_eq!(released.shortfall, 0);
        for loan in &released.loans {
            total += 1;
            seen.insert(loan.equipment_instance_id.expect("tracked loan"));
        }
    }
    assert_eq!(total, 4);
    assert_eq!(seen.len(), 4);
    assert_eq!(app.stock(laptops.id).await, 0);

    let report = app.services().reconciler.reconcile_all().await.expect("reconcile");
    assert!(report.duplicate_outstanding.is_empty());
}

#[tokio::test]
async fn supply_edit_leaves_quantity_to_the_ledger() {
    let app = TestApp::new().await;
    let laptops = app.equipment("Laptop", 3, 1).await;

    let updated = app
        .services()
        .supplies
        .update_supply(
            laptops.id,
            UpdateSupplyInput {
                name: Some("  Laptop 14in ".to_string()),
                min_stock_level: Some(2),
                location: Some(String::new()),
                ..Default::default()
            },
        )
        .await
        .expect("update supply");
    assert_eq!(updated.name, "Laptop 14in");
    assert_eq!(updated.min_stock_level, 2);
    assert_eq!(updated.location, None);
    assert_eq!(updated.unit, "pcs");
    assert_eq!(updated.quantity, 3);
    assert!(app.services().ledger.verify(laptops.id).await.expect("audit").consistent);

    let instance = app.instances(laptops.id).await.remove(0);
    let edited = app
        .services()
        .supplies
        .update_instance(
            instance.id,
            UpdateInstanceInput {
                serial_number: Some("SN-4411".to_string()),
                model: Some("T14".to_string()),
                ..Default::default()
            },
        )
        .await
        .expect("update instance");
    assert_eq!(edited.serial_number.as_deref(), Some("SN-4411"));
    assert_eq!(edited.model.as_deref(), Some("T14"));
    assert_eq!(edited.brand.as_deref(), Some("Acme"));
    assert_eq!(edited.instance_code, instance.instance_code);
    assert_eq!(edited.status, InstanceStatus::Available);
}

#[tokio::test]
async fn supply_delete_waits_for_loans_and_live_requests() {
    let app = TestApp::new().await;
    let laptops = app.equipment("Laptop", 2, 2).await;
    let supplies = &app.services().supplies;

    let pending = app.submit(BORROWER, laptops.id, RequestKind::Loan, 1).await;
    let err = supplies.delete_supply(laptops.id).await.unwrap_err();
    assert_matches!(err, ServiceError::InvalidOperation(_));

    app.services().requests.approve(pending.id, CLERK).await.expect("approve");
    let released = app
        .services()
        .requests
        .release(pending.id, CLERK)
        .await
        .expect("release");
    let err = supplies.delete_supply(laptops.id).await.unwrap_err();
    assert_matches!(err, ServiceError::InvalidOperation(_));

    app.services()
        .loans
        .process_return(released.loans[0].id, returned_as(ReturnStatus::Returned), BORROWER)
        .await
        .expect("return");
    supplies.delete_supply(laptops.id).await.expect("delete supply");

    let err = supplies.get(laptops.id).await.unwrap_err();
    assert_matches!(err, ServiceError::NotFound(_));
    let orphans = app
        .services()
        .requests
        .list(RequestFilter {
            supply_id: Some(laptops.id),
            ..Default::default()
        })
        .await
        .expect("list requests");
    assert!(orphans.is_empty());
}
