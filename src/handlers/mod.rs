pub mod admin;
pub mod batches;
pub mod instances;
pub mod loans;
pub mod requests;
pub mod scanner;
pub mod supplies;

use std::sync::Arc;

use crate::{
    config::AppConfig,
    db::DbPool,
    events::EventSender,
    services::{
        batches::BatchCoordinator, ledger::StockLedger, loans::LoanService,
        notifications::NotificationService, reconciler::Reconciler, requests::RequestService,
        scanner::ScannerService, supplies::SupplyService,
    },
};

/// Services layer used by the HTTP handlers
#[derive(Clone)]
pub struct AppServices {
    pub supplies: Arc<SupplyService>,
    pub ledger: Arc<StockLedger>,
    pub requests: Arc<RequestService>,
    pub loans: Arc<LoanService>,
    pub batches: Arc<BatchCoordinator>,
    pub reconciler: Arc<Reconciler>,
    pub scanner: Arc<ScannerService>,
    pub notifications: Arc<NotificationService>,
}

impl AppServices {
    pub fn new(db_pool: Arc<DbPool>, event_sender: Arc<EventSender>, config: &AppConfig) -> Self {
        let supplies = SupplyService::new(db_pool.clone(), event_sender.clone());
        let ledger = StockLedger::new(db_pool.clone(), event_sender.clone());
        let requests = RequestService::new(
            db_pool.clone(),
            event_sender.clone(),
            config.default_borrow_days,
        );
        let loans = LoanService::new(db_pool.clone(), event_sender.clone());
        let batches = BatchCoordinator::new(db_pool.clone(), requests.clone(), loans.clone());
        let reconciler = Reconciler::new(db_pool.clone(), event_sender.clone());
        let scanner = ScannerService::new(
            db_pool.clone(),
            supplies.clone(),
            requests.clone(),
            loans.clone(),
            batches.clone(),
        );
        let notifications = NotificationService::new(db_pool, event_sender);

        Self {
            supplies: Arc::new(supplies),
            ledger: Arc::new(ledger),
            requests: Arc::new(requests),
            loans: Arc::new(loans),
            batches: Arc::new(batches),
            reconciler: Arc::new(reconciler),
            scanner: Arc::new(scanner),
            notifications: Arc::new(notifications),
        }
    }
}
