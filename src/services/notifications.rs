use chrono::NaiveDate;
use metrics::gauge;
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter, QueryOrder};
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use tracing::{debug, info, instrument, warn};
use utoipa::ToSchema;

use crate::{
    db::DbPool,
    entities::{
        borrowed_item::{self, Entity as BorrowedItem},
        supply::{self, Entity as Supply},
    },
    errors::ServiceError,
    events::{Event, EventSender},
    services::today,
};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, ToSchema)]
pub struct SweepSummary {
    pub low_stock: usize,
    pub overdue: usize,
}

/// Periodic digest of low-stock supplies and overdue loans.
#[derive(Clone)]
pub struct NotificationService {
    db_pool: Arc<DbPool>,
    event_sender: Arc<EventSender>,
}

impl NotificationService {
    pub fn new(db_pool: Arc<DbPool>, event_sender: Arc<EventSender>) -> Self {
        Self {
            db_pool,
            event_sender,
        }
    }

    /// Publishes `LowStock` for every supply at or below its minimum and
    /// `LoanOverdue` for every outstanding loan past its deadline on `on`.
    #[instrument(skip(self))]
    pub async fn sweep(&self, on: NaiveDate) -> Result<SweepSummary, ServiceError> {
        let db = self.db_pool.as_ref();

        let low: Vec<supply::Model> = Supply::find()
            .order_by_asc(supply::Column::Id)
            .all(db)
            .await?
            .into_iter()
            .filter(|s| s.is_low_stock())
            .collect();

        let overdue = BorrowedItem::find()
            .filter(borrowed_item::Column::ReturnedAt.is_null())
            .filter(borrowed_item::Column::ReturnDeadline.lt(on))
            .order_by_asc(borrowed_item::Column::Id)
            .all(db)
            .await?;

        for supply in &low {
            self.event_sender
                .publish(Event::LowStock {
                    supply_id: supply.id,
                    name: supply.name.clone(),
                    quantity: supply.quantity,
                    min_stock_level: supply.min_stock_level,
                })
                .await;
        }
        for loan in &overdue {
            self.event_sender
                .publish(Event::LoanOverdue {
                    loan_id: loan.id,
                    borrower_id: loan.borrower_id,
                    supply_id: loan.supply_id,
                    days_overdue: loan.days_overdue(on),
                })
                .await;
        }

        gauge!("supplyroom_notifications.low_stock", low.len() as f64);
        gauge!("supplyroom_notifications.overdue_loans", overdue.len() as f64);

        let summary = SweepSummary {
            low_stock: low.len(),
            overdue: overdue.len(),
        };
        info!(
            low_stock = summary.low_stock,
            overdue = summary.overdue,
            "notification sweep finished"
        );
        Ok(summary)
    }
}

/// Runs [`NotificationService::sweep`] every `interval`. A failed sweep is
/// logged and retried on the next tick.
pub async fn run_notification_sweeper(service: NotificationService, interval: Duration) {
    info!(interval_secs = interval.as_secs(), "starting notification sweeper");
    let mut timer = tokio::time::interval(interval);

    loop {
        timer.tick().await;
        match service.sweep(today()).await {
            Ok(summary) => debug!(?summary, "sweep tick"),
            Err(e) => warn!(error = %e, "notification sweep failed"),
        }
    }
}
