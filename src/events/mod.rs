use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::entities::{RequestKind, RequestStatus, ReturnStatus, TransactionType};

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Best-effort publish: a closed or full channel is logged and ignored so
    /// that a committed mutation is never reported as failed.
    pub async fn publish(&self, event: Event) {
        let name = event.name();
        if let Err(e) = self.send(event).await {
            warn!(event = name, error = %e, "dropping domain event");
        }
    }
}

/// Domain events published after a mutation commits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    RequestCreated {
        request_id: i32,
        user_id: i32,
        supply_id: i32,
        kind: RequestKind,
        batch_group_id: Option<String>,
    },
    RequestApproved {
        request_id: i32,
        approved_by: i32,
        co_approved: Vec<i32>,
    },
    RequestRejected {
        request_id: i32,
        rejected_by: i32,
        reason: Option<String>,
    },
    RequestReleased {
        request_id: i32,
        released_by: i32,
        quantity: i32,
        loans: usize,
    },
    AllocationShortfall {
        request_id: i32,
        supply_id: i32,
        requested: i32,
        allocated: i32,
    },
    LoanReturned {
        loan_id: i32,
        request_id: Option<i32>,
        outcome: ReturnStatus,
        performed_by: i32,
    },
    StockAdjusted {
        supply_id: i32,
        transaction_id: i32,
        transaction_type: TransactionType,
        previous_quantity: i32,
        new_quantity: i32,
    },
    LowStock {
        supply_id: i32,
        name: String,
        quantity: i32,
        min_stock_level: i32,
    },
    LoanOverdue {
        loan_id: i32,
        borrower_id: i32,
        supply_id: i32,
        days_overdue: i64,
    },
    ReconciliationDrift {
        request_id: i32,
        from: RequestStatus,
        to: RequestStatus,
        detected_at: DateTime<Utc>,
    },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::RequestCreated { .. } => "request_created",
            Event::RequestApproved { .. } => "request_approved",
            Event::RequestRejected { .. } => "request_rejected",
            Event::RequestReleased { .. } => "request_released",
            Event::AllocationShortfall { .. } => "allocation_shortfall",
            Event::LoanReturned { .. } => "loan_returned",
            Event::StockAdjusted { .. } => "stock_adjusted",
            Event::LowStock { .. } => "low_stock",
            Event::LoanOverdue { .. } => "loan_overdue",
            Event::ReconciliationDrift { .. } => "reconciliation_drift",
        }
    }
}

// Consumes the event channel until every sender is dropped.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        match &event {
            Event::LowStock {
                supply_id,
                name,
                quantity,
                min_stock_level,
            } => {
                warn!(
                    supply_id,
                    quantity,
                    min_stock_level,
                    "Low stock: {} is at or below its minimum level",
                    name
                );
            }
            Event::LoanOverdue {
                loan_id,
                borrower_id,
                days_overdue,
                ..
            } => {
                warn!(loan_id, borrower_id, days_overdue, "Loan overdue");
            }
            Event::AllocationShortfall {
                request_id,
                supply_id,
                requested,
                allocated,
            } => {
                warn!(
                    request_id,
                    supply_id,
                    requested,
                    allocated,
                    "Released with fewer equipment instances than requested"
                );
            }
            Event::ReconciliationDrift {
                request_id, from, to, ..
            } => {
                warn!(request_id, from = %from, to = %to, "Request status corrected by repair pass");
            }
            other => {
                info!(event = other.name(), payload = ?other, "Received event");
            }
        }
    }

    warn!("Event processing loop has ended");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_delivers_to_the_receiver() {
        let (tx, mut rx) = mpsc::channel(4);
        let sender = EventSender::new(tx);
        sender
            .publish(Event::LowStock {
                supply_id: 1,
                name: "Laptop".into(),
                quantity: 1,
                min_stock_level: 2,
            })
            .await;

        let received = rx.recv().await.expect("event");
        assert_eq!(received.name(), "low_stock");
    }

    #[tokio::test]
    async fn publish_swallows_closed_channel() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let sender = EventSender::new(tx);

        assert!(sender
            .send(Event::LoanOverdue {
                loan_id: 1,
                borrower_id: 2,
                supply_id: 3,
                days_overdue: 4,
            })
            .await
            .is_err());
        // Must not panic or block.
        sender
            .publish(Event::LoanOverdue {
                loan_id: 1,
                borrower_id: 2,
                supply_id: 3,
                days_overdue: 4,
            })
            .await;
    }
}
