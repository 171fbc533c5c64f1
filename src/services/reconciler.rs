//! Derives a released request's status from its loans.
//!
//! `recompute` is called synchronously after every return and every loan
//! deletion; `reconcile_all` is the same function applied to every request,
//! plus detection of the inconsistencies it must not silently patch.

use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use utoipa::ToSchema;

use crate::{
    db::DbPool,
    entities::{
        borrowed_item::{self, Entity as BorrowedItem},
        supply::Entity as Supply,
        supply_request::{self, Entity as SupplyRequest},
        RequestKind, RequestStatus,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    services::ledger::{self, LedgerAudit},
};

/// Status a released-or-later request should have given its loans, or
/// `None` when the loans say nothing (no loans, or not yet released).
pub fn derive_status(
    current: RequestStatus,
    loans: &[borrowed_item::Model],
) -> Option<RequestStatus> {
    if !current.is_released_or_later() || loans.is_empty() {
        return None;
    }

    let outstanding = loans.iter().filter(|l| l.is_outstanding()).count();
    let derived = if outstanding == 0 {
        let with_issues = loans
            .iter()
            .any(|l| l.return_status.map_or(false, |s| s.is_issue()));
        if with_issues {
            RequestStatus::ReturnedWithIssues
        } else {
            RequestStatus::Returned
        }
    } else if outstanding < loans.len() {
        RequestStatus::PartiallyReturned
    } else {
        RequestStatus::Released
    };
    Some(derived)
}

/// Recomputes and persists the status of `request_id`. Returns the new
/// status when it changed. Idempotent.
pub async fn recompute<C>(conn: &C, request_id: i32) -> Result<Option<RequestStatus>, ServiceError>
where
    C: ConnectionTrait,
{
    let Some(request) = SupplyRequest::find_by_id(request_id).one(conn).await? else {
        return Ok(None);
    };

    let loans = BorrowedItem::find()
        .filter(borrowed_item::Column::SupplyRequestId.eq(request_id))
        .all(conn)
        .await?;

    match derive_status(request.status, &loans) {
        Some(derived) if derived != request.status => {
            let mut active: supply_request::ActiveModel = request.into();
            active.status = Set(derived);
            active.update(conn).await?;
            Ok(Some(derived))
        }
        _ => Ok(None),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct StatusChange {
    pub request_id: i32,
    pub from: RequestStatus,
    pub to: RequestStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct RelinkedLoan {
    pub loan_id: i32,
    pub request_id: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct DuplicateOutstanding {
    pub equipment_instance_id: i32,
    pub loan_ids: Vec<i32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct ReconciliationReport {
    pub relinked: Vec<RelinkedLoan>,
    /// Unlinked loans with zero or several candidate requests
    pub ambiguous_loans: Vec<i32>,
    pub status_changes: Vec<StatusChange>,
    pub duplicate_outstanding: Vec<DuplicateOutstanding>,
    pub ledger_mismatches: Vec<LedgerAudit>,
    /// Released loan requests left without a single loan row, typically
    /// after their loans were deleted. Their status is kept as is.
    pub loanless_requests: Vec<i32>,
}

impl ReconciliationReport {
    pub fn is_clean(&self) -> bool {
        self.relinked.is_empty()
            && self.status_changes.is_empty()
            && self.duplicate_outstanding.is_empty()
            && self.ledger_mismatches.is_empty()
    }
}

/// Repair pass over the whole store room.
#[derive(Clone)]
pub struct Reconciler {
    db_pool: Arc<DbPool>,
    event_sender: Arc<EventSender>,
}

impl Reconciler {
    pub fn new(db_pool: Arc<DbPool>, event_sender: Arc<EventSender>) -> Self {
        Self {
            db_pool,
            event_sender,
        }
    }

    /// Relinks orphaned loans, recomputes every released request and reports
    /// duplicate outstanding loans and ledger drift. Safe to run repeatedly.
    #[instrument(skip(self))]
    pub async fn reconcile_all(&self) -> Result<ReconciliationReport, ServiceError> {
        let mut report = ReconciliationReport::default();

        let txn = self.db_pool.begin().await?;
        self.relink_orphans(&txn, &mut report).await?;

        let released = SupplyRequest::find()
            .filter(supply_request::Column::Status.is_in([
                RequestStatus::Released,
                RequestStatus::PartiallyReturned,
                RequestStatus::Returned,
                RequestStatus::ReturnedWithIssues,
            ]))
            .order_by_asc(supply_request::Column::Id)
            .all(&txn)
            .await?;

        for request in released {
            if request.kind == RequestKind::Loan {
                let loans = BorrowedItem::find()
                    .filter(borrowed_item::Column::SupplyRequestId.eq(request.id))
                    .count(&txn)
                    .await?;
                if loans == 0 {
                    warn!(
                        request_id = request.id,
                        status = %request.status,
                        "released loan request has no loans"
                    );
                    report.loanless_requests.push(request.id);
                }
            }

            let from = request.status;
            if let Some(to) = recompute(&txn, request.id).await? {
                warn!(request_id = request.id, from = %from, to = %to, "request status corrected");
                report.status_changes.push(StatusChange {
                    request_id: request.id,
                    from,
                    to,
                });
            }
        }
        txn.commit().await?;

        let db = self.db_pool.as_ref();
        report.duplicate_outstanding = duplicate_outstanding(db).await?;
        for dup in &report.duplicate_outstanding {
            error!(
                equipment_instance_id = dup.equipment_instance_id,
                loans = ?dup.loan_ids,
                "instance has more than one outstanding loan"
            );
        }

        for supply in Supply::find().all(db).await? {
            let audit = ledger::audit(db, &supply).await?;
            if !audit.consistent {
                error!(
                    supply_id = audit.supply_id,
                    stored = audit.stored,
                    replayed = audit.replayed,
                    "ledger replay disagrees with stored quantity"
                );
                report.ledger_mismatches.push(audit);
            }
        }

        for change in &report.status_changes {
            self.event_sender
                .publish(Event::ReconciliationDrift {
                    request_id: change.request_id,
                    from: change.from,
                    to: change.to,
                    detected_at: Utc::now(),
                })
                .await;
        }

        info!(
            relinked = report.relinked.len(),
            status_changes = report.status_changes.len(),
            duplicates = report.duplicate_outstanding.len(),
            ledger_mismatches = report.ledger_mismatches.len(),
            loanless = report.loanless_requests.len(),
            "reconciliation pass finished"
        );
        Ok(report)
    }

    async fn relink_orphans<C>(
        &self,
        conn: &C,
        report: &mut ReconciliationReport,
    ) -> Result<(), ServiceError>
    where
        C: ConnectionTrait,
    {
        let orphans = BorrowedItem::find()
            .filter(borrowed_item::Column::SupplyRequestId.is_null())
            .order_by_asc(borrowed_item::Column::Id)
            .all(conn)
            .await?;

        for loan in orphans {
            let mut query = SupplyRequest::find()
                .filter(supply_request::Column::UserId.eq(loan.borrower_id))
                .filter(supply_request::Column::SupplyId.eq(loan.supply_id))
                .filter(supply_request::Column::Kind.eq(RequestKind::Loan));
            query = match &loan.batch_group_id {
                Some(batch) => query.filter(supply_request::Column::BatchGroupId.eq(batch.clone())),
                None => query.filter(supply_request::Column::BatchGroupId.is_null()),
            };
            let candidates: Vec<_> = query
                .all(conn)
                .await?
                .into_iter()
                .filter(|r| r.status.is_released_or_later())
                .collect();

            if let [request] = candidates.as_slice() {
                warn!(loan_id = loan.id, request_id = request.id, "relinking orphaned loan");
                report.relinked.push(RelinkedLoan {
                    loan_id: loan.id,
                    request_id: request.id,
                });
                let mut active: borrowed_item::ActiveModel = loan.into();
                active.supply_request_id = Set(Some(request.id));
                active.update(conn).await?;
            } else {
                report.ambiguous_loans.push(loan.id);
            }
        }
        Ok(())
    }
}

async fn duplicate_outstanding<C>(conn: &C) -> Result<Vec<DuplicateOutstanding>, ServiceError>
where
    C: ConnectionTrait,
{
    let outstanding = BorrowedItem::find()
        .filter(borrowed_item::Column::ReturnedAt.is_null())
        .filter(borrowed_item::Column::EquipmentInstanceId.is_not_null())
        .order_by_asc(borrowed_item::Column::Id)
        .all(conn)
        .await?;

    let mut by_instance: BTreeMap<i32, Vec<i32>> = BTreeMap::new();
    for loan in outstanding {
        if let Some(instance_id) = loan.equipment_instance_id {
            by_instance.entry(instance_id).or_default().push(loan.id);
        }
    }

    Ok(by_instance
        .into_iter()
        .filter(|(_, loans)| loans.len() > 1)
        .map(|(equipment_instance_id, loan_ids)| DuplicateOutstanding {
            equipment_instance_id,
            loan_ids,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::ReturnStatus;
    use chrono::NaiveDate;

    fn loan(id: i32, returned: Option<ReturnStatus>) -> borrowed_item::Model {
        let now = Utc::now();
        borrowed_item::Model {
            id,
            supply_id: 1,
            equipment_instance_id: Some(id),
            supply_request_id: Some(1),
            borrower_id: 1,
            borrowed_quantity: 1,
            borrowed_date: NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
            return_deadline: None,
            returned_at: returned.map(|_| now),
            return_status: returned,
            location_when_borrowed: None,
            notes: None,
            batch_group_id: None,
            created_at: now,
        }
    }

    #[test]
    fn status_follows_loans() {
        use RequestStatus as Req;
        use ReturnStatus as Ret;

        assert_eq!(derive_status(Req::Released, &[]), None);
        assert_eq!(derive_status(Req::Approved, &[loan(1, None)]), None);

        assert_eq!(
            derive_status(Req::Released, &[loan(1, None), loan(2, None)]),
            Some(Req::Released)
        );
        assert_eq!(
            derive_status(Req::Released, &[loan(1, Some(Ret::Damaged)), loan(2, None)]),
            Some(Req::PartiallyReturned)
        );
        assert_eq!(
            derive_status(
                Req::PartiallyReturned,
                &[loan(1, Some(Ret::Damaged)), loan(2, Some(Ret::Returned))]
            ),
            Some(Req::ReturnedWithIssues)
        );
        assert_eq!(
            derive_status(
                Req::Released,
                &[loan(1, Some(Ret::Returned)), loan(2, Some(Ret::Returned))]
            ),
            Some(Req::Returned)
        );
        assert_eq!(
            derive_status(Req::Released, &[loan(1, Some(Ret::Lost))]),
            Some(Req::ReturnedWithIssues)
        );
    }
}
