use chrono::{Duration, NaiveDate, Utc};
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, Condition, ConnectionTrait, EntityTrait,
    PaginatorTrait, QueryFilter, QueryOrder, Set, SqlErr, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use utoipa::{IntoParams, ToSchema};
use validator::Validate;

use crate::{
    auth::Actor,
    db::DbPool,
    entities::{
        borrowed_item::{self, Entity as BorrowedItem},
        supply,
        supply_request::{self, Entity as SupplyRequest},
        InstanceStatus, RequestStatus, ReturnStatus, TransactionType,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    services::{
        allocator::{self, Allocation},
        append_note,
        ledger::{self, LedgerEntry, LedgerReference, StockMovement},
        reconciler, today, MemberResult,
    },
};

#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct ReturnLoanInput {
    pub return_status: ReturnStatus,
    #[validate(length(max = 1000))]
    pub note: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct ExtendDeadlineInput {
    pub new_deadline: NaiveDate,
    #[validate(length(max = 1000))]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, IntoParams, ToSchema)]
#[into_params(parameter_in = Query)]
pub struct LoanFilter {
    pub borrower_id: Option<i32>,
    /// `true` for open loans only, `false` for closed loans only
    pub outstanding: Option<bool>,
    pub overdue: Option<bool>,
    pub request_id: Option<i32>,
    pub batch_group_id: Option<String>,
    pub supply_id: Option<i32>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ReturnOutcome {
    pub loan: borrowed_item::Model,
    /// Ledger row written for the return (credit or write-off)
    pub ledger_entry: LedgerEntry,
    /// Status of the owning request after recomputation
    pub request_status: Option<RequestStatus>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct BulkDeleteReport {
    pub deleted: usize,
    pub results: Vec<MemberResult>,
}

/// Creates the loan rows for a release inside the caller's transaction.
///
/// One row per allocated instance, plus one block row for any units no
/// instance covers, so every debited unit is on a loan.
pub(crate) async fn open_loans<C>(
    conn: &C,
    request: &supply_request::Model,
    supply: &supply::Model,
    allocation: &Allocation,
    default_borrow_days: u32,
) -> Result<Vec<borrowed_item::Model>, ServiceError>
where
    C: ConnectionTrait,
{
    let borrowed_date = today();
    let days = request
        .borrow_duration_days
        .filter(|d| *d > 0)
        .map(i64::from)
        .unwrap_or_else(|| i64::from(default_borrow_days));
    let return_deadline = borrowed_date + Duration::days(days);
    let note = allocation.substitution_note();

    let mut loans = Vec::with_capacity(allocation.instances.len() + 1);

    for instance in &allocation.instances {
        let row = borrowed_item::ActiveModel {
            supply_id: Set(request.supply_id),
            equipment_instance_id: Set(Some(instance.id)),
            supply_request_id: Set(Some(request.id)),
            borrower_id: Set(request.user_id),
            borrowed_quantity: Set(1),
            borrowed_date: Set(borrowed_date),
            return_deadline: Set(Some(return_deadline)),
            location_when_borrowed: Set(instance.location.clone().or_else(|| supply.location.clone())),
            notes: Set(note.clone()),
            batch_group_id: Set(request.batch_group_id.clone()),
            ..Default::default()
        };
        let loan = row.insert(conn).await.map_err(|e| match e.sql_err() {
            Some(SqlErr::UniqueConstraintViolation(_)) => ServiceError::Conflict(format!(
                "instance {} already has an outstanding loan",
                instance.instance_code
            )),
            _ => ServiceError::from(e),
        })?;
        loans.push(loan);
    }

    let uncovered = allocation.uncovered_units();
    if uncovered > 0 {
        let row = borrowed_item::ActiveModel {
            supply_id: Set(request.supply_id),
            equipment_instance_id: Set(None),
            supply_request_id: Set(Some(request.id)),
            borrower_id: Set(request.user_id),
            borrowed_quantity: Set(uncovered),
            borrowed_date: Set(borrowed_date),
            return_deadline: Set(Some(return_deadline)),
            location_when_borrowed: Set(supply.location.clone()),
            notes: Set(note),
            batch_group_id: Set(request.batch_group_id.clone()),
            ..Default::default()
        };
        loans.push(row.insert(conn).await?);
    }

    Ok(loans)
}

/// Whether `user_id` holds an outstanding loan past its deadline.
pub async fn has_overdue<C>(conn: &C, user_id: i32, on: NaiveDate) -> Result<bool, ServiceError>
where
    C: ConnectionTrait,
{
    let count = BorrowedItem::find()
        .filter(borrowed_item::Column::BorrowerId.eq(user_id))
        .filter(borrowed_item::Column::ReturnedAt.is_null())
        .filter(borrowed_item::Column::ReturnDeadline.lt(on))
        .count(conn)
        .await?;
    Ok(count > 0)
}

pub async fn outstanding_for_instance<C>(
    conn: &C,
    instance_id: i32,
) -> Result<Option<borrowed_item::Model>, ServiceError>
where
    C: ConnectionTrait,
{
    Ok(BorrowedItem::find()
        .filter(borrowed_item::Column::EquipmentInstanceId.eq(instance_id))
        .filter(borrowed_item::Column::ReturnedAt.is_null())
        .order_by_asc(borrowed_item::Column::Id)
        .one(conn)
        .await?)
}

pub async fn for_request<C>(
    conn: &C,
    request_id: i32,
) -> Result<Vec<borrowed_item::Model>, ServiceError>
where
    C: ConnectionTrait,
{
    Ok(BorrowedItem::find()
        .filter(borrowed_item::Column::SupplyRequestId.eq(request_id))
        .order_by_asc(borrowed_item::Column::Id)
        .all(conn)
        .await?)
}

pub async fn for_batch<C>(
    conn: &C,
    batch_group_id: &str,
) -> Result<Vec<borrowed_item::Model>, ServiceError>
where
    C: ConnectionTrait,
{
    Ok(BorrowedItem::find()
        .filter(borrowed_item::Column::BatchGroupId.eq(batch_group_id))
        .order_by_asc(borrowed_item::Column::Id)
        .all(conn)
        .await?)
}

/// Loan tracking: returns, deadline extensions and queries.
#[derive(Clone)]
pub struct LoanService {
    db_pool: Arc<DbPool>,
    event_sender: Arc<EventSender>,
}

impl LoanService {
    pub fn new(db_pool: Arc<DbPool>, event_sender: Arc<EventSender>) -> Self {
        Self {
            db_pool,
            event_sender,
        }
    }

    pub async fn get(&self, loan_id: i32) -> Result<borrowed_item::Model, ServiceError> {
        BorrowedItem::find_by_id(loan_id)
            .one(self.db_pool.as_ref())
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Loan {} not found", loan_id)))
    }

    /// Closes an outstanding loan.
    ///
    /// `returned` frees the instance and credits the units back to stock;
    /// `damaged` sends the instance to maintenance and `lost` retires it, both
    /// with a zero-delta write-off. A second return of the same loan fails
    /// with `AlreadyProcessed` and changes nothing.
    #[instrument(skip(self, input))]
    pub async fn process_return(
        &self,
        loan_id: i32,
        input: ReturnLoanInput,
        actor: Actor,
    ) -> Result<ReturnOutcome, ServiceError> {
        input.validate()?;
        let outcome = input.return_status;

        let txn = self.db_pool.begin().await?;
        let loan = BorrowedItem::find_by_id(loan_id)
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Loan {} not found", loan_id)))?;

        if !loan.is_outstanding() {
            return Err(ServiceError::AlreadyProcessed(format!(
                "loan {} was already returned",
                loan_id
            )));
        }

        let now = Utc::now();
        let notes = append_note(
            loan.notes.as_deref(),
            actor,
            now,
            &outcome.to_string(),
            input.note.as_deref(),
        );

        // only an open loan can be closed
        let closed = BorrowedItem::update_many()
            .col_expr(borrowed_item::Column::ReturnedAt, Expr::value(now))
            .col_expr(borrowed_item::Column::ReturnStatus, Expr::value(outcome))
            .col_expr(borrowed_item::Column::Notes, Expr::value(notes))
            .filter(borrowed_item::Column::Id.eq(loan_id))
            .filter(borrowed_item::Column::ReturnedAt.is_null())
            .exec(&txn)
            .await?;
        if closed.rows_affected != 1 {
            return Err(ServiceError::AlreadyProcessed(format!(
                "loan {} was already returned",
                loan_id
            )));
        }

        if let Some(instance_id) = loan.equipment_instance_id {
            let status = match outcome {
                ReturnStatus::Returned => InstanceStatus::Available,
                ReturnStatus::Damaged => InstanceStatus::Maintenance,
                ReturnStatus::Lost => InstanceStatus::Retired,
            };
            allocator::set_status(&txn, instance_id, status).await?;
        }

        let reference = Some(LedgerReference::loan(loan.id));
        let ledger_entry = match outcome {
            ReturnStatus::Returned => {
                ledger::apply_delta(
                    &txn,
                    StockMovement {
                        supply_id: loan.supply_id,
                        delta: loan.borrowed_quantity,
                        transaction_type: TransactionType::In,
                        reason: format!("Loan #{} returned", loan.id),
                        reference,
                        performed_by: actor,
                    },
                )
                .await?
            }
            ReturnStatus::Damaged | ReturnStatus::Lost => {
                let transaction_type = if outcome == ReturnStatus::Damaged {
                    TransactionType::Damaged
                } else {
                    TransactionType::Lost
                };
                ledger::write_off(
                    &txn,
                    loan.supply_id,
                    loan.borrowed_quantity,
                    transaction_type,
                    format!("Loan #{} returned {}", loan.id, outcome),
                    reference,
                    actor,
                )
                .await?
            }
        };

        let request_status = match loan.supply_request_id {
            Some(request_id) => {
                reconciler::recompute(&txn, request_id).await?;
                SupplyRequest::find_by_id(request_id)
                    .one(&txn)
                    .await?
                    .map(|r| r.status)
            }
            None => None,
        };

        let loan = BorrowedItem::find_by_id(loan_id)
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::InternalError(format!("loan {} vanished", loan_id)))?;
        txn.commit().await?;

        info!(
            loan_id,
            outcome = %outcome,
            request_status = ?request_status,
            "loan returned"
        );
        self.event_sender
            .publish(Event::LoanReturned {
                loan_id,
                request_id: loan.supply_request_id,
                outcome,
                performed_by: actor.id,
            })
            .await;
        self.event_sender
            .publish(Event::StockAdjusted {
                supply_id: ledger_entry.supply_id,
                transaction_id: ledger_entry.id,
                transaction_type: ledger_entry.transaction_type,
                previous_quantity: ledger_entry.previous_quantity,
                new_quantity: ledger_entry.new_quantity,
            })
            .await;

        Ok(ReturnOutcome {
            loan,
            ledger_entry,
            request_status,
        })
    }

    #[instrument(skip(self, input))]
    pub async fn extend_deadline(
        &self,
        loan_id: i32,
        input: ExtendDeadlineInput,
        actor: Actor,
    ) -> Result<borrowed_item::Model, ServiceError> {
        input.validate()?;

        let txn = self.db_pool.begin().await?;
        let loan = BorrowedItem::find_by_id(loan_id)
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Loan {} not found", loan_id)))?;

        if !loan.is_outstanding() {
            return Err(ServiceError::InvalidOperation(format!(
                "loan {} is closed",
                loan_id
            )));
        }
        if input.new_deadline < loan.borrowed_date {
            return Err(ServiceError::InvalidInput(format!(
                "deadline {} is before the borrow date {}",
                input.new_deadline, loan.borrowed_date
            )));
        }

        let previous = loan
            .return_deadline
            .map(|d| d.to_string())
            .unwrap_or_else(|| "none".to_string());
        let detail = match input.reason.as_deref().map(str::trim) {
            Some(reason) if !reason.is_empty() => {
                format!("{} -> {} ({})", previous, input.new_deadline, reason)
            }
            _ => format!("{} -> {}", previous, input.new_deadline),
        };
        let notes = append_note(
            loan.notes.as_deref(),
            actor,
            Utc::now(),
            "extended",
            Some(&detail),
        );

        let mut active: borrowed_item::ActiveModel = loan.into();
        active.return_deadline = Set(Some(input.new_deadline));
        active.notes = Set(Some(notes));
        let updated = active.update(&txn).await?;
        txn.commit().await?;

        info!(loan_id, new_deadline = %input.new_deadline, "loan deadline extended");
        Ok(updated)
    }

    pub async fn list(&self, filter: LoanFilter) -> Result<Vec<borrowed_item::Model>, ServiceError> {
        let mut condition = Condition::all();
        if let Some(borrower_id) = filter.borrower_id {
            condition = condition.add(borrowed_item::Column::BorrowerId.eq(borrower_id));
        }
        if let Some(request_id) = filter.request_id {
            condition = condition.add(borrowed_item::Column::SupplyRequestId.eq(request_id));
        }
        if let Some(supply_id) = filter.supply_id {
            condition = condition.add(borrowed_item::Column::SupplyId.eq(supply_id));
        }
        if let Some(batch) = filter.batch_group_id {
            condition = condition.add(borrowed_item::Column::BatchGroupId.eq(batch));
        }
        match filter.outstanding {
            Some(true) => condition = condition.add(borrowed_item::Column::ReturnedAt.is_null()),
            Some(false) => {
                condition = condition.add(borrowed_item::Column::ReturnedAt.is_not_null())
            }
            None => {}
        }
        let on = today();
        match filter.overdue {
            Some(true) => {
                condition = condition
                    .add(borrowed_item::Column::ReturnedAt.is_null())
                    .add(borrowed_item::Column::ReturnDeadline.lt(on));
            }
            Some(false) => {
                condition = condition.add(
                    Condition::any()
                        .add(borrowed_item::Column::ReturnedAt.is_not_null())
                        .add(borrowed_item::Column::ReturnDeadline.is_null())
                        .add(borrowed_item::Column::ReturnDeadline.gte(on)),
                );
            }
            None => {}
        }

        Ok(BorrowedItem::find()
            .filter(condition)
            .order_by_asc(borrowed_item::Column::Id)
            .all(self.db_pool.as_ref())
            .await?)
    }

    /// Outstanding loans whose deadline is before `on`, oldest deadline first.
    pub async fn overdue(&self, on: NaiveDate) -> Result<Vec<borrowed_item::Model>, ServiceError> {
        Ok(BorrowedItem::find()
            .filter(borrowed_item::Column::ReturnedAt.is_null())
            .filter(borrowed_item::Column::ReturnDeadline.lt(on))
            .order_by_asc(borrowed_item::Column::ReturnDeadline)
            .order_by_asc(borrowed_item::Column::Id)
            .all(self.db_pool.as_ref())
            .await?)
    }

    pub async fn has_overdue(&self, user_id: i32, on: NaiveDate) -> Result<bool, ServiceError> {
        has_overdue(self.db_pool.as_ref(), user_id, on).await
    }

    /// Administrative removal of loan rows.
    ///
    /// An outstanding loan is reversed first: its units are credited back
    /// with an `adjustment` row and its instance is freed. Owning requests
    /// are recomputed afterwards. Each id runs in its own transaction.
    #[instrument(skip(self))]
    pub async fn bulk_delete(
        &self,
        loan_ids: Vec<i32>,
        actor: Actor,
    ) -> Result<BulkDeleteReport, ServiceError> {
        if loan_ids.is_empty() {
            return Err(ServiceError::InvalidInput(
                "no loan ids given".to_string(),
            ));
        }

        let mut results = Vec::with_capacity(loan_ids.len());
        for loan_id in loan_ids {
            match self.delete_one(loan_id, actor).await {
                Ok(()) => results.push(MemberResult::succeeded(loan_id, "deleted")),
                Err(e) => {
                    warn!(loan_id, error = %e, "loan deletion failed");
                    results.push(MemberResult::failed(loan_id, None, &e));
                }
            }
        }

        let deleted = results.iter().filter(|r| r.ok).count();
        info!(deleted, attempted = results.len(), "bulk loan deletion finished");
        Ok(BulkDeleteReport { deleted, results })
    }

    async fn delete_one(&self, loan_id: i32, actor: Actor) -> Result<(), ServiceError> {
        let txn = self.db_pool.begin().await?;
        let loan = BorrowedItem::find_by_id(loan_id)
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Loan {} not found", loan_id)))?;

        if loan.is_outstanding() {
            ledger::apply_delta(
                &txn,
                StockMovement {
                    supply_id: loan.supply_id,
                    delta: loan.borrowed_quantity,
                    transaction_type: TransactionType::Adjustment,
                    reason: format!("Outstanding loan #{} deleted", loan.id),
                    reference: Some(LedgerReference::loan(loan.id)),
                    performed_by: actor,
                },
            )
            .await?;
            if let Some(instance_id) = loan.equipment_instance_id {
                allocator::set_status(&txn, instance_id, InstanceStatus::Available).await?;
            }
        }

        BorrowedItem::delete_by_id(loan.id).exec(&txn).await?;
        if let Some(request_id) = loan.supply_request_id {
            reconciler::recompute(&txn, request_id).await?;
        }
        txn.commit().await?;
        Ok(())
    }
}
