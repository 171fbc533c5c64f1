//! Stock ledger.
//!
//! `supplies.quantity` is only ever changed here, and every change appends one
//! `inventory_transactions` row in the same database transaction. The
//! invariant `previous_quantity + quantity == new_quantity` holds for every
//! row, so replaying a supply's rows in id order from zero reproduces its
//! stored quantity.

use chrono::Utc;
use metrics::counter;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter,
    QueryOrder, QuerySelect, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use utoipa::ToSchema;
use validator::Validate;

use crate::{
    auth::Actor,
    db::DbPool,
    entities::{
        inventory_transaction::{self, Entity as InventoryTransaction},
        supply::{self, Entity as Supply},
        TransactionType,
    },
    errors::ServiceError,
    events::{Event, EventSender},
};

/// Re-reads allowed when the compare-and-set on `quantity` loses a race.
const MAX_CAS_ATTEMPTS: usize = 3;

pub type LedgerEntry = inventory_transaction::Model;

/// What a ledger row points back to (a request, a loan, ...).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerReference {
    pub kind: &'static str,
    pub id: i32,
}

impl LedgerReference {
    pub fn request(id: i32) -> Self {
        Self {
            kind: "supply_request",
            id,
        }
    }

    pub fn loan(id: i32) -> Self {
        Self {
            kind: "borrowed_item",
            id,
        }
    }
}

/// One signed change to a supply's on-hand quantity.
#[derive(Debug, Clone)]
pub struct StockMovement {
    pub supply_id: i32,
    pub delta: i32,
    pub transaction_type: TransactionType,
    pub reason: String,
    pub reference: Option<LedgerReference>,
    pub performed_by: Actor,
}

/// Stored quantity compared with the replayed history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct LedgerAudit {
    pub supply_id: i32,
    pub stored: i32,
    pub replayed: i64,
    pub transactions: usize,
    pub consistent: bool,
}

#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct RestockInput {
    #[validate(range(min = 1))]
    pub quantity: i32,
    #[validate(length(max = 500))]
    pub reason: Option<String>,
}

/// Applies `movement` inside the caller's transaction.
///
/// Fails with `InsufficientStock` (and changes nothing) if the result would
/// be negative. The supply row is read under an exclusive lock where the
/// backend supports one, and written with a compare-and-set on the value
/// that was read.
pub async fn apply_delta<C>(conn: &C, movement: StockMovement) -> Result<LedgerEntry, ServiceError>
where
    C: ConnectionTrait,
{
    for attempt in 1..=MAX_CAS_ATTEMPTS {
        let current = Supply::find_by_id(movement.supply_id)
            .lock_exclusive()
            .one(conn)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Supply {} not found", movement.supply_id))
            })?;

        let previous = current.quantity;
        let new_quantity = previous.checked_add(movement.delta).ok_or_else(|| {
            ServiceError::InvalidInput(format!(
                "quantity change {} overflows supply {}",
                movement.delta, current.id
            ))
        })?;

        if new_quantity < 0 {
            return Err(ServiceError::InsufficientStock(format!(
                "{} has {} on hand, {} requested",
                current.name, previous, -movement.delta
            )));
        }

        let updated = Supply::update_many()
            .col_expr(supply::Column::Quantity, Expr::value(new_quantity))
            .col_expr(supply::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(supply::Column::Id.eq(current.id))
            .filter(supply::Column::Quantity.eq(previous))
            .exec(conn)
            .await?;

        if updated.rows_affected != 1 {
            debug!(
                supply_id = current.id,
                attempt, "stock quantity changed underneath us, re-reading"
            );
            continue;
        }

        let entry = record(conn, &movement, previous, new_quantity, 0).await?;
        counter!("supplyroom_ledger.mutations", 1, "type" => movement.transaction_type.to_string());
        debug!(
            supply_id = current.id,
            previous,
            new_quantity,
            transaction_id = entry.id,
            "stock ledger updated"
        );
        return Ok(entry);
    }

    counter!("supplyroom_ledger.cas_conflicts", 1);
    Err(ServiceError::ConcurrentModification(format!(
        "supply {} was modified concurrently",
        movement.supply_id
    )))
}

/// Records a damaged or lost write-off of `units` without touching the
/// on-hand quantity: the units were already debited when they left the
/// store room, so the row is zero-delta with `written_off = units`.
pub async fn write_off<C>(
    conn: &C,
    supply_id: i32,
    units: i32,
    transaction_type: TransactionType,
    reason: String,
    reference: Option<LedgerReference>,
    performed_by: Actor,
) -> Result<LedgerEntry, ServiceError>
where
    C: ConnectionTrait,
{
    if !matches!(
        transaction_type,
        TransactionType::Damaged | TransactionType::Lost
    ) {
        return Err(ServiceError::InvalidInput(format!(
            "write-offs must be damaged or lost, got {}",
            transaction_type
        )));
    }
    if units < 1 {
        return Err(ServiceError::InvalidInput(
            "write-off must cover at least one unit".to_string(),
        ));
    }

    let current = Supply::find_by_id(supply_id)
        .lock_exclusive()
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Supply {} not found", supply_id)))?;

    let movement = StockMovement {
        supply_id,
        delta: 0,
        transaction_type,
        reason,
        reference,
        performed_by,
    };
    let entry = record(conn, &movement, current.quantity, current.quantity, units).await?;
    counter!("supplyroom_ledger.mutations", 1, "type" => transaction_type.to_string());
    Ok(entry)
}

async fn record<C>(
    conn: &C,
    movement: &StockMovement,
    previous: i32,
    new_quantity: i32,
    written_off: i32,
) -> Result<LedgerEntry, ServiceError>
where
    C: ConnectionTrait,
{
    let (reference_type, reference_id) = match &movement.reference {
        Some(r) => (Some(r.kind.to_string()), Some(r.id)),
        None => (None, None),
    };

    let row = inventory_transaction::ActiveModel {
        supply_id: Set(movement.supply_id),
        transaction_type: Set(movement.transaction_type),
        quantity: Set(new_quantity - previous),
        previous_quantity: Set(previous),
        new_quantity: Set(new_quantity),
        written_off: Set(written_off),
        reason: Set(movement.reason.clone()),
        reference_type: Set(reference_type),
        reference_id: Set(reference_id),
        performed_by: Set(movement.performed_by.id),
        ..Default::default()
    };

    Ok(row.insert(conn).await?)
}

/// A supply's ledger rows, oldest first.
pub async fn history<C>(conn: &C, supply_id: i32) -> Result<Vec<LedgerEntry>, ServiceError>
where
    C: ConnectionTrait,
{
    Ok(InventoryTransaction::find()
        .filter(inventory_transaction::Column::SupplyId.eq(supply_id))
        .order_by_asc(inventory_transaction::Column::Id)
        .all(conn)
        .await?)
}

/// Sum of all deltas starting from zero.
pub fn replay(entries: &[LedgerEntry]) -> i64 {
    entries.iter().map(|e| i64::from(e.quantity)).sum()
}

pub async fn audit<C>(conn: &C, supply: &supply::Model) -> Result<LedgerAudit, ServiceError>
where
    C: ConnectionTrait,
{
    let entries = history(conn, supply.id).await?;
    let replayed = replay(&entries);
    Ok(LedgerAudit {
        supply_id: supply.id,
        stored: supply.quantity,
        replayed,
        transactions: entries.len(),
        consistent: replayed == i64::from(supply.quantity),
    })
}

/// Ledger operations that own their transaction.
#[derive(Clone)]
pub struct StockLedger {
    db_pool: Arc<DbPool>,
    event_sender: Arc<EventSender>,
}

impl StockLedger {
    pub fn new(db_pool: Arc<DbPool>, event_sender: Arc<EventSender>) -> Self {
        Self {
            db_pool,
            event_sender,
        }
    }

    /// Adds received stock.
    #[instrument(skip(self, input))]
    pub async fn restock(
        &self,
        supply_id: i32,
        input: RestockInput,
        actor: Actor,
    ) -> Result<LedgerEntry, ServiceError> {
        input.validate()?;

        let txn = self.db_pool.begin().await?;
        let entry = apply_delta(
            &txn,
            StockMovement {
                supply_id,
                delta: input.quantity,
                transaction_type: TransactionType::In,
                reason: input
                    .reason
                    .filter(|r| !r.trim().is_empty())
                    .unwrap_or_else(|| "Restock".to_string()),
                reference: None,
                performed_by: actor,
            },
        )
        .await?;
        txn.commit().await?;

        info!(
            supply_id,
            quantity = input.quantity,
            new_quantity = entry.new_quantity,
            "supply restocked"
        );
        self.event_sender
            .publish(Event::StockAdjusted {
                supply_id,
                transaction_id: entry.id,
                transaction_type: entry.transaction_type,
                previous_quantity: entry.previous_quantity,
                new_quantity: entry.new_quantity,
            })
            .await;

        Ok(entry)
    }

    pub async fn history(&self, supply_id: i32) -> Result<Vec<LedgerEntry>, ServiceError> {
        let db = self.db_pool.as_ref();
        Supply::find_by_id(supply_id)
            .one(db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Supply {} not found", supply_id)))?;
        history(db, supply_id).await
    }

    /// Compares the stored quantity with the replayed history.
    pub async fn verify(&self, supply_id: i32) -> Result<LedgerAudit, ServiceError> {
        let db = self.db_pool.as_ref();
        let supply = Supply::find_by_id(supply_id)
            .one(db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Supply {} not found", supply_id)))?;
        let report = audit(db, &supply).await?;
        if !report.consistent {
            warn!(
                supply_id,
                stored = report.stored,
                replayed = report.replayed,
                "ledger replay disagrees with stored quantity"
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory_pool;
    use crate::entities::supply;
    use sea_orm::DatabaseConnection;

    async fn seed_supply(db: &DatabaseConnection, name: &str) -> supply::Model {
        supply::ActiveModel {
            name: Set(name.to_string()),
            unit: Set("pcs".to_string()),
            quantity: Set(0),
            min_stock_level: Set(1),
            is_consumable: Set(true),
            ..Default::default()
        }
        .insert(db)
        .await
        .unwrap()
    }

    fn movement(supply_id: i32, delta: i32, ty: TransactionType) -> StockMovement {
        StockMovement {
            supply_id,
            delta,
            transaction_type: ty,
            reason: "test".into(),
            reference: None,
            performed_by: Actor::new(1),
        }
    }

    #[tokio::test]
    async fn debit_beyond_stock_is_refused_without_side_effects() {
        let db = memory_pool().await.unwrap();
        let pens = seed_supply(&db, "Pens").await;

        apply_delta(&db, movement(pens.id, 4, TransactionType::In))
            .await
            .unwrap();
        let err = apply_delta(&db, movement(pens.id, -5, TransactionType::Out))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InsufficientStock(_)));

        let stored = Supply::find_by_id(pens.id).one(&db).await.unwrap().unwrap();
        assert_eq!(stored.quantity, 4);
        assert_eq!(history(&db, pens.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn write_off_is_zero_delta() {
        let db = memory_pool().await.unwrap();
        let cams = seed_supply(&db, "Cameras").await;
        apply_delta(&db, movement(cams.id, 3, TransactionType::In))
            .await
            .unwrap();

        let entry = write_off(
            &db,
            cams.id,
            2,
            TransactionType::Lost,
            "lost on field trip".into(),
            Some(LedgerReference::loan(9)),
            Actor::new(2),
        )
        .await
        .unwrap();
        assert_eq!(entry.quantity, 0);
        assert_eq!(entry.previous_quantity, entry.new_quantity);
        assert_eq!(entry.written_off, 2);
        assert_eq!(entry.reference_type.as_deref(), Some("borrowed_item"));

        let err = write_off(
            &db,
            cams.id,
            1,
            TransactionType::Out,
            "nope".into(),
            None,
            Actor::new(2),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn missing_supply_is_not_found() {
        let db = memory_pool().await.unwrap();
        let err = apply_delta(&db, movement(999, 1, TransactionType::In))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
    }

    #[tokio::test]
    async fn audit_matches_after_mixed_history() {
        let db = memory_pool().await.unwrap();
        let paper = seed_supply(&db, "Paper").await;
        for (delta, ty) in [
            (10, TransactionType::In),
            (-3, TransactionType::Out),
            (2, TransactionType::Adjustment),
        ] {
            apply_delta(&db, movement(paper.id, delta, ty)).await.unwrap();
        }
        let paper = Supply::find_by_id(paper.id).one(&db).await.unwrap().unwrap();
        let report = audit(&db, &paper).await.unwrap();
        assert_eq!(report.stored, 9);
        assert_eq!(report.replayed, 9);
        assert!(report.consistent);

        for entry in history(&db, paper.id).await.unwrap() {
            assert_eq!(entry.previous_quantity + entry.quantity, entry.new_quantity);
        }
    }
}
