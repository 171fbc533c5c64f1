//! Picks which equipment instances leave the store room on a loan release.

use sea_orm::{
    sea_query::Expr, ColumnTrait, ConnectionTrait, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder,
};
use serde::Serialize;
use tracing::{debug, warn};
use utoipa::ToSchema;

use crate::{
    entities::{
        borrowed_item::{self, Entity as BorrowedItem},
        equipment_instance::{self, Entity as EquipmentInstance},
        InstanceStatus,
    },
    errors::ServiceError,
};

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct Allocation {
    /// Claimed instances, already marked `borrowed`
    pub instances: Vec<equipment_instance::Model>,
    pub requested: i32,
    /// Whether the supply has any equipment instances at all
    pub tracked: bool,
    /// Units that could not be covered by an instance
    pub shortfall: i32,
    /// Code of the preferred instance that was unavailable
    pub substituted_for: Option<String>,
}

impl Allocation {
    pub fn uncovered_units(&self) -> i32 {
        self.requested - self.instances.len() as i32
    }

    /// Loan note recorded when the preferred unit was swapped for another.
    pub fn substitution_note(&self) -> Option<String> {
        self.substituted_for
            .as_ref()
            .map(|code| format!("(Requested {} unavailable)", code))
    }
}

/// Claims up to `count` available instances of `supply_id`.
///
/// A preferred instance is only valid for a single unit and, when available,
/// is allocated alone. Otherwise the lowest available ids win. Each claim is
/// a conditional update from `available` to `borrowed`, so two concurrent
/// allocations can never take the same unit.
/// Fewer instances than requested is not an error: the gap is reported as
/// `shortfall`.
pub async fn allocate<C>(
    conn: &C,
    supply_id: i32,
    count: i32,
    preferred: Option<i32>,
) -> Result<Allocation, ServiceError>
where
    C: ConnectionTrait,
{
    if count < 1 {
        return Err(ServiceError::InvalidInput(
            "allocation count must be at least 1".to_string(),
        ));
    }

    let tracked = EquipmentInstance::find()
        .filter(equipment_instance::Column::SupplyId.eq(supply_id))
        .count(conn)
        .await?
        > 0;

    let mut claimed = Vec::new();
    let mut substituted_for = None;

    if let Some(preferred_id) = preferred {
        if count != 1 {
            return Err(ServiceError::InvalidInput(format!(
                "a preferred instance covers exactly 1 unit, {} requested",
                count
            )));
        }
        let instance = EquipmentInstance::find_by_id(preferred_id)
            .one(conn)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Equipment instance {} not found", preferred_id))
            })?;
        if instance.supply_id != supply_id {
            return Err(ServiceError::InvalidInput(format!(
                "instance {} does not belong to supply {}",
                instance.instance_code, supply_id
            )));
        }

        match try_claim(conn, &instance).await? {
            Some(taken) => {
                return Ok(Allocation {
                    instances: vec![taken],
                    requested: count,
                    tracked,
                    shortfall: 0,
                    substituted_for: None,
                });
            }
            None => {
                debug!(
                    instance = %instance.instance_code,
                    status = %instance.status,
                    "preferred instance unavailable, substituting"
                );
                substituted_for = Some(instance.instance_code.clone());
            }
        }
    }

    let mut query = EquipmentInstance::find()
        .filter(equipment_instance::Column::SupplyId.eq(supply_id))
        .filter(equipment_instance::Column::Status.eq(InstanceStatus::Available))
        .order_by_asc(equipment_instance::Column::Id);
    if let Some(preferred_id) = preferred {
        query = query.filter(equipment_instance::Column::Id.ne(preferred_id));
    }

    for candidate in query.all(conn).await? {
        if claimed.len() as i32 >= count {
            break;
        }
        if let Some(taken) = try_claim(conn, &candidate).await? {
            claimed.push(taken);
        }
    }

    let shortfall = if tracked {
        count - claimed.len() as i32
    } else {
        0
    };

    Ok(Allocation {
        instances: claimed,
        requested: count,
        tracked,
        shortfall,
        substituted_for,
    })
}

async fn try_claim<C>(
    conn: &C,
    instance: &equipment_instance::Model,
) -> Result<Option<equipment_instance::Model>, ServiceError>
where
    C: ConnectionTrait,
{
    if instance.status != InstanceStatus::Available {
        return Ok(None);
    }

    if has_outstanding_loan(conn, instance.id).await? {
        warn!(
            instance = %instance.instance_code,
            "instance marked available but still has an outstanding loan, skipping"
        );
        return Ok(None);
    }

    let result = EquipmentInstance::update_many()
        .col_expr(
            equipment_instance::Column::Status,
            Expr::value(InstanceStatus::Borrowed),
        )
        .col_expr(
            equipment_instance::Column::UpdatedAt,
            Expr::value(chrono::Utc::now()),
        )
        .filter(equipment_instance::Column::Id.eq(instance.id))
        .filter(equipment_instance::Column::Status.eq(InstanceStatus::Available))
        .exec(conn)
        .await?;

    if result.rows_affected != 1 {
        return Ok(None);
    }

    let mut taken = instance.clone();
    taken.status = InstanceStatus::Borrowed;
    Ok(Some(taken))
}

pub async fn has_outstanding_loan<C>(conn: &C, instance_id: i32) -> Result<bool, ServiceError>
where
    C: ConnectionTrait,
{
    let outstanding = BorrowedItem::find()
        .filter(borrowed_item::Column::EquipmentInstanceId.eq(instance_id))
        .filter(borrowed_item::Column::ReturnedAt.is_null())
        .count(conn)
        .await?;
    Ok(outstanding > 0)
}

/// Unconditionally sets an instance's status.
pub async fn set_status<C>(
    conn: &C,
    instance_id: i32,
    status: InstanceStatus,
) -> Result<(), ServiceError>
where
    C: ConnectionTrait,
{
    EquipmentInstance::update_many()
        .col_expr(equipment_instance::Column::Status, Expr::value(status))
        .col_expr(
            equipment_instance::Column::UpdatedAt,
            Expr::value(chrono::Utc::now()),
        )
        .filter(equipment_instance::Column::Id.eq(instance_id))
        .exec(conn)
        .await?;
    Ok(())
}
