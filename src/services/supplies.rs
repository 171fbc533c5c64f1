use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, ConnectionTrait, EntityTrait, PaginatorTrait,
    QueryFilter, QueryOrder, Set, SqlErr, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument};
use utoipa::{IntoParams, ToSchema};
use validator::Validate;

use crate::{
    auth::Actor,
    db::DbPool,
    entities::{
        borrowed_item::{self, Entity as BorrowedItem},
        equipment_instance::{self, Entity as EquipmentInstance},
        supply::{self, Entity as Supply},
        supply_request::{self, Entity as SupplyRequest},
        InstanceStatus, RequestStatus, TransactionType,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    identifiers::ScanToken,
    services::{
        allocator, append_note,
        ledger::{self, StockMovement},
        loans,
    },
};

const DEFAULT_CODE_PREFIX: &str = "EQP";
const MAX_BULK_INSTANCES: u32 = 500;

#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct CreateSupplyInput {
    #[validate(length(min = 1, max = 200))]
    pub name: String,
    #[validate(length(min = 1, max = 32))]
    pub unit: String,
    /// Opening stock, recorded as the first ledger row
    #[serde(default)]
    #[validate(range(min = 0))]
    pub quantity: i32,
    #[serde(default)]
    #[validate(range(min = 0))]
    pub min_stock_level: i32,
    #[serde(default = "default_true")]
    pub is_consumable: bool,
    #[validate(length(max = 200))]
    pub location: Option<String>,
    #[validate(length(max = 2000))]
    pub description: Option<String>,
}

fn default_true() -> bool {
    true
}

/// Master-data edit. Quantity is not editable here; it only moves through
/// the ledger. An empty `location` or `description` clears it.
#[derive(Debug, Clone, Default, Deserialize, Validate, ToSchema)]
pub struct UpdateSupplyInput {
    #[validate(length(min = 1, max = 200))]
    pub name: Option<String>,
    #[validate(length(min = 1, max = 32))]
    pub unit: Option<String>,
    #[validate(range(min = 0))]
    pub min_stock_level: Option<i32>,
    #[validate(length(max = 200))]
    pub location: Option<String>,
    #[validate(length(max = 2000))]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, IntoParams, ToSchema)]
#[into_params(parameter_in = Query)]
pub struct SupplyFilter {
    /// Substring of the name
    pub search: Option<String>,
    pub is_consumable: Option<bool>,
    pub low_stock: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct CreateInstanceInput {
    #[validate(length(min = 1, max = 64))]
    pub instance_code: String,
    #[validate(length(max = 100))]
    pub brand: Option<String>,
    #[validate(length(max = 100))]
    pub model: Option<String>,
    #[validate(length(max = 100))]
    pub serial_number: Option<String>,
    #[validate(length(max = 200))]
    pub location: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct BulkCreateInstancesInput {
    #[validate(range(min = 1, max = 500))]
    pub count: u32,
    /// Code prefix; derived from the supply name when omitted
    #[validate(length(min = 1, max = 16))]
    pub prefix: Option<String>,
    pub brand: Option<String>,
    pub model: Option<String>,
    pub location: Option<String>,
}

/// Descriptive fields of an instance. Empty strings clear a field.
#[derive(Debug, Clone, Default, Deserialize, Validate, ToSchema)]
pub struct UpdateInstanceInput {
    #[validate(length(max = 100))]
    pub brand: Option<String>,
    #[validate(length(max = 100))]
    pub model: Option<String>,
    #[validate(length(max = 100))]
    pub serial_number: Option<String>,
    #[validate(length(max = 200))]
    pub location: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct SetInstanceStatusInput {
    pub status: InstanceStatus,
    #[validate(length(max = 1000))]
    pub note: Option<String>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct SupplyDetails {
    pub supply: supply::Model,
    pub total_instances: u64,
    pub available_instances: u64,
    pub low_stock: bool,
    pub token: String,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct InstanceDetails {
    pub instance: equipment_instance::Model,
    pub current_loan: Option<borrowed_item::Model>,
    pub token: String,
}

/// Code prefix derived from a supply name: first three letters or digits,
/// upper-cased, whitespace ignored.
pub fn default_code_prefix(name: &str) -> String {
    let prefix: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(3)
        .collect::<String>()
        .to_ascii_uppercase();
    if prefix.is_empty() {
        DEFAULT_CODE_PREFIX.to_string()
    } else {
        prefix
    }
}

/// Next free sequence number for `{prefix}-{NNN}` given existing codes.
pub fn next_code_sequence<'a>(prefix: &str, existing: impl IntoIterator<Item = &'a str>) -> u32 {
    let marker = format!("{}-", prefix);
    existing
        .into_iter()
        .filter_map(|code| code.strip_prefix(marker.as_str()))
        .filter(|rest| !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()))
        .filter_map(|rest| rest.parse::<u32>().ok())
        .max()
        .map_or(1, |max| max + 1)
}

pub fn format_instance_code(prefix: &str, sequence: u32) -> String {
    format!("{}-{:03}", prefix, sequence)
}

fn map_duplicate_code(err: sea_orm::DbErr, code: &str) -> ServiceError {
    match err.sql_err() {
        Some(SqlErr::UniqueConstraintViolation(_)) => {
            ServiceError::Conflict(format!("instance code {} already exists", code))
        }
        _ => ServiceError::from(err),
    }
}

/// `None` keeps the field, an empty string clears it.
fn optional_text(value: Option<String>) -> Option<Option<String>> {
    value.map(|v| {
        let trimmed = v.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    })
}

async fn find_supply<C>(conn: &C, supply_id: i32) -> Result<supply::Model, ServiceError>
where
    C: ConnectionTrait,
{
    Supply::find_by_id(supply_id)
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Supply {} not found", supply_id)))
}

/// Supply catalogue and equipment instance master data.
#[derive(Clone)]
pub struct SupplyService {
    db_pool: Arc<DbPool>,
    event_sender: Arc<EventSender>,
}

impl SupplyService {
    pub fn new(db_pool: Arc<DbPool>, event_sender: Arc<EventSender>) -> Self {
        Self {
            db_pool,
            event_sender,
        }
    }

    /// Creates a supply. Opening stock goes through the ledger so that the
    /// history replays to the stored quantity.
    #[instrument(skip(self, input), fields(name = %input.name))]
    pub async fn create_supply(
        &self,
        input: CreateSupplyInput,
        actor: Actor,
    ) -> Result<supply::Model, ServiceError> {
        input.validate()?;

        let txn = self.db_pool.begin().await?;
        let created = supply::ActiveModel {
            name: Set(input.name.trim().to_string()),
            unit: Set(input.unit.trim().to_string()),
            quantity: Set(0),
            min_stock_level: Set(input.min_stock_level),
            is_consumable: Set(input.is_consumable),
            location: Set(input.location),
            description: Set(input.description),
            ..Default::default()
        }
        .insert(&txn)
        .await?;

        if input.quantity > 0 {
            ledger::apply_delta(
                &txn,
                StockMovement {
                    supply_id: created.id,
                    delta: input.quantity,
                    transaction_type: TransactionType::In,
                    reason: "Opening stock".to_string(),
                    reference: None,
                    performed_by: actor,
                },
            )
            .await?;
        }
        let created = find_supply(&txn, created.id).await?;
        txn.commit().await?;

        info!(supply_id = created.id, quantity = created.quantity, "supply created");
        Ok(created)
    }

    #[instrument(skip(self, input))]
    pub async fn update_supply(
        &self,
        supply_id: i32,
        input: UpdateSupplyInput,
    ) -> Result<supply::Model, ServiceError> {
        input.validate()?;
        let supply = find_supply(self.db_pool.as_ref(), supply_id).await?;
        let mut active: supply::ActiveModel = supply.into();

        if let Some(name) = input.name {
            active.name = Set(name.trim().to_string());
        }
        if let Some(unit) = input.unit {
            active.unit = Set(unit.trim().to_string());
        }
        if let Some(min_stock_level) = input.min_stock_level {
            active.min_stock_level = Set(min_stock_level);
        }
        if let Some(location) = optional_text(input.location) {
            active.location = Set(location);
        }
        if let Some(description) = optional_text(input.description) {
            active.description = Set(description);
        }

        let updated = active.update(self.db_pool.as_ref()).await?;
        info!(supply_id, "supply updated");
        self.notify_if_low(&updated).await;
        Ok(updated)
    }

    /// Deletes a supply with its instances, requests, loans and ledger.
    /// Refused while any unit is out on loan or a request is still pending
    /// or approved.
    #[instrument(skip(self))]
    pub async fn delete_supply(&self, supply_id: i32) -> Result<(), ServiceError> {
        let txn = self.db_pool.begin().await?;
        let supply = find_supply(&txn, supply_id).await?;

        let outstanding = BorrowedItem::find()
            .filter(borrowed_item::Column::SupplyId.eq(supply_id))
            .filter(borrowed_item::Column::ReturnedAt.is_null())
            .count(&txn)
            .await?;
        if outstanding > 0 {
            return Err(ServiceError::InvalidOperation(format!(
                "{} has {} outstanding loan(s)",
                supply.name, outstanding
            )));
        }

        let live = SupplyRequest::find()
            .filter(supply_request::Column::SupplyId.eq(supply_id))
            .filter(
                supply_request::Column::Status
                    .is_in([RequestStatus::Pending, RequestStatus::Approved]),
            )
            .count(&txn)
            .await?;
        if live > 0 {
            return Err(ServiceError::InvalidOperation(format!(
                "{} has {} pending or approved request(s)",
                supply.name, live
            )));
        }

        Supply::delete_by_id(supply_id).exec(&txn).await?;
        txn.commit().await?;

        info!(supply_id, name = %supply.name, "supply deleted");
        Ok(())
    }

    pub async fn get(&self, supply_id: i32) -> Result<SupplyDetails, ServiceError> {
        let db = self.db_pool.as_ref();
        let supply = find_supply(db, supply_id).await?;

        let total_instances = EquipmentInstance::find()
            .filter(equipment_instance::Column::SupplyId.eq(supply_id))
            .count(db)
            .await?;
        let available_instances = EquipmentInstance::find()
            .filter(equipment_instance::Column::SupplyId.eq(supply_id))
            .filter(equipment_instance::Column::Status.eq(InstanceStatus::Available))
            .count(db)
            .await?;

        Ok(SupplyDetails {
            low_stock: supply.is_low_stock(),
            token: ScanToken::for_supply(supply.id).to_string(),
            supply,
            total_instances,
            available_instances,
        })
    }

    pub async fn list(&self, filter: SupplyFilter) -> Result<Vec<supply::Model>, ServiceError> {
        let mut condition = Condition::all();
        if let Some(search) = filter.search.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            condition = condition.add(supply::Column::Name.contains(search));
        }
        if let Some(consumable) = filter.is_consumable {
            condition = condition.add(supply::Column::IsConsumable.eq(consumable));
        }

        let supplies = Supply::find()
            .filter(condition)
            .order_by_asc(supply::Column::Name)
            .order_by_asc(supply::Column::Id)
            .all(self.db_pool.as_ref())
            .await?;

        Ok(match filter.low_stock {
            Some(wanted) => supplies
                .into_iter()
                .filter(|s| s.is_low_stock() == wanted)
                .collect(),
            None => supplies,
        })
    }

    /// Supplies at or below their minimum stock level.
    pub async fn low_stock(&self) -> Result<Vec<supply::Model>, ServiceError> {
        self.list(SupplyFilter {
            low_stock: Some(true),
            ..Default::default()
        })
        .await
    }

    #[instrument(skip(self, input), fields(code = %input.instance_code))]
    pub async fn create_instance(
        &self,
        supply_id: i32,
        input: CreateInstanceInput,
    ) -> Result<equipment_instance::Model, ServiceError> {
        input.validate()?;
        let db = self.db_pool.as_ref();
        find_supply(db, supply_id).await?;

        let code = input.instance_code.trim().to_string();
        let instance = equipment_instance::ActiveModel {
            supply_id: Set(supply_id),
            instance_code: Set(code.clone()),
            brand: Set(input.brand),
            model: Set(input.model),
            serial_number: Set(input.serial_number),
            status: Set(InstanceStatus::Available),
            location: Set(input.location),
            notes: Set(input.notes),
            ..Default::default()
        }
        .insert(db)
        .await
        .map_err(|e| map_duplicate_code(e, &code))?;

        info!(supply_id, instance_id = instance.id, "equipment instance created");
        Ok(instance)
    }

    /// Creates `count` instances numbered after the highest existing code
    /// with the same prefix.
    #[instrument(skip(self, input))]
    pub async fn bulk_create_instances(
        &self,
        supply_id: i32,
        input: BulkCreateInstancesInput,
    ) -> Result<Vec<equipment_instance::Model>, ServiceError> {
        input.validate()?;
        if input.count > MAX_BULK_INSTANCES {
            return Err(ServiceError::InvalidInput(format!(
                "at most {} instances per call",
                MAX_BULK_INSTANCES
            )));
        }

        let txn = self.db_pool.begin().await?;
        let supply = find_supply(&txn, supply_id).await?;

        let prefix = match input.prefix.as_deref().map(str::trim) {
            Some(p) if !p.is_empty() => p.to_ascii_uppercase(),
            _ => default_code_prefix(&supply.name),
        };
        if prefix.contains(char::is_whitespace) {
            return Err(ServiceError::InvalidInput(
                "prefix must not contain whitespace".to_string(),
            ));
        }

        let existing = EquipmentInstance::find()
            .filter(equipment_instance::Column::InstanceCode.starts_with(format!("{}-", prefix)))
            .all(&txn)
            .await?;
        let first = next_code_sequence(&prefix, existing.iter().map(|i| i.instance_code.as_str()));

        let mut created = Vec::with_capacity(input.count as usize);
        for sequence in first..first + input.count {
            let code = format_instance_code(&prefix, sequence);
            let instance = equipment_instance::ActiveModel {
                supply_id: Set(supply_id),
                instance_code: Set(code.clone()),
                brand: Set(input.brand.clone()),
                model: Set(input.model.clone()),
                status: Set(InstanceStatus::Available),
                location: Set(input.location.clone().or_else(|| supply.location.clone())),
                ..Default::default()
            }
            .insert(&txn)
            .await
            .map_err(|e| map_duplicate_code(e, &code))?;
            created.push(instance);
        }
        txn.commit().await?;

        info!(supply_id, count = created.len(), prefix = %prefix, "equipment instances created");
        Ok(created)
    }

    pub async fn list_instances(
        &self,
        supply_id: i32,
    ) -> Result<Vec<equipment_instance::Model>, ServiceError> {
        let db = self.db_pool.as_ref();
        find_supply(db, supply_id).await?;
        Ok(EquipmentInstance::find()
            .filter(equipment_instance::Column::SupplyId.eq(supply_id))
            .order_by_asc(equipment_instance::Column::Id)
            .all(db)
            .await?)
    }

    pub async fn get_instance(&self, instance_id: i32) -> Result<InstanceDetails, ServiceError> {
        let db = self.db_pool.as_ref();
        let instance = EquipmentInstance::find_by_id(instance_id)
            .one(db)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Equipment instance {} not found", instance_id))
            })?;
        let current_loan = loans::outstanding_for_instance(db, instance_id).await?;
        Ok(InstanceDetails {
            token: ScanToken::for_instance(instance.id).to_string(),
            instance,
            current_loan,
        })
    }

    #[instrument(skip(self, input))]
    pub async fn update_instance(
        &self,
        instance_id: i32,
        input: UpdateInstanceInput,
    ) -> Result<equipment_instance::Model, ServiceError> {
        input.validate()?;
        let db = self.db_pool.as_ref();
        let instance = EquipmentInstance::find_by_id(instance_id)
            .one(db)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Equipment instance {} not found", instance_id))
            })?;

        let mut active: equipment_instance::ActiveModel = instance.into();
        if let Some(brand) = optional_text(input.brand) {
            active.brand = Set(brand);
        }
        if let Some(model) = optional_text(input.model) {
            active.model = Set(model);
        }
        if let Some(serial_number) = optional_text(input.serial_number) {
            active.serial_number = Set(serial_number);
        }
        if let Some(location) = optional_text(input.location) {
            active.location = Set(location);
        }

        let updated = active.update(db).await?;
        info!(instance_id, "equipment instance updated");
        Ok(updated)
    }

    /// Administrative status change. `borrowed` is reserved for releases
    /// and an instance out on loan cannot be moved at all.
    #[instrument(skip(self, input))]
    pub async fn set_instance_status(
        &self,
        instance_id: i32,
        input: SetInstanceStatusInput,
        actor: Actor,
    ) -> Result<equipment_instance::Model, ServiceError> {
        input.validate()?;
        if input.status == InstanceStatus::Borrowed {
            return Err(ServiceError::InvalidOperation(
                "instances become borrowed only through a release".to_string(),
            ));
        }

        let txn = self.db_pool.begin().await?;
        let instance = EquipmentInstance::find_by_id(instance_id)
            .one(&txn)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Equipment instance {} not found", instance_id))
            })?;

        if allocator::has_outstanding_loan(&txn, instance_id).await? {
            return Err(ServiceError::InvalidOperation(format!(
                "instance {} is out on loan",
                instance.instance_code
            )));
        }

        let notes = append_note(
            instance.notes.as_deref(),
            actor,
            Utc::now(),
            &format!("status {} -> {}", instance.status, input.status),
            input.note.as_deref(),
        );
        let mut active: equipment_instance::ActiveModel = instance.into();
        active.status = Set(input.status);
        active.notes = Set(Some(notes));
        let updated = active.update(&txn).await?;
        txn.commit().await?;

        info!(instance_id, status = %updated.status, "instance status set");
        Ok(updated)
    }

    /// Publishes a low-stock event for `supply` when it is at or below its
    /// minimum level. Returns whether it was.
    pub(crate) async fn notify_if_low(&self, supply: &supply::Model) -> bool {
        if !supply.is_low_stock() {
            return false;
        }
        self.event_sender
            .publish(Event::LowStock {
                supply_id: supply.id,
                name: supply.name.clone(),
                quantity: supply.quantity,
                min_stock_level: supply.min_stock_level,
            })
            .await;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_comes_from_the_name() {
        assert_eq!(default_code_prefix("Laptop"), "LAP");
        assert_eq!(default_code_prefix("hd camera"), "HDC");
        assert_eq!(default_code_prefix("  4k tv"), "4KT");
        assert_eq!(default_code_prefix("--"), "EQP");
    }

    #[test]
    fn blank_text_clears_and_missing_text_keeps() {
        assert_eq!(optional_text(None), None);
        assert_eq!(optional_text(Some("  ".to_string())), Some(None));
        assert_eq!(
            optional_text(Some(" Room 4 ".to_string())),
            Some(Some("Room 4".to_string()))
        );
    }

    #[test]
    fn sequence_continues_after_highest_code() {
        let existing = ["LAP-001", "LAP-007", "LAP-x", "LAPTOP-900", "PRO-050"];
        assert_eq!(next_code_sequence("LAP", existing), 8);
        assert_eq!(next_code_sequence("PRO", existing), 51);
        assert_eq!(next_code_sequence("CAM", existing), 1);
        assert_eq!(format_instance_code("LAP", 8), "LAP-008");
        assert_eq!(format_instance_code("LAP", 1234), "LAP-1234");
    }
}
