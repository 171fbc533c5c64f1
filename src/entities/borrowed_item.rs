use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sea_orm::entity::prelude::*;
use sea_orm::{ActiveModelBehavior, ActiveValue, Set};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// How a loan was closed.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    EnumIter,
    DeriveActiveEnum,
    Serialize,
    Deserialize,
    ToSchema,
    strum::Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ReturnStatus {
    #[sea_orm(string_value = "returned")]
    Returned,
    #[sea_orm(string_value = "damaged")]
    Damaged,
    #[sea_orm(string_value = "lost")]
    Lost,
}

impl ReturnStatus {
    pub fn is_issue(&self) -> bool {
        matches!(self, ReturnStatus::Damaged | ReturnStatus::Lost)
    }
}

/// One loan: either a single equipment instance, or a block of units of a
/// supply that is not instance-tracked. `returned_at == None` means the loan
/// is outstanding.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize, ToSchema)]
#[sea_orm(table_name = "borrowed_items")]
#[schema(as = BorrowedItem)]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub supply_id: i32,
    pub equipment_instance_id: Option<i32>,
    pub supply_request_id: Option<i32>,
    pub borrower_id: i32,
    pub borrowed_quantity: i32,
    pub borrowed_date: NaiveDate,
    pub return_deadline: Option<NaiveDate>,
    pub returned_at: Option<DateTime<Utc>>,
    pub return_status: Option<ReturnStatus>,
    pub location_when_borrowed: Option<String>,
    #[sea_orm(column_type = "Text", nullable)]
    pub notes: Option<String>,
    pub batch_group_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Model {
    pub fn is_outstanding(&self) -> bool {
        self.returned_at.is_none()
    }

    /// Whole days past the deadline, zero when not overdue.
    pub fn days_overdue(&self, today: NaiveDate) -> i64 {
        match self.return_deadline {
            Some(deadline) if self.is_outstanding() && deadline < today => {
                (today - deadline).num_days()
            }
            _ => 0,
        }
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::supply::Entity",
        from = "Column::SupplyId",
        to = "super::supply::Column::Id",
        on_update = "NoAction",
        on_delete = "Cascade"
    )]
    Supply,
    #[sea_orm(
        belongs_to = "super::equipment_instance::Entity",
        from = "Column::EquipmentInstanceId",
        to = "super::equipment_instance::Column::Id",
        on_update = "NoAction",
        on_delete = "SetNull"
    )]
    EquipmentInstance,
    #[sea_orm(
        belongs_to = "super::supply_request::Entity",
        from = "Column::SupplyRequestId",
        to = "super::supply_request::Column::Id",
        on_update = "NoAction",
        on_delete = "SetNull"
    )]
    SupplyRequest,
}

impl Related<super::supply::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Supply.def()
    }
}

impl Related<super::equipment_instance::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::EquipmentInstance.def()
    }
}

impl Related<super::supply_request::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::SupplyRequest.def()
    }
}

#[async_trait]
impl ActiveModelBehavior for ActiveModel {
    async fn before_save<C>(self, _db: &C, insert: bool) -> Result<Self, DbErr>
    where
        C: ConnectionTrait,
    {
        let mut active_model = self;
        if insert {
            if let ActiveValue::NotSet = active_model.created_at {
                active_model.created_at = Set(Utc::now());
            }
        }
        Ok(active_model)
    }
}
