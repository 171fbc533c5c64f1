use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use sea_orm::{ActiveModelBehavior, ActiveValue, Set};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Whether the requested units are consumed or lent out and expected back.
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
pub enum RequestKind {
    #[sea_orm(string_value = "consumption")]
    Consumption,
    #[sea_orm(string_value = "loan")]
    Loan,
}

/// Request lifecycle states.
///
/// `pending -> {approved, rejected}`, `approved -> released`,
/// `released -> {partially_returned, returned, returned_with_issues}`.
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
pub enum RequestStatus {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "approved")]
    Approved,
    #[sea_orm(string_value = "rejected")]
    Rejected,
    #[sea_orm(string_value = "released")]
    Released,
    #[sea_orm(string_value = "partially_returned")]
    PartiallyReturned,
    #[sea_orm(string_value = "returned")]
    Returned,
    #[sea_orm(string_value = "returned_with_issues")]
    ReturnedWithIssues,
}

impl RequestStatus {
    /// States reached only after stock left the store room; the status of
    /// these is derived from linked loans.
    pub fn is_released_or_later(&self) -> bool {
        matches!(
            self,
            RequestStatus::Released
                | RequestStatus::PartiallyReturned
                | RequestStatus::Returned
                | RequestStatus::ReturnedWithIssues
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize, ToSchema)]
#[sea_orm(table_name = "supply_requests")]
#[schema(as = SupplyRequest)]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub user_id: i32,
    pub supply_id: i32,
    /// Specific unit asked for, if any
    pub equipment_instance_id: Option<i32>,
    pub kind: RequestKind,
    pub quantity_requested: i32,
    #[sea_orm(column_type = "Text")]
    pub purpose: String,
    pub borrow_duration_days: Option<i32>,
    pub status: RequestStatus,
    pub approved_by: Option<i32>,
    pub approved_at: Option<DateTime<Utc>>,
    #[sea_orm(column_type = "Text", nullable)]
    pub rejected_reason: Option<String>,
    pub released_by: Option<i32>,
    pub released_at: Option<DateTime<Utc>>,
    pub batch_group_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Model {
    pub fn is_loan(&self) -> bool {
        self.kind == RequestKind::Loan
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
    #[sea_orm(has_many = "super::borrowed_item::Entity")]
    BorrowedItem,
}

impl Related<super::supply::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Supply.def()
    }
}

impl Related<super::borrowed_item::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::BorrowedItem.def()
    }
}

#[async_trait]
impl ActiveModelBehavior for ActiveModel {
    async fn before_save<C>(self, _db: &C, insert: bool) -> Result<Self, DbErr>
    where
        C: ConnectionTrait,
    {
        let mut active_model = self;
        let now = Utc::now();
        if insert {
            if let ActiveValue::NotSet = active_model.created_at {
                active_model.created_at = Set(now);
            }
        }
        active_model.updated_at = Set(now);
        Ok(active_model)
    }
}
