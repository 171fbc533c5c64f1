use sea_orm_migration::prelude::*;

use super::m20240601_000001_create_supplies_table::Supplies;
use super::m20240601_000002_create_equipment_instances_table::EquipmentInstances;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(SupplyRequests::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(SupplyRequests::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(SupplyRequests::UserId).integer().not_null())
                    .col(ColumnDef::new(SupplyRequests::SupplyId).integer().not_null())
                    .col(
                        ColumnDef::new(SupplyRequests::EquipmentInstanceId)
                            .integer()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(SupplyRequests::Kind)
                            .string_len(32)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(SupplyRequests::QuantityRequested)
                            .integer()
                            .not_null(),
                    )
                    .col(ColumnDef::new(SupplyRequests::Purpose).text().not_null())
                    .col(
                        ColumnDef::new(SupplyRequests::BorrowDurationDays)
                            .integer()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(SupplyRequests::Status)
                            .string_len(32)
                            .not_null(),
                    )
                    .col(ColumnDef::new(SupplyRequests::ApprovedBy).integer().null())
                    .col(
                        ColumnDef::new(SupplyRequests::ApprovedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(ColumnDef::new(SupplyRequests::RejectedReason).text().null())
                    .col(ColumnDef::new(SupplyRequests::ReleasedBy).integer().null())
                    .col(
                        ColumnDef::new(SupplyRequests::ReleasedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(SupplyRequests::BatchGroupId)
                            .string_len(64)
                            .null(),
                    )
                    .col(
                        ColumnDef::new(SupplyRequests::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(SupplyRequests::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_supply_requests_supply_id")
                            .from(SupplyRequests::Table, SupplyRequests::SupplyId)
                            .to(Supplies::Table, Supplies::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_supply_requests_instance_id")
                            .from(SupplyRequests::Table, SupplyRequests::EquipmentInstanceId)
                            .to(EquipmentInstances::Table, EquipmentInstances::Id)
                            .on_delete(ForeignKeyAction::SetNull),
                    )
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(SupplyRequests::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
pub(crate) enum SupplyRequests {
    Table,
    Id,
    UserId,
    SupplyId,
    EquipmentInstanceId,
    Kind,
    QuantityRequested,
    Purpose,
    BorrowDurationDays,
    Status,
    ApprovedBy,
    ApprovedAt,
    RejectedReason,
    ReleasedBy,
    ReleasedAt,
    BatchGroupId,
    CreatedAt,
    UpdatedAt,
}
