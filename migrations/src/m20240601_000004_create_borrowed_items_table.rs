use sea_orm_migration::prelude::*;

use super::m20240601_000001_create_supplies_table::Supplies;
use super::m20240601_000002_create_equipment_instances_table::EquipmentInstances;
use super::m20240601_000003_create_supply_requests_table::SupplyRequests;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(BorrowedItems::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(BorrowedItems::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(BorrowedItems::SupplyId).integer().not_null())
                    .col(
                        ColumnDef::new(BorrowedItems::EquipmentInstanceId)
                            .integer()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(BorrowedItems::SupplyRequestId)
                            .integer()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(BorrowedItems::BorrowerId)
                            .integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(BorrowedItems::BorrowedQuantity)
                            .integer()
                            .not_null()
                            .default(1),
                    )
                    .col(
                        ColumnDef::new(BorrowedItems::BorrowedDate)
                            .date()
                            .not_null(),
                    )
                    .col(ColumnDef::new(BorrowedItems::ReturnDeadline).date().null())
                    .col(
                        ColumnDef::new(BorrowedItems::ReturnedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(BorrowedItems::ReturnStatus)
                            .string_len(32)
                            .null(),
                    )
                    .col(
                        ColumnDef::new(BorrowedItems::LocationWhenBorrowed)
                            .string()
                            .null(),
                    )
                    .col(ColumnDef::new(BorrowedItems::Notes).text().null())
                    .col(
                        ColumnDef::new(BorrowedItems::BatchGroupId)
                            .string_len(64)
                            .null(),
                    )
                    .col(
                        ColumnDef::new(BorrowedItems::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_borrowed_items_supply_id")
                            .from(BorrowedItems::Table, BorrowedItems::SupplyId)
                            .to(Supplies::Table, Supplies::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_borrowed_items_instance_id")
                            .from(BorrowedItems::Table, BorrowedItems::EquipmentInstanceId)
                            .to(EquipmentInstances::Table, EquipmentInstances::Id)
                            .on_delete(ForeignKeyAction::SetNull),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_borrowed_items_request_id")
                            .from(BorrowedItems::Table, BorrowedItems::SupplyRequestId)
                            .to(SupplyRequests::Table, SupplyRequests::Id)
                            .on_delete(ForeignKeyAction::SetNull),
                    )
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(BorrowedItems::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
pub(crate) enum BorrowedItems {
    Table,
    Id,
    SupplyId,
    EquipmentInstanceId,
    SupplyRequestId,
    BorrowerId,
    BorrowedQuantity,
    BorrowedDate,
    ReturnDeadline,
    ReturnedAt,
    ReturnStatus,
    LocationWhenBorrowed,
    Notes,
    BatchGroupId,
    CreatedAt,
}
