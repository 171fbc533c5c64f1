use sea_orm_migration::prelude::*;

use super::m20240601_000001_create_supplies_table::Supplies;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // Append-only stock ledger, one row per quantity mutation
        manager
            .create_table(
                Table::create()
                    .table(InventoryTransactions::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(InventoryTransactions::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(InventoryTransactions::SupplyId)
                            .integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(InventoryTransactions::TransactionType)
                            .string_len(32)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(InventoryTransactions::Quantity)
                            .integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(InventoryTransactions::PreviousQuantity)
                            .integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(InventoryTransactions::NewQuantity)
                            .integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(InventoryTransactions::WrittenOff)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(InventoryTransactions::Reason)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(InventoryTransactions::ReferenceType)
                            .string_len(32)
                            .null(),
                    )
                    .col(
                        ColumnDef::new(InventoryTransactions::ReferenceId)
                            .integer()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(InventoryTransactions::PerformedBy)
                            .integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(InventoryTransactions::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_inventory_transactions_supply_id")
                            .from(InventoryTransactions::Table, InventoryTransactions::SupplyId)
                            .to(Supplies::Table, Supplies::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(InventoryTransactions::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
pub(crate) enum InventoryTransactions {
    Table,
    Id,
    SupplyId,
    TransactionType,
    Quantity,
    PreviousQuantity,
    NewQuantity,
    WrittenOff,
    Reason,
    ReferenceType,
    ReferenceId,
    PerformedBy,
    CreatedAt,
}
