use sea_orm_migration::prelude::*;
use sea_orm_migration::sea_orm::ConnectionTrait;

use super::m20240601_000002_create_equipment_instances_table::EquipmentInstances;
use super::m20240601_000003_create_supply_requests_table::SupplyRequests;
use super::m20240601_000004_create_borrowed_items_table::BorrowedItems;
use super::m20240601_000005_create_inventory_transactions_table::InventoryTransactions;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // ============================================
        // SUPPLY_REQUESTS
        // ============================================

        manager
            .create_index(
                Index::create()
                    .name("idx_supply_requests_batch_group")
                    .table(SupplyRequests::Table)
                    .col(SupplyRequests::BatchGroupId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_supply_requests_user_status")
                    .table(SupplyRequests::Table)
                    .col(SupplyRequests::UserId)
                    .col(SupplyRequests::Status)
                    .to_owned(),
            )
            .await?;

        // ============================================
        // BORROWED_ITEMS
        // ============================================

        manager
            .create_index(
                Index::create()
                    .name("idx_borrowed_items_request")
                    .table(BorrowedItems::Table)
                    .col(BorrowedItems::SupplyRequestId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_borrowed_items_borrower_deadline")
                    .table(BorrowedItems::Table)
                    .col(BorrowedItems::BorrowerId)
                    .col(BorrowedItems::ReturnDeadline)
                    .to_owned(),
            )
            .await?;

        // At most one outstanding loan per physical unit. Both SQLite and
        // Postgres accept partial indexes with this syntax.
        manager
            .get_connection()
            .execute_unprepared(
                "CREATE UNIQUE INDEX IF NOT EXISTS idx_borrowed_items_outstanding_instance \
                 ON borrowed_items (equipment_instance_id) \
                 WHERE returned_at IS NULL AND equipment_instance_id IS NOT NULL",
            )
            .await?;

        // ============================================
        // EQUIPMENT_INSTANCES / INVENTORY_TRANSACTIONS
        // ============================================

        manager
            .create_index(
                Index::create()
                    .name("idx_equipment_instances_supply_status")
                    .table(EquipmentInstances::Table)
                    .col(EquipmentInstances::SupplyId)
                    .col(EquipmentInstances::Status)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_inventory_transactions_supply")
                    .table(InventoryTransactions::Table)
                    .col(InventoryTransactions::SupplyId)
                    .col(InventoryTransactions::Id)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        for name in [
            "idx_borrowed_items_outstanding_instance",
            "idx_supply_requests_batch_group",
            "idx_supply_requests_user_status",
            "idx_borrowed_items_request",
            "idx_borrowed_items_borrower_deadline",
            "idx_equipment_instances_supply_status",
            "idx_inventory_transactions_supply",
        ] {
            manager
                .get_connection()
                .execute_unprepared(&format!("DROP INDEX IF EXISTS {}", name))
                .await?;
        }

        Ok(())
    }
}
