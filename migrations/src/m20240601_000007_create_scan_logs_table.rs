use sea_orm_migration::prelude::*;

use super::m20240601_000001_create_supplies_table::Supplies;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(ScanLogs::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(ScanLogs::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(ScanLogs::ScannedBy).integer().not_null())
                    .col(ColumnDef::new(ScanLogs::Action).string_len(16).not_null())
                    .col(ColumnDef::new(ScanLogs::Token).string_len(128).not_null())
                    .col(ColumnDef::new(ScanLogs::SupplyId).integer().null())
                    .col(ColumnDef::new(ScanLogs::BatchGroupId).string_len(64).null())
                    .col(
                        ColumnDef::new(ScanLogs::Succeeded)
                            .boolean()
                            .not_null()
                            .default(true),
                    )
                    .col(ColumnDef::new(ScanLogs::ErrorCode).string_len(32).null())
                    .col(
                        ColumnDef::new(ScanLogs::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_scan_logs_supply_id")
                            .from(ScanLogs::Table, ScanLogs::SupplyId)
                            .to(Supplies::Table, Supplies::Id)
                            .on_delete(ForeignKeyAction::SetNull),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_scan_logs_scanned_by_created")
                    .table(ScanLogs::Table)
                    .col(ScanLogs::ScannedBy)
                    .col(ScanLogs::CreatedAt)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(ScanLogs::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
pub(crate) enum ScanLogs {
    Table,
    Id,
    ScannedBy,
    Action,
    Token,
    SupplyId,
    BatchGroupId,
    Succeeded,
    ErrorCode,
    CreatedAt,
}
