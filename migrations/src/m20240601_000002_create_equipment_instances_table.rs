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
                    .table(EquipmentInstances::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(EquipmentInstances::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(EquipmentInstances::SupplyId)
                            .integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(EquipmentInstances::InstanceCode)
                            .string()
                            .not_null()
                            .unique_key(),
                    )
                    .col(ColumnDef::new(EquipmentInstances::Brand).string().null())
                    .col(ColumnDef::new(EquipmentInstances::Model).string().null())
                    .col(
                        ColumnDef::new(EquipmentInstances::SerialNumber)
                            .string()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(EquipmentInstances::Status)
                            .string_len(32)
                            .not_null(),
                    )
                    .col(ColumnDef::new(EquipmentInstances::Location).string().null())
                    .col(ColumnDef::new(EquipmentInstances::Notes).text().null())
                    .col(
                        ColumnDef::new(EquipmentInstances::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(EquipmentInstances::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_equipment_instances_supply_id")
                            .from(EquipmentInstances::Table, EquipmentInstances::SupplyId)
                            .to(Supplies::Table, Supplies::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(EquipmentInstances::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
pub(crate) enum EquipmentInstances {
    Table,
    Id,
    SupplyId,
    InstanceCode,
    Brand,
    Model,
    SerialNumber,
    Status,
    Location,
    Notes,
    CreatedAt,
    UpdatedAt,
}
