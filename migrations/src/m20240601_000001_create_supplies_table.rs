use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Supplies::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Supplies::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Supplies::Name).string().not_null())
                    .col(ColumnDef::new(Supplies::Unit).string().not_null())
                    .col(
                        ColumnDef::new(Supplies::Quantity)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(Supplies::MinStockLevel)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(Supplies::IsConsumable)
                            .boolean()
                            .not_null()
                            .default(true),
                    )
                    .col(ColumnDef::new(Supplies::Location).string().null())
                    .col(ColumnDef::new(Supplies::Description).text().null())
                    .col(
                        ColumnDef::new(Supplies::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Supplies::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Supplies::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
pub(crate) enum Supplies {
    Table,
    Id,
    Name,
    Unit,
    Quantity,
    MinStockLevel,
    IsConsumable,
    Location,
    Description,
    CreatedAt,
    UpdatedAt,
}
