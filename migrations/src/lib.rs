pub use sea_orm_migration::prelude::*;

mod m20240601_000001_create_supplies_table;
mod m20240601_000002_create_equipment_instances_table;
mod m20240601_000003_create_supply_requests_table;
mod m20240601_000004_create_borrowed_items_table;
mod m20240601_000005_create_inventory_transactions_table;
mod m20240601_000006_add_loan_indexes;
mod m20240601_000007_create_scan_logs_table;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20240601_000001_create_supplies_table::Migration),
            Box::new(m20240601_000002_create_equipment_instances_table::Migration),
            Box::new(m20240601_000003_create_supply_requests_table::Migration),
            Box::new(m20240601_000004_create_borrowed_items_table::Migration),
            Box::new(m20240601_000005_create_inventory_transactions_table::Migration),
            Box::new(m20240601_000006_add_loan_indexes::Migration),
            Box::new(m20240601_000007_create_scan_logs_table::Migration),
        ]
    }
}
