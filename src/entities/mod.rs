pub mod borrowed_item;
pub mod equipment_instance;
pub mod inventory_transaction;
pub mod scan_log;
pub mod supply;
pub mod supply_request;

pub use borrowed_item::ReturnStatus;
pub use equipment_instance::InstanceStatus;
pub use inventory_transaction::TransactionType;
pub use scan_log::ScanAction;
pub use supply_request::{RequestKind, RequestStatus};
