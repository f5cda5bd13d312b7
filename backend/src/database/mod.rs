pub mod models;
pub mod store;
pub mod transaction;
pub mod repository;
pub mod memory;
pub mod migrations;

pub use models::*;
pub use store::*;
pub use transaction::TxScope;
pub use repository::PgStorage;
pub use memory::InMemoryStorage;
pub use migrations::MigrationRunner;
