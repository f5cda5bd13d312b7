pub mod chain;
pub mod config;
pub mod database;
pub mod scheduler;
pub mod token_registry;

pub use config::{AppConfig, ConfigError, NetworkConfig};
pub use scheduler::{TaskSupervisor, TickOutcome};
