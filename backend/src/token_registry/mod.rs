//! Token registry: discovers tokens from on-chain pair enumeration and
//! registers them once per network.

pub mod discovery_engine;
pub mod pair_discovery;
pub mod validation_service;

pub use discovery_engine::{DiscoveryReport, GroupedPairs, PreparedBatch, TokenDiscoveryPipeline};
pub use pair_discovery::PairDiscoveryJob;
pub use validation_service::{ContractCheck, ProbeFailurePolicy, ShapeCheck, TokenValidationService};
