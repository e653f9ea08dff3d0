pub mod schema;

pub use schema::{
    default_config_path, BusConfig, CircuitBreakerConfig, DedupConfig, DeliveryConfig,
    LimitsConfig,
};
