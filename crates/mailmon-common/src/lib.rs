pub mod id;
pub mod metrics;
pub mod types;
