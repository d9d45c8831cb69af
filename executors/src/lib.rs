pub mod metrics;
pub mod txm;
