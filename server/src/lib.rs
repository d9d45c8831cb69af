pub mod chains;
pub mod config;
