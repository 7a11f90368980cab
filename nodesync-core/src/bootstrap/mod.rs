//! Bootstrap helpers for starting a `NodeSync` server

pub mod config;

pub use config::load_config;
