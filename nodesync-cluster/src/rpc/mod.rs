//! Client-side helpers for calling upstream services

pub mod service_client;

pub use service_client::{BalancerResolver, ServiceClient};
