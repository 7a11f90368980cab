pub mod models;
pub mod config;
pub mod logging;
pub mod bootstrap;
pub mod metrics;
pub mod net;

pub use config::{
    Config, ConsumerSpec, DriverConfig, DriverKind, Mode, RegistrationSpec, ServicesConfig,
};
pub use models::{Endpoint, ServiceSnapshot, SyncBatch};
