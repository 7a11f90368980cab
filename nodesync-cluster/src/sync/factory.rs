//! Resolves configured drivers and binds them to one process

use std::sync::Arc;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::driver::SyncDriver;
use super::fanout::FanOut;
use super::transport::{ProcessIdentity, ServerTransport};
use crate::discovery::fetcher::SnapshotFetcher;
use crate::discovery::load_balancer::NodeSink;
use crate::discovery::nacos::NacosRegistryClient;
use crate::discovery::registry::{ClientIdentity, RegistryClient};
use crate::error::{Error, Result};
use nodesync_core::{ConsumerSpec, DriverConfig, DriverKind, ServicesConfig};

/// Everything a driver needs from the process that owns it
#[derive(Clone)]
pub struct ProcessContext {
    pub identity: ProcessIdentity,
    pub transport: Arc<ServerTransport>,
    pub sink: Arc<dyn NodeSink>,
    pub shutdown: CancellationToken,
}

/// Builds drivers for one process and caches them by name
///
/// The poll loop and the push listener of a process both go through the
/// same factory, so they share one driver and its change-detection state.
pub struct DriverFactory {
    services: Arc<ServicesConfig>,
    consumers: Arc<[ConsumerSpec]>,
    client_identity: ClientIdentity,
    context: ProcessContext,
    registry_override: Option<Arc<dyn RegistryClient>>,
    drivers: DashMap<String, Arc<SyncDriver>>,
}

impl DriverFactory {
    #[must_use]
    pub fn new(
        services: Arc<ServicesConfig>,
        client_identity: ClientIdentity,
        context: ProcessContext,
    ) -> Self {
        let consumers: Arc<[ConsumerSpec]> = services.consumers.clone().into();
        Self {
            services,
            consumers,
            client_identity,
            context,
            registry_override: None,
            drivers: DashMap::new(),
        }
    }

    /// Use `client` for every driver instead of one built from configuration
    #[must_use]
    pub fn with_registry_client(mut self, client: Arc<dyn RegistryClient>) -> Self {
        self.registry_override = Some(client);
        self
    }

    #[must_use]
    pub fn services(&self) -> &ServicesConfig {
        &self.services
    }

    #[must_use]
    pub fn consumers(&self) -> Arc<[ConsumerSpec]> {
        Arc::clone(&self.consumers)
    }

    #[must_use]
    pub const fn context(&self) -> &ProcessContext {
        &self.context
    }

    /// Driver named `name`, created on first use
    pub fn create(&self, name: &str) -> Result<Arc<SyncDriver>> {
        if let Some(driver) = self.drivers.get(name) {
            return Ok(driver.clone());
        }

        let config = self.driver_config(name)?;
        let client = self.registry_client(name)?;
        let driver = Arc::new(SyncDriver::new(
            name,
            config.interval(),
            self.consumers(),
            SnapshotFetcher::new(client, &config.group_name),
            Arc::clone(&self.context.sink),
            FanOut::new(self.context.identity, Arc::clone(&self.context.transport)),
            self.context.shutdown.clone(),
        ));

        info!(
            driver = %name,
            pid = self.context.identity.pid,
            worker_id = ?self.context.identity.worker_id,
            "Created service driver"
        );
        Ok(self.drivers.entry(name.to_string()).or_insert(driver).clone())
    }

    /// Driver selected by configuration, `None` when discovery is off
    pub fn create_from_config(&self) -> Result<Option<Arc<SyncDriver>>> {
        match self.services.discovery_driver() {
            Some(name) => self.create(name).map(Some),
            None => Ok(None),
        }
    }

    /// Registry client for driver `name`
    pub fn registry_client(&self, name: &str) -> Result<Arc<dyn RegistryClient>> {
        if let Some(client) = &self.registry_override {
            return Ok(Arc::clone(client));
        }

        let config = self.driver_config(name)?;
        match config.kind {
            DriverKind::Nacos => Ok(Arc::new(NacosRegistryClient::new(
                &config.url,
                self.client_identity.clone(),
                config.request_timeout(),
            )?)),
        }
    }

    fn driver_config(&self, name: &str) -> Result<&DriverConfig> {
        self.services
            .driver_config(name)
            .ok_or_else(|| Error::Configuration(format!("Unknown service driver: {name}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{RecordingSink, StaticRegistry};

    fn context() -> ProcessContext {
        ProcessContext {
            identity: ProcessIdentity::worker(0, 10),
            transport: Arc::new(ServerTransport::new()),
            sink: Arc::new(RecordingSink::new()),
            shutdown: CancellationToken::new(),
        }
    }

    fn services(discovery: bool) -> Arc<ServicesConfig> {
        let mut services = ServicesConfig::default();
        services.enable.discovery = discovery;
        services.consumers = vec![ConsumerSpec::new("order-svc", "ns1", "rr")];
        Arc::new(services)
    }

    #[test]
    fn test_create_caches_driver() {
        let factory = DriverFactory::new(services(true), ClientIdentity::default(), context())
            .with_registry_client(Arc::new(StaticRegistry::new()));

        let first = factory.create("nacos").unwrap();
        let second = factory.create("nacos").unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.consumers().len(), 1);
        assert_eq!(first.interval(), std::time::Duration::from_secs(5));
        assert_eq!(first.fetcher().group_name(), "DEFAULT_GROUP");
    }

    #[test]
    fn test_unknown_driver() {
        let factory = DriverFactory::new(services(true), ClientIdentity::default(), context());
        assert!(matches!(factory.create("consul"), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_create_from_config_respects_discovery_flag() {
        let disabled = DriverFactory::new(services(false), ClientIdentity::default(), context());
        assert!(disabled.create_from_config().unwrap().is_none());

        let enabled = DriverFactory::new(services(true), ClientIdentity::default(), context());
        let driver = enabled.create_from_config().unwrap().unwrap();
        assert_eq!(driver.name(), "nacos");
    }

    #[test]
    fn test_empty_driver_name_creates_nothing() {
        let mut config = (*services(true)).clone();
        config.driver = String::new();

        let factory = DriverFactory::new(Arc::new(config), ClientIdentity::default(), context());
        assert!(factory.create_from_config().unwrap().is_none());
    }
}
