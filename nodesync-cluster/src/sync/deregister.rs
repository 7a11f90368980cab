//! Removal of this server's instances from the registry on shutdown

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::discovery::fetcher::MAX_CONCURRENT_QUERIES;
use crate::discovery::registry::{DeregisterRequest, RegistryClient};
use nodesync_core::config::RegistrationSpec;
use nodesync_core::DriverConfig;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DeregistrationReport {
    pub removed: Vec<String>,
    /// Service name and error message
    pub failed: Vec<(String, String)>,
}

/// Logs this server out of the registry, at most once per process
pub struct ServiceDeregistrar {
    client: Arc<dyn RegistryClient>,
    group_name: String,
    namespace_id: String,
    ephemeral: bool,
    ip: String,
    registrations: Vec<RegistrationSpec>,
    enabled: bool,
    processed: AtomicBool,
    shutdown: CancellationToken,
}

impl ServiceDeregistrar {
    #[must_use]
    pub fn new(
        client: Arc<dyn RegistryClient>,
        driver: &DriverConfig,
        registrations: Vec<RegistrationSpec>,
        ip: impl Into<String>,
        enabled: bool,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            client,
            group_name: driver.group_name.clone(),
            namespace_id: driver.namespace_id.clone(),
            ephemeral: driver.ephemeral,
            ip: ip.into(),
            registrations,
            enabled,
            processed: AtomicBool::new(false),
            shutdown,
        }
    }

    /// Raise the shutdown signal, then delete every registration
    ///
    /// Returns `None` when auto logout is disabled or already done. Stopping
    /// the loops first keeps anything from registering the instances again.
    pub async fn logout(&self) -> Option<DeregistrationReport> {
        if self.processed.swap(true, Ordering::AcqRel) {
            debug!("Service logout already processed");
            return None;
        }
        if !self.enabled {
            debug!("Auto logout disabled");
            return None;
        }

        info!(
            namespace = %self.namespace_id,
            group = %self.group_name,
            services = self.registrations.len(),
            "Deregistering services"
        );
        self.shutdown.cancel();

        let mut report = DeregistrationReport::default();
        for chunk in self.registrations.chunks(MAX_CONCURRENT_QUERIES) {
            let results = join_all(chunk.iter().map(|registration| async move {
                let request = DeregisterRequest {
                    service_name: registration.name.clone(),
                    group_name: self.group_name.clone(),
                    namespace_id: self.namespace_id.clone(),
                    ip: self.ip.clone(),
                    port: registration.port,
                    ephemeral: self.ephemeral,
                };
                (registration, self.client.deregister_instance(&request).await)
            }))
            .await;

            for (registration, result) in results {
                match result {
                    Ok(()) => {
                        info!(
                            service = %registration.name,
                            ip = %self.ip,
                            port = registration.port,
                            "Instance deregistered"
                        );
                        report.removed.push(registration.name.clone());
                    }
                    Err(e) => {
                        warn!(
                            service = %registration.name,
                            ip = %self.ip,
                            port = registration.port,
                            error = %e,
                            "Failed to deregister instance"
                        );
                        report.failed.push((registration.name.clone(), e.to_string()));
                    }
                }
            }
        }

        info!(
            removed = report.removed.len(),
            failed = report.failed.len(),
            "Service logout finished"
        );
        Some(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::StaticRegistry;

    fn registrations(names: &[&str]) -> Vec<RegistrationSpec> {
        names
            .iter()
            .enumerate()
            .map(|(i, name)| RegistrationSpec {
                name: (*name).to_string(),
                port: 9500 + u16::try_from(i).unwrap(),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_logout_cancels_then_deregisters() {
        let registry = Arc::new(StaticRegistry::new());
        registry.fail("broken-svc");
        let shutdown = CancellationToken::new();
        let deregistrar = ServiceDeregistrar::new(
            registry.clone(),
            &DriverConfig::default(),
            registrations(&["order-svc", "broken-svc", "user-svc"]),
            "10.0.0.5",
            true,
            shutdown.clone(),
        );

        let report = deregistrar.logout().await.unwrap();

        assert!(shutdown.is_cancelled());
        assert_eq!(report.removed, vec!["order-svc", "user-svc"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "broken-svc");

        let removed = registry.deregistered();
        assert_eq!(removed.len(), 2);
        assert_eq!(removed[0].ip, "10.0.0.5");
        assert_eq!(removed[0].port, 9500);
        assert_eq!(removed[0].group_name, "DEFAULT_GROUP");
        assert!(removed[0].ephemeral);
    }

    #[tokio::test]
    async fn test_logout_runs_once() {
        let registry = Arc::new(StaticRegistry::new());
        let deregistrar = ServiceDeregistrar::new(
            registry.clone(),
            &DriverConfig::default(),
            registrations(&["order-svc"]),
            "10.0.0.5",
            true,
            CancellationToken::new(),
        );

        assert!(deregistrar.logout().await.is_some());
        assert!(deregistrar.logout().await.is_none());
        assert_eq!(registry.deregistered().len(), 1);
    }

    #[tokio::test]
    async fn test_disabled_logout_leaves_everything_alone() {
        let registry = Arc::new(StaticRegistry::new());
        let shutdown = CancellationToken::new();
        let deregistrar = ServiceDeregistrar::new(
            registry.clone(),
            &DriverConfig::default(),
            registrations(&["order-svc"]),
            "10.0.0.5",
            false,
            shutdown.clone(),
        );

        assert!(deregistrar.logout().await.is_none());
        assert!(!shutdown.is_cancelled());
        assert!(registry.deregistered().is_empty());
    }
}
