//! Service client bound to a synced load balancer

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

use tracing::debug;

use crate::discovery::load_balancer::{LoadBalancer, LoadBalancerManager};
use crate::error::{Error, Result};
use nodesync_core::Endpoint;

/// Supplies the balancer a client selects nodes from
pub trait BalancerResolver: Send + Sync {
    fn resolve(&self, service_name: &str, load_balancer: &str) -> Arc<LoadBalancer>;
}

impl BalancerResolver for LoadBalancerManager {
    fn resolve(&self, service_name: &str, load_balancer: &str) -> Arc<LoadBalancer> {
        self.get_instance(service_name, load_balancer)
    }
}

/// Calls one upstream service through the process-wide balancer
///
/// The client never refreshes nodes itself; the sync engine keeps the
/// balancer current.
pub struct ServiceClient {
    service_name: String,
    load_balancer: String,
    resolver: Arc<dyn BalancerResolver>,
}

impl ServiceClient {
    pub fn new(
        service_name: impl Into<String>,
        load_balancer: impl Into<String>,
        resolver: Arc<dyn BalancerResolver>,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            load_balancer: load_balancer.into(),
            resolver,
        }
    }

    #[must_use]
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Pick the node for one call of `method`
    pub fn select_node(&self, method: &str) -> Result<Endpoint> {
        self.resolver
            .resolve(&self.service_name, &self.load_balancer)
            .select()
            .map_err(|e| {
                Error::Rpc(format!(
                    "serviceName:{},loadBalancer:{},method:{method},err:{e}",
                    self.service_name, self.load_balancer
                ))
            })
    }

    /// Run `call` against a selected node, tagging any failure with the call site
    pub async fn call<T, E, F, Fut>(&self, method: &str, call: F) -> Result<T>
    where
        F: FnOnce(Endpoint) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Display,
    {
        let node = self.select_node(method)?;
        debug!(
            service = %self.service_name,
            method = %method,
            node = %node.address(),
            "Calling upstream service"
        );

        let (host, port) = (node.host.clone(), node.port);
        call(node).await.map_err(|e| {
            Error::Rpc(format!(
                "host:{host},port:{port},serviceName:{},loadBalancer:{},method:{method},err:{e}",
                self.service_name, self.load_balancer
            ))
        })
    }
}
