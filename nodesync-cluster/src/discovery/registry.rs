//! Registry client seam
//!
//! The sync engine only needs two calls from the naming service: list the
//! instances of one service and remove one instance. Everything else about
//! the registry protocol stays behind [`RegistryClient`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use nodesync_core::Endpoint;

/// Who is asking, reported so the registry can push updates back over UDP
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientIdentity {
    pub app: String,
    pub client_ip: String,
    /// 0 when the push listener is disabled
    pub udp_port: u16,
}

/// Parameters of one instance listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceQuery {
    pub service_name: String,
    pub group_name: String,
    pub namespace_id: String,
    pub healthy_only: bool,
}

/// One instance as the registry reports it
///
/// Every field is optional on the wire; [`RawInstance::to_endpoint`] decides
/// what is routable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawInstance {
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub weight: Option<f64>,
    #[serde(default)]
    pub healthy: bool,
    #[serde(default)]
    pub path_prefix: Option<String>,
}

impl RawInstance {
    /// Routable endpoint, or `None` for unhealthy or incomplete instances
    #[must_use]
    pub fn to_endpoint(&self) -> Option<Endpoint> {
        if !self.healthy {
            return None;
        }
        let host = self.ip.as_deref().filter(|ip| !ip.is_empty())?;
        let port = self.port.filter(|p| *p != 0)?;

        Some(Endpoint::new(
            host,
            port,
            normalize_weight(self.weight),
            self.path_prefix.clone().unwrap_or_default(),
        ))
    }
}

/// Scale a fractional registry weight to an integer percentage
///
/// Missing weight counts as 1.0, negative or non-finite as 0.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn normalize_weight(weight: Option<f64>) -> u32 {
    let weight = weight.unwrap_or(1.0);
    if !weight.is_finite() || weight <= 0.0 {
        return 0;
    }
    let scaled = (weight * 100.0).round();
    if scaled >= f64::from(u32::MAX) {
        u32::MAX
    } else {
        scaled as u32
    }
}

/// Body of an instance listing
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceList {
    #[serde(default)]
    pub hosts: Vec<RawInstance>,
}

impl InstanceList {
    /// Routable endpoints in registry order
    #[must_use]
    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.hosts.iter().filter_map(RawInstance::to_endpoint).collect()
    }
}

/// Identifies one registered instance to remove
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeregisterRequest {
    pub service_name: String,
    pub group_name: String,
    pub namespace_id: String,
    pub ip: String,
    pub port: u16,
    pub ephemeral: bool,
}

/// Naming service operations used by the sync engine
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// List instances of one service. Non-success responses are errors.
    async fn list_instances(&self, query: &InstanceQuery) -> Result<InstanceList>;

    async fn deregister_instance(&self, request: &DeregisterRequest) -> Result<()>;
}
