//! Nacos naming service client (open API v1)

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use tracing::debug;

use super::registry::{
    ClientIdentity, DeregisterRequest, InstanceList, InstanceQuery, RegistryClient,
};
use crate::error::{Error, Result};

const INSTANCE_LIST_PATH: &str = "/nacos/v1/ns/instance/list";
const INSTANCE_PATH: &str = "/nacos/v1/ns/instance";

/// HTTP client for a Nacos server
///
/// Listing requests carry `clientIP`, `udpPort` and `app`, which subscribes
/// this host to UDP push notifications for the queried service.
pub struct NacosRegistryClient {
    base_url: String,
    identity: ClientIdentity,
    http_client: Client,
}

impl NacosRegistryClient {
    pub fn new(
        base_url: impl Into<String>,
        identity: ClientIdentity,
        timeout: Duration,
    ) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Configuration(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self::with_client(base_url, identity, http_client))
    }

    #[must_use]
    pub fn with_client(
        base_url: impl Into<String>,
        identity: ClientIdentity,
        http_client: Client,
    ) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            identity,
            http_client,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn check(response: reqwest::Response) -> Result<String> {
        let status = response.status();
        let body = response.text().await?;
        if status != StatusCode::OK {
            return Err(Error::RegistryStatus {
                status: status.as_u16(),
                body,
            });
        }
        Ok(body)
    }
}

#[async_trait]
impl RegistryClient for NacosRegistryClient {
    async fn list_instances(&self, query: &InstanceQuery) -> Result<InstanceList> {
        let params = [
            ("serviceName", query.service_name.clone()),
            ("groupName", query.group_name.clone()),
            ("namespaceId", query.namespace_id.clone()),
            ("healthyOnly", query.healthy_only.to_string()),
            ("clientIP", self.identity.client_ip.clone()),
            ("udpPort", self.identity.udp_port.to_string()),
            ("app", self.identity.app.clone()),
        ];

        let response = self
            .http_client
            .get(self.url(INSTANCE_LIST_PATH))
            .query(&params)
            .send()
            .await?;
        let body = Self::check(response).await?;

        let list: InstanceList = serde_json::from_str(&body)?;
        debug!(
            service = %query.service_name,
            hosts = list.hosts.len(),
            "Listed registry instances"
        );
        Ok(list)
    }

    async fn deregister_instance(&self, request: &DeregisterRequest) -> Result<()> {
        let params = [
            ("serviceName", request.service_name.clone()),
            ("groupName", request.group_name.clone()),
            ("namespaceId", request.namespace_id.clone()),
            ("ip", request.ip.clone()),
            ("port", request.port.to_string()),
            ("ephemeral", request.ephemeral.to_string()),
        ];

        let response = self
            .http_client
            .delete(self.url(INSTANCE_PATH))
            .query(&params)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }
}
