//! Batch registry queries for the configured consumers

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, error};

use super::registry::{InstanceQuery, RegistryClient};
use nodesync_core::metrics::REGISTRY_FETCH_FAILURES;
use nodesync_core::{ConsumerSpec, ServiceSnapshot, SyncBatch};

/// Upper bound on registry queries in flight at once
pub const MAX_CONCURRENT_QUERIES: usize = 8;

/// Queries the registry for consumer snapshots
///
/// A failed query never fails the batch: the service is still reported,
/// with no nodes.
#[derive(Clone)]
pub struct SnapshotFetcher {
    client: Arc<dyn RegistryClient>,
    group_name: String,
}

impl SnapshotFetcher {
    pub fn new(client: Arc<dyn RegistryClient>, group_name: impl Into<String>) -> Self {
        Self {
            client,
            group_name: group_name.into(),
        }
    }

    #[must_use]
    pub fn client(&self) -> &Arc<dyn RegistryClient> {
        &self.client
    }

    #[must_use]
    pub fn group_name(&self) -> &str {
        &self.group_name
    }

    /// Fetch every consumer, at most [`MAX_CONCURRENT_QUERIES`] at a time
    ///
    /// Chunks run one after another; queries within a chunk run concurrently.
    /// The result holds one snapshot per distinct service name, sorted.
    pub async fn fetch_all(&self, consumers: &[ConsumerSpec]) -> SyncBatch {
        let mut by_name = BTreeMap::new();

        for chunk in consumers.chunks(MAX_CONCURRENT_QUERIES) {
            let snapshots = join_all(chunk.iter().map(|consumer| self.fetch_one(consumer))).await;
            for snapshot in snapshots {
                by_name.insert(snapshot.service_name.clone(), snapshot);
            }
        }

        SyncBatch::new(by_name.into_values().collect())
    }

    /// Fetch one consumer, degrading to an empty node list on any error
    pub async fn fetch_one(&self, consumer: &ConsumerSpec) -> ServiceSnapshot {
        let query = InstanceQuery {
            service_name: consumer.name.clone(),
            group_name: self.group_name.clone(),
            namespace_id: consumer.namespace_id.clone(),
            healthy_only: true,
        };

        match self.client.list_instances(&query).await {
            Ok(list) => {
                let nodes = list.endpoints();
                debug!(service = %consumer.name, nodes = nodes.len(), "Fetched service nodes");
                ServiceSnapshot::new(&consumer.name, &consumer.load_balancer, nodes)
            }
            Err(e) => {
                error!(
                    service = %consumer.name,
                    namespace = %consumer.namespace_id,
                    error = %e,
                    "Registry query failed, using empty node list"
                );
                REGISTRY_FETCH_FAILURES.with_label_values(&[consumer.name.as_str()]).inc();
                ServiceSnapshot::empty(&consumer.name, &consumer.load_balancer)
            }
        }
    }
}
