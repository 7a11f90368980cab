//! Routing data shared by the fetcher, the sync driver and the load balancers
//!
//! Everything here is a plain value: produced fresh on every registry fetch,
//! compared structurally, and copied between processes.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// One routable upstream instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    /// Integer weight, already scaled ×100 from the registry's fractional weight
    pub weight: u32,
    #[serde(default)]
    pub path_prefix: String,
}

impl Endpoint {
    #[must_use]
    pub fn new(
        host: impl Into<String>,
        port: u16,
        weight: u32,
        path_prefix: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            weight,
            path_prefix: path_prefix.into(),
        }
    }

    /// `host:port`
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Node list of one logical service at one point in time
///
/// Equality is structural and order-sensitive on `nodes`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSnapshot {
    pub service_name: String,
    pub load_balancer: String,
    pub nodes: Vec<Endpoint>,
}

impl ServiceSnapshot {
    #[must_use]
    pub fn new(
        service_name: impl Into<String>,
        load_balancer: impl Into<String>,
        nodes: Vec<Endpoint>,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            load_balancer: load_balancer.into(),
            nodes,
        }
    }

    /// Snapshot with no nodes, used when a registry query fails
    #[must_use]
    pub fn empty(service_name: impl Into<String>, load_balancer: impl Into<String>) -> Self {
        Self::new(service_name, load_balancer, Vec::new())
    }
}

/// Snapshots sorted by service name
///
/// Construction always sorts, so two batches fetched in a different
/// registry response order compare (and fingerprint) equal. Decoding goes
/// through the same path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<ServiceSnapshot>")]
pub struct SyncBatch(Vec<ServiceSnapshot>);

impl SyncBatch {
    #[must_use]
    pub fn new(mut snapshots: Vec<ServiceSnapshot>) -> Self {
        snapshots.sort_by(|a, b| a.service_name.cmp(&b.service_name));
        Self(snapshots)
    }

    /// Batch holding a single service, as produced by a push notification
    #[must_use]
    pub fn single(snapshot: ServiceSnapshot) -> Self {
        Self(vec![snapshot])
    }

    #[must_use]
    pub fn snapshots(&self) -> &[ServiceSnapshot] {
        &self.0
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ServiceSnapshot> {
        self.0.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Total number of endpoints across all services
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.0.iter().map(|s| s.nodes.len()).sum()
    }

    /// Content fingerprint used for change detection
    ///
    /// Covers service name, load balancer name and every node field in
    /// order. Strings are length-prefixed so field boundaries cannot alias.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update((self.0.len() as u64).to_be_bytes());
        for snapshot in &self.0 {
            put_str(&mut hasher, &snapshot.service_name);
            put_str(&mut hasher, &snapshot.load_balancer);
            hasher.update((snapshot.nodes.len() as u64).to_be_bytes());
            for node in &snapshot.nodes {
                put_str(&mut hasher, &node.host);
                hasher.update(node.port.to_be_bytes());
                hasher.update(node.weight.to_be_bytes());
                put_str(&mut hasher, &node.path_prefix);
            }
        }
        hex::encode(hasher.finalize())
    }
}

fn put_str(hasher: &mut Sha256, value: &str) {
    hasher.update((value.len() as u64).to_be_bytes());
    hasher.update(value.as_bytes());
}

impl From<Vec<ServiceSnapshot>> for SyncBatch {
    fn from(snapshots: Vec<ServiceSnapshot>) -> Self {
        Self::new(snapshots)
    }
}

impl FromIterator<ServiceSnapshot> for SyncBatch {
    fn from_iter<I: IntoIterator<Item = ServiceSnapshot>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a SyncBatch {
    type Item = &'a ServiceSnapshot;
    type IntoIter = std::slice::Iter<'a, ServiceSnapshot>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
