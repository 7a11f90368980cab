//! Registry access and per-service node selection

pub mod registry;
pub mod nacos;
pub mod fetcher;
pub mod load_balancer;

pub use registry::{
    ClientIdentity, DeregisterRequest, InstanceList, InstanceQuery, RawInstance, RegistryClient,
};
pub use nacos::NacosRegistryClient;
pub use fetcher::{SnapshotFetcher, MAX_CONCURRENT_QUERIES};
pub use load_balancer::{LoadBalancer, LoadBalancerManager, LoadBalancingStrategy, NodeSink};
