pub mod discovery;
pub mod error;
pub mod rpc;
pub mod sync;

#[cfg(test)]
pub mod test_helpers;

pub use discovery::{
    LoadBalancer, LoadBalancerManager, LoadBalancingStrategy, NodeSink, SnapshotFetcher,
};
pub use error::{Error, Result};
pub use rpc::ServiceClient;
pub use sync::{DriverFactory, PipeMessage, PushListener, SyncDriver};
