//! Fakes shared by unit tests

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::discovery::load_balancer::NodeSink;
use crate::discovery::registry::{
    DeregisterRequest, InstanceList, InstanceQuery, RawInstance, RegistryClient,
};
use crate::error::{Error, Result};
use crate::sync::message::PipeMessage;
use crate::sync::transport::MessageSender;
use nodesync_core::Endpoint;

/// Records every message; optionally rejects them all
pub struct RecordingSender {
    received: Mutex<Vec<PipeMessage>>,
    fail: bool,
}

impl RecordingSender {
    pub fn new() -> Self {
        Self {
            received: Mutex::new(Vec::new()),
            fail: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            received: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn received(&self) -> Vec<PipeMessage> {
        self.received.lock().clone()
    }
}

#[async_trait]
impl MessageSender for RecordingSender {
    async fn send(&self, message: &PipeMessage) -> Result<()> {
        if self.fail {
            return Err(Error::Transport("recipient unavailable".to_string()));
        }
        self.received.lock().push(message.clone());
        Ok(())
    }
}

/// Node sink keeping the last list per service and a call log
#[derive(Default)]
pub struct RecordingSink {
    state: Mutex<BTreeMap<String, (String, Vec<Endpoint>)>>,
    calls: AtomicUsize,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn nodes(&self, service_name: &str) -> Option<Vec<Endpoint>> {
        self.state.lock().get(service_name).map(|(_, nodes)| nodes.clone())
    }

    pub fn snapshot(&self) -> BTreeMap<String, (String, Vec<Endpoint>)> {
        self.state.lock().clone()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl NodeSink for RecordingSink {
    fn set_nodes(&self, service_name: &str, load_balancer: &str, nodes: Vec<Endpoint>) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.state
            .lock()
            .insert(service_name.to_string(), (load_balancer.to_string(), nodes));
    }
}

/// In-memory registry whose contents tests can change between polls
#[derive(Default)]
pub struct StaticRegistry {
    hosts: Mutex<HashMap<String, Vec<RawInstance>>>,
    failing: Mutex<HashSet<String>>,
    list_calls: AtomicUsize,
    deregistered: Mutex<Vec<DeregisterRequest>>,
}

impl StaticRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_hosts(&self, service_name: &str, hosts: &[(&str, u16)]) {
        let hosts = hosts
            .iter()
            .map(|(ip, port)| RawInstance {
                ip: Some((*ip).to_string()),
                port: Some(*port),
                weight: Some(1.0),
                healthy: true,
                path_prefix: None,
            })
            .collect();
        self.hosts.lock().insert(service_name.to_string(), hosts);
    }

    pub fn fail(&self, service_name: &str) {
        self.failing.lock().insert(service_name.to_string());
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn deregistered(&self) -> Vec<DeregisterRequest> {
        self.deregistered.lock().clone()
    }
}

#[async_trait]
impl RegistryClient for StaticRegistry {
    async fn list_instances(&self, query: &InstanceQuery) -> Result<InstanceList> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.lock().contains(&query.service_name) {
            return Err(Error::Registry(format!("{} unavailable", query.service_name)));
        }
        let hosts = self
            .hosts
            .lock()
            .get(&query.service_name)
            .cloned()
            .unwrap_or_default();
        Ok(InstanceList { hosts })
    }

    async fn deregister_instance(&self, request: &DeregisterRequest) -> Result<()> {
        if self.failing.lock().contains(&request.service_name) {
            return Err(Error::Registry(format!("{} unavailable", request.service_name)));
        }
        self.deregistered.lock().push(request.clone());
        Ok(())
    }
}

/// Registry answering every listing after a delay, tracking peak concurrency
pub struct SlowRegistry {
    delay: Duration,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    calls: AtomicUsize,
}

impl SlowRegistry {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RegistryClient for SlowRegistry {
    async fn list_instances(&self, _query: &InstanceQuery) -> Result<InstanceList> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(InstanceList::default())
    }

    async fn deregister_instance(&self, _request: &DeregisterRequest) -> Result<()> {
        Ok(())
    }
}
