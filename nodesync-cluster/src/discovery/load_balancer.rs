//! Per-service load balancers
//!
//! Each process keeps one [`LoadBalancer`] per upstream service. Node lists
//! arrive only through [`NodeSink::set_nodes`]; selection never talks to the
//! registry.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use nodesync_core::Endpoint;

/// Load balancing strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadBalancingStrategy {
    /// Random selection
    Random,
    /// Round-robin
    RoundRobin,
    /// Random selection proportional to weight
    WeightedRandom,
    /// Smooth weighted round-robin
    WeightedRoundRobin,
}

impl LoadBalancingStrategy {
    /// Resolve a configured balancer name, falling back to random
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "random" => Self::Random,
            "rr" | "round-robin" | "round_robin" => Self::RoundRobin,
            "weighted-random" | "weighted_random" => Self::WeightedRandom,
            "wrr" | "weighted-round-robin" | "weighted_round_robin" => Self::WeightedRoundRobin,
            other => {
                warn!(load_balancer = %other, "Unknown load balancer, using random");
                Self::Random
            }
        }
    }
}

/// Receives node lists produced by the sync engine
pub trait NodeSink: Send + Sync {
    /// Replace the nodes of one service. An empty list is a valid state.
    fn set_nodes(&self, service_name: &str, load_balancer: &str, nodes: Vec<Endpoint>);
}

/// Node selection for one service
pub struct LoadBalancer {
    service_name: String,
    strategy: LoadBalancingStrategy,
    nodes: RwLock<Arc<Vec<Endpoint>>>,
    round_robin_index: AtomicUsize,
    current_weights: Mutex<Vec<i64>>,
}

impl LoadBalancer {
    #[must_use]
    pub fn new(service_name: impl Into<String>, strategy: LoadBalancingStrategy) -> Self {
        Self {
            service_name: service_name.into(),
            strategy,
            nodes: RwLock::new(Arc::new(Vec::new())),
            round_robin_index: AtomicUsize::new(0),
            current_weights: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    #[must_use]
    pub const fn strategy(&self) -> LoadBalancingStrategy {
        self.strategy
    }

    /// Replace the node list
    pub fn set_nodes(&self, nodes: Vec<Endpoint>) {
        let mut weights = self.current_weights.lock();
        *self.nodes.write() = Arc::new(nodes);
        weights.clear();
    }

    /// Current node list
    #[must_use]
    pub fn nodes(&self) -> Arc<Vec<Endpoint>> {
        self.nodes.read().clone()
    }

    /// Select a node for the next request
    pub fn select(&self) -> Result<Endpoint> {
        let nodes = self.nodes();
        if nodes.is_empty() {
            return Err(Error::NotFound(format!(
                "No available nodes for service {}",
                self.service_name
            )));
        }

        let index = match self.strategy {
            LoadBalancingStrategy::Random => random_index(nodes.len()),
            LoadBalancingStrategy::RoundRobin => self.next_round_robin(nodes.len()),
            LoadBalancingStrategy::WeightedRandom => {
                weighted_random_index(&nodes).unwrap_or_else(|| random_index(nodes.len()))
            }
            LoadBalancingStrategy::WeightedRoundRobin => self
                .smooth_weighted_index(&nodes)
                .unwrap_or_else(|| self.next_round_robin(nodes.len())),
        };

        Ok(nodes[index].clone())
    }

    fn next_round_robin(&self, len: usize) -> usize {
        self.round_robin_index.fetch_add(1, Ordering::AcqRel) % len
    }

    /// Smooth weighted round-robin, `None` when every weight is zero
    fn smooth_weighted_index(&self, nodes: &[Endpoint]) -> Option<usize> {
        let total: i64 = nodes.iter().map(|n| i64::from(n.weight)).sum();
        if total == 0 {
            return None;
        }

        let mut current = self.current_weights.lock();
        if current.len() != nodes.len() {
            *current = vec![0; nodes.len()];
        }

        let mut best = 0;
        for (i, node) in nodes.iter().enumerate() {
            current[i] += i64::from(node.weight);
            if current[i] > current[best] {
                best = i;
            }
        }
        current[best] -= total;
        Some(best)
    }
}

#[allow(clippy::cast_possible_truncation)]
fn random_index(len: usize) -> usize {
    (rand::random::<u64>() % len as u64) as usize
}

/// Weighted random pick, `None` when every weight is zero
fn weighted_random_index(nodes: &[Endpoint]) -> Option<usize> {
    let total: u64 = nodes.iter().map(|n| u64::from(n.weight)).sum();
    if total == 0 {
        return None;
    }

    let mut point = rand::random::<u64>() % total;
    for (i, node) in nodes.iter().enumerate() {
        let weight = u64::from(node.weight);
        if point < weight {
            return Some(i);
        }
        point -= weight;
    }
    None
}

/// Load balancers of one process, keyed by service name
#[derive(Default)]
pub struct LoadBalancerManager {
    balancers: DashMap<String, Arc<LoadBalancer>>,
}

impl LoadBalancerManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Balancer for `service_name`, created on first use
    ///
    /// The strategy is fixed when the balancer is created.
    pub fn get_instance(&self, service_name: &str, load_balancer: &str) -> Arc<LoadBalancer> {
        if let Some(existing) = self.balancers.get(service_name) {
            return existing.clone();
        }
        self.balancers
            .entry(service_name.to_string())
            .or_insert_with(|| {
                debug!(service = %service_name, load_balancer = %load_balancer, "Creating load balancer");
                Arc::new(LoadBalancer::new(
                    service_name,
                    LoadBalancingStrategy::from_name(load_balancer),
                ))
            })
            .clone()
    }

    #[must_use]
    pub fn get(&self, service_name: &str) -> Option<Arc<LoadBalancer>> {
        self.balancers.get(service_name).map(|b| b.clone())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.balancers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.balancers.is_empty()
    }
}

impl NodeSink for LoadBalancerManager {
    fn set_nodes(&self, service_name: &str, load_balancer: &str, nodes: Vec<Endpoint>) {
        debug!(service = %service_name, nodes = nodes.len(), "Updating service nodes");
        self.get_instance(service_name, load_balancer).set_nodes(nodes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn node(host: &str, weight: u32) -> Endpoint {
        Endpoint::new(host, 80, weight, "")
    }

    #[test]
    fn test_strategy_names() {
        assert_eq!(LoadBalancingStrategy::from_name("rr"), LoadBalancingStrategy::RoundRobin);
        assert_eq!(LoadBalancingStrategy::from_name("Random"), LoadBalancingStrategy::Random);
        assert_eq!(
            LoadBalancingStrategy::from_name("weighted-round-robin"),
            LoadBalancingStrategy::WeightedRoundRobin
        );
        assert_eq!(
            LoadBalancingStrategy::from_name("weighted-random"),
            LoadBalancingStrategy::WeightedRandom
        );
        assert_eq!(LoadBalancingStrategy::from_name("bogus"), LoadBalancingStrategy::Random);
    }

    #[test]
    fn test_select_without_nodes() {
        let lb = LoadBalancer::new("order-svc", LoadBalancingStrategy::RoundRobin);
        assert!(matches!(lb.select(), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_round_robin_cycles() {
        let lb = LoadBalancer::new("order-svc", LoadBalancingStrategy::RoundRobin);
        lb.set_nodes(vec![node("a", 100), node("b", 100), node("c", 100)]);

        let picks: Vec<_> = (0..6).map(|_| lb.select().unwrap().host).collect();
        assert_eq!(picks, vec!["a", "b", "c", "a", "b", "c"]);
    }

    #[test]
    fn test_smooth_weighted_round_robin() {
        let lb = LoadBalancer::new("order-svc", LoadBalancingStrategy::WeightedRoundRobin);
        lb.set_nodes(vec![node("a", 500), node("b", 100), node("c", 100)]);

        let picks: Vec<_> = (0..7).map(|_| lb.select().unwrap().host).collect();
        assert_eq!(picks, vec!["a", "a", "b", "a", "c", "a", "a"]);
    }

    #[test]
    fn test_weighted_random_skips_zero_weight() {
        let lb = LoadBalancer::new("order-svc", LoadBalancingStrategy::WeightedRandom);
        lb.set_nodes(vec![node("a", 0), node("b", 100)]);

        for _ in 0..50 {
            assert_eq!(lb.select().unwrap().host, "b");
        }
    }

    #[test]
    fn test_random_only_returns_known_nodes() {
        let lb = LoadBalancer::new("order-svc", LoadBalancingStrategy::Random);
        lb.set_nodes(vec![node("a", 100), node("b", 100)]);

        let mut seen = HashMap::new();
        for _ in 0..100 {
            *seen.entry(lb.select().unwrap().host).or_insert(0) += 1;
        }
        assert!(seen.keys().all(|h| h == "a" || h == "b"));
    }

    #[test]
    fn test_manager_empty_list_replaces_nodes() {
        let manager = LoadBalancerManager::new();
        manager.set_nodes("order-svc", "rr", vec![node("a", 100)]);
        assert_eq!(manager.get("order-svc").unwrap().nodes().len(), 1);

        manager.set_nodes("order-svc", "rr", Vec::new());
        assert!(manager.get("order-svc").unwrap().nodes().is_empty());
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_manager_keeps_first_strategy() {
        let manager = LoadBalancerManager::new();
        let first = manager.get_instance("order-svc", "rr");
        let second = manager.get_instance("order-svc", "random");

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.strategy(), LoadBalancingStrategy::RoundRobin);
    }
}
