//! Registre des nodes et sélection par score de santé.
//!
//! The registry owns every [`Node`]. Scores are cached per node with a short
//! TTL and tagged with the node epoch, so a stats update or a state change
//! invalidates the cached value without any network round-trip.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use moka::sync::Cache;
use parking_lot::RwLock;
use tracing::debug;

use crate::errors::{LinkError, Result};
use crate::node::Node;
use crate::node::health::{NodeHealth, SystemHealth};

pub struct NodeRegistry {
    nodes: RwLock<HashMap<String, Arc<Node>>>,
    /// name → (epoch, score)
    health: Cache<String, (u64, f64)>,
}

impl NodeRegistry {
    pub fn new(health_ttl: Duration) -> Self {
        Self {
            nodes: RwLock::new(HashMap::new()),
            health: Cache::builder()
                .max_capacity(1024)
                .time_to_live(health_ttl)
                .build(),
        }
    }

    pub fn insert(&self, node: Arc<Node>) -> Result<()> {
        let mut nodes = self.nodes.write();
        if nodes.contains_key(node.name()) {
            return Err(LinkError::config(format!(
                "a node named '{}' already exists",
                node.name()
            )));
        }
        nodes.insert(node.name().to_string(), node);
        Ok(())
    }

    pub fn remove(&self, name: &str) -> Option<Arc<Node>> {
        self.health.invalidate(name);
        self.nodes.write().remove(name)
    }

    pub fn get(&self, name: &str) -> Option<Arc<Node>> {
        self.nodes.read().get(name).cloned()
    }

    pub fn all(&self) -> Vec<Arc<Node>> {
        let mut nodes: Vec<Arc<Node>> = self.nodes.read().values().cloned().collect();
        nodes.sort_by(|a, b| a.name().cmp(b.name()));
        nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }

    /// Score of `node`, served from the cache when its epoch did not move
    pub fn score(&self, node: &Node) -> f64 {
        let epoch = node.epoch();
        if let Some((cached_epoch, score)) = self.health.get(node.name()) {
            if cached_epoch == epoch {
                return score;
            }
        }
        let score = node.score();
        debug!(node = %node.name(), score, "Health score recomputed");
        self.health.insert(node.name().to_string(), (epoch, score));
        score
    }

    /// Connected nodes, best (lowest score) first
    pub fn least_loaded(&self) -> Vec<Arc<Node>> {
        let mut scored: Vec<(f64, Arc<Node>)> = self
            .all()
            .into_iter()
            .filter(|node| node.is_connected())
            .map(|node| (self.score(&node), node))
            .collect();
        scored.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.name().cmp(b.1.name())));
        scored.into_iter().map(|(_, node)| node).collect()
    }

    /// Best connected node tagged with `region`, else the least loaded one
    pub fn best_for_region(&self, region: &str) -> Option<Arc<Node>> {
        let candidates = self.least_loaded();
        candidates
            .iter()
            .find(|node| node.config().serves_region(region))
            .cloned()
            .or_else(|| {
                debug!(region, "No node in region, falling back to least loaded");
                candidates.into_iter().next()
            })
    }

    /// Best connected node other than `excluded`
    pub fn best_except(&self, excluded: &str) -> Option<Arc<Node>> {
        self.least_loaded()
            .into_iter()
            .find(|node| node.name() != excluded)
    }

    pub fn nodes_health(&self) -> Vec<NodeHealth> {
        self.all()
            .iter()
            .map(|node| {
                let mut health = node.health();
                health.score = self.score(node);
                health
            })
            .collect()
    }

    pub fn system_health(&self, sessions: usize) -> SystemHealth {
        SystemHealth::from_nodes(&self.nodes_health(), sessions)
    }

    pub fn clear(&self) -> Vec<Arc<Node>> {
        self.health.invalidate_all();
        self.nodes.write().drain().map(|(_, node)| node).collect()
    }
}
