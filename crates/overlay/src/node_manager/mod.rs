//! Node registry
//!
//! Responsible for node join/leave, heartbeat tracking and failure detection

use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{OverlayError, Result};
use crate::metadata::{NodeId, NodeInfo, NodeStatus};

/// Node registry configuration
#[derive(Debug, Clone)]
pub struct NodeRegistryConfig {
    /// Heartbeat timeout (seconds)
    pub heartbeat_timeout_secs: i64,
    /// Heartbeat check interval (seconds)
    pub check_interval_secs: u64,
}

impl Default for NodeRegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_secs: 30,
            check_interval_secs: 10,
        }
    }
}

/// Point-in-time view of the registry, sorted by node ID
///
/// Iterating is lazy and may be repeated any number of times.
#[derive(Debug, Clone, Default)]
pub struct NodeListing {
    nodes: Arc<Vec<NodeInfo>>,
}

impl NodeListing {
    pub fn iter(&self) -> std::slice::Iter<'_, NodeInfo> {
        self.nodes.iter()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.iter().any(|n| n.id == id)
    }
}

impl<'a> IntoIterator for &'a NodeListing {
    type Item = &'a NodeInfo;
    type IntoIter = std::slice::Iter<'a, NodeInfo>;

    fn into_iter(self) -> Self::IntoIter {
        self.nodes.iter()
    }
}

/// Join result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterResult {
    /// New node
    NewNode,
    /// Active node re-announced itself
    Reconnected,
}

/// Node registry
pub struct NodeRegistry {
    config: NodeRegistryConfig,
    nodes: RwLock<HashMap<NodeId, NodeInfo>>,
}

impl NodeRegistry {
    pub fn new(config: NodeRegistryConfig) -> Self {
        Self {
            config,
            nodes: RwLock::new(HashMap::new()),
        }
    }

    /// Rebuild from persisted nodes
    pub fn restore(config: NodeRegistryConfig, nodes: Vec<NodeInfo>) -> Self {
        let nodes = nodes.into_iter().map(|n| (n.id, n)).collect();
        Self {
            config,
            nodes: RwLock::new(nodes),
        }
    }

    pub fn config(&self) -> &NodeRegistryConfig {
        &self.config
    }

    /// Register a node
    ///
    /// An active node may re-announce itself with the same role. A leaving or
    /// failed identity must be removed before it can join again.
    pub async fn join(&self, node: NodeInfo) -> Result<RegisterResult> {
        let mut nodes = self.nodes.write().await;
        if let Some(existing) = nodes.get_mut(&node.id) {
            if existing.status != NodeStatus::Active || existing.role != node.role {
                warn!(
                    "Rejected join of {}: registered as {} {}",
                    node.id, existing.status, existing.role
                );
                return Err(OverlayError::AlreadyRegistered(node.id));
            }
            existing.addr = node.addr;
            existing.touch();
            info!("Node re-registered: {}", node.id);
            return Ok(RegisterResult::Reconnected);
        }

        info!("New {} registered: {} at {}", node.role, node.id, node.addr);
        nodes.insert(node.id, node);
        Ok(RegisterResult::NewNode)
    }

    /// Mark a node as departing
    ///
    /// Graceful: `active -> leaving`. Ungraceful: `active|leaving -> failed`.
    /// Returns the previous status.
    pub async fn leave(&self, node_id: NodeId, graceful: bool) -> Result<NodeStatus> {
        let mut nodes = self.nodes.write().await;
        let node = nodes
            .get_mut(&node_id)
            .ok_or(OverlayError::UnknownNode(node_id))?;
        let previous = node.status;

        node.status = match (previous, graceful) {
            (NodeStatus::Active, true) | (NodeStatus::Leaving, true) => NodeStatus::Leaving,
            (NodeStatus::Active, false) | (NodeStatus::Leaving, false) => NodeStatus::Failed,
            (NodeStatus::Failed, false) => NodeStatus::Failed,
            (NodeStatus::Failed, true) => {
                return Err(OverlayError::InvalidTransition {
                    node: node_id,
                    reason: "failed node cannot shut down gracefully".to_string(),
                })
            }
        };
        info!("Node {} is now {} (was {})", node_id, node.status, previous);
        Ok(previous)
    }

    /// Return a leaving node to service, used when its shutdown was aborted
    pub async fn reactivate(&self, node_id: NodeId) -> Result<()> {
        let mut nodes = self.nodes.write().await;
        let node = nodes
            .get_mut(&node_id)
            .ok_or(OverlayError::UnknownNode(node_id))?;
        if node.status != NodeStatus::Leaving {
            return Err(OverlayError::InvalidTransition {
                node: node_id,
                reason: format!("cannot reactivate a {} node", node.status),
            });
        }
        node.status = NodeStatus::Active;
        node.touch();
        info!("Node {} reactivated", node_id);
        Ok(())
    }

    /// Remove a departed node
    pub async fn remove(&self, node_id: NodeId) -> Result<NodeInfo> {
        let mut nodes = self.nodes.write().await;
        match nodes.get(&node_id).map(|n| n.status) {
            None => Err(OverlayError::UnknownNode(node_id)),
            Some(NodeStatus::Active) => Err(OverlayError::InvalidTransition {
                node: node_id,
                reason: "active node must leave before removal".to_string(),
            }),
            Some(_) => {
                let node = nodes
                    .remove(&node_id)
                    .ok_or(OverlayError::UnknownNode(node_id))?;
                info!("Node {} removed from registry", node_id);
                Ok(node)
            }
        }
    }

    /// Handle heartbeat
    pub async fn heartbeat(&self, node_id: NodeId) -> Result<()> {
        let mut nodes = self.nodes.write().await;
        let Some(node) = nodes.get_mut(&node_id) else {
            warn!("Heartbeat from unknown node: {}", node_id);
            return Err(OverlayError::UnknownNode(node_id));
        };
        if node.status == NodeStatus::Failed {
            return Err(OverlayError::InvalidTransition {
                node: node_id,
                reason: "failed node must rejoin".to_string(),
            });
        }
        node.touch();
        debug!("Heartbeat from node: {}", node_id);
        Ok(())
    }

    /// Get node information
    pub async fn get(&self, node_id: NodeId) -> Result<NodeInfo> {
        self.nodes
            .read()
            .await
            .get(&node_id)
            .cloned()
            .ok_or(OverlayError::UnknownNode(node_id))
    }

    /// All registered nodes
    pub async fn list(&self) -> NodeListing {
        let nodes = self.nodes.read().await;
        let mut listing: Vec<_> = nodes.values().cloned().collect();
        listing.sort_by_key(|n| n.id);
        NodeListing {
            nodes: Arc::new(listing),
        }
    }

    /// Active peers, the only placement candidates
    pub async fn active_peers(&self) -> Vec<NodeInfo> {
        let nodes = self.nodes.read().await;
        let mut peers: Vec<_> = nodes
            .values()
            .filter(|n| n.is_placement_candidate())
            .cloned()
            .collect();
        peers.sort_by_key(|n| n.id);
        peers
    }

    pub async fn is_active_peer(&self, node_id: NodeId) -> bool {
        self.nodes
            .read()
            .await
            .get(&node_id)
            .map(|n| n.is_placement_candidate())
            .unwrap_or(false)
    }

    /// Reserve `count` local chunk counters on a node
    pub async fn allocate_local_ids(&self, node_id: NodeId, count: u64) -> Result<Range<u64>> {
        let mut nodes = self.nodes.write().await;
        let node = nodes
            .get_mut(&node_id)
            .ok_or(OverlayError::UnknownNode(node_id))?;
        let start = node.next_local_id;
        node.next_local_id += count;
        Ok(start..node.next_local_id)
    }

    /// Active nodes whose heartbeat timed out
    pub async fn expired_nodes(&self) -> Vec<NodeId> {
        let nodes = self.nodes.read().await;
        let timeout_secs = self.config.heartbeat_timeout_secs;
        nodes
            .values()
            .filter(|n| n.status == NodeStatus::Active && n.is_heartbeat_timeout(timeout_secs))
            .map(|n| n.id)
            .collect()
    }

    pub async fn snapshot(&self) -> Vec<NodeInfo> {
        self.list().await.iter().cloned().collect()
    }
}
