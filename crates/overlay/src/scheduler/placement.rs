//! Chunk placement strategy

use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::error::{OverlayError, Result};
use crate::metadata::{MetadataDirectory, NodeId, NodeInfo};
use crate::node_manager::NodeRegistry;

/// Placement strategy
#[derive(Debug, Clone)]
pub struct PlacementStrategy {
    /// Prefer least-loaded peers; otherwise lowest node ID first
    pub load_balance: bool,
}

impl Default for PlacementStrategy {
    fn default() -> Self {
        Self { load_balance: true }
    }
}

impl PlacementStrategy {
    /// Select up to `count` peers able to take `size` more bytes
    ///
    /// `available_nodes` must already be restricted to active peers.
    pub fn select_nodes(
        &self,
        available_nodes: &[NodeInfo],
        usage: &HashMap<NodeId, u64>,
        size: u64,
        exclude: &[NodeId],
        count: usize,
    ) -> Vec<NodeId> {
        if count == 0 || available_nodes.is_empty() {
            return Vec::new();
        }

        let mut candidates: Vec<_> = available_nodes
            .iter()
            .filter(|n| !exclude.contains(&n.id))
            .filter(|n| {
                let used = usage.get(&n.id).copied().unwrap_or(0);
                used.saturating_add(size) <= n.capacity_bytes
            })
            .collect();

        if self.load_balance {
            candidates.sort_by(|a, b| {
                let load_a = load(a, usage);
                let load_b = load(b, usage);
                load_a
                    .partial_cmp(&load_b)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.id.cmp(&b.id))
            });
        } else {
            candidates.sort_by_key(|n| n.id);
        }

        candidates.into_iter().take(count).map(|n| n.id).collect()
    }
}

/// Fraction of capacity in use
fn load(node: &NodeInfo, usage: &HashMap<NodeId, u64>) -> f64 {
    let used = usage.get(&node.id).copied().unwrap_or(0);
    if node.capacity_bytes == 0 {
        return f64::INFINITY;
    }
    used as f64 / node.capacity_bytes as f64
}

/// Picks owners and backups for chunks
pub struct PlacementEngine {
    registry: Arc<NodeRegistry>,
    directory: Arc<MetadataDirectory>,
    strategy: PlacementStrategy,
    backup_count: usize,
}

impl PlacementEngine {
    pub fn new(
        registry: Arc<NodeRegistry>,
        directory: Arc<MetadataDirectory>,
        strategy: PlacementStrategy,
        backup_count: usize,
    ) -> Self {
        Self {
            registry,
            directory,
            strategy,
            backup_count,
        }
    }

    /// Choose the owner for a new chunk
    ///
    /// The preferred node wins if it is an active peer with room; otherwise
    /// the least-loaded active peer is used.
    pub async fn place(&self, size_hint: u64, preferred: Option<NodeId>) -> Result<NodeId> {
        let peers = self.registry.active_peers().await;
        let usage = self.directory.usage_by_owner();

        if let Some(preferred) = preferred {
            let fits = self
                .strategy
                .select_nodes(&peers, &usage, size_hint, &[], usize::MAX)
                .contains(&preferred);
            if fits {
                return Ok(preferred);
            }
            debug!(
                "Preferred node {} cannot take {} bytes, falling back",
                preferred, size_hint
            );
        }

        self.place_excluding(size_hint, &[]).await
    }

    /// Least-loaded active peer not in `exclude`
    pub async fn place_excluding(&self, size_hint: u64, exclude: &[NodeId]) -> Result<NodeId> {
        let peers = self.registry.active_peers().await;
        let usage = self.directory.usage_by_owner();
        self.strategy
            .select_nodes(&peers, &usage, size_hint, exclude, 1)
            .into_iter()
            .next()
            .ok_or(OverlayError::NoCapacity { size: size_hint })
    }

    /// Backup peers for a chunk owned by `owner`, may return fewer than configured
    pub async fn select_backups(&self, owner: NodeId, size: u64) -> Vec<NodeId> {
        if self.backup_count == 0 {
            return Vec::new();
        }
        let peers = self.registry.active_peers().await;
        let usage = self.directory.usage_by_owner();
        self.strategy
            .select_nodes(&peers, &usage, size, &[owner], self.backup_count)
    }
}
