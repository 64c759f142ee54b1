//! Node information definitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Node ID
///
/// Nodes live in a 16-bit address space. The role is carried explicitly in
/// [`NodeInfo::role`] and never inferred from the numeric value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u16);

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:04X}", self.0)
    }
}

impl std::str::FromStr for NodeId {
    type Err = std::num::ParseIntError;

    /// Accepts decimal or `0x`-prefixed hex
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let value = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            Some(hex) => u16::from_str_radix(hex, 16)?,
            None => s.parse::<u16>()?,
        };
        Ok(NodeId(value))
    }
}

/// Node role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeRole {
    /// Holds authoritative metadata for a range of the ring
    Superpeer,
    /// Holds chunk payloads
    Peer,
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeRole::Superpeer => write!(f, "superpeer"),
            NodeRole::Peer => write!(f, "peer"),
        }
    }
}

/// Node status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeStatus {
    /// Serving requests
    Active,
    /// Graceful shutdown in progress, chunks are being migrated away
    Leaving,
    /// Crashed or heartbeat timed out, recovery pending
    Failed,
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeStatus::Active => write!(f, "active"),
            NodeStatus::Leaving => write!(f, "leaving"),
            NodeStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Node information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Node ID
    pub id: NodeId,
    /// Superpeer or peer
    pub role: NodeRole,
    /// Lifecycle status
    pub status: NodeStatus,
    /// Network address (host:port)
    pub addr: String,
    /// Last heartbeat time
    pub last_heartbeat: DateTime<Utc>,
    /// Registration time
    pub registered_at: DateTime<Utc>,
    /// Bytes of chunk payload this node may host (peers only)
    pub capacity_bytes: u64,
    /// Next local chunk counter for chunks created on this node
    pub next_local_id: u64,
}

impl NodeInfo {
    /// Create a new active node
    pub fn new(id: NodeId, role: NodeRole, addr: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            role,
            status: NodeStatus::Active,
            addr: addr.into(),
            last_heartbeat: now,
            registered_at: now,
            capacity_bytes: u64::MAX,
            next_local_id: 1,
        }
    }

    pub fn superpeer(id: NodeId, addr: impl Into<String>) -> Self {
        Self::new(id, NodeRole::Superpeer, addr)
    }

    pub fn peer(id: NodeId, addr: impl Into<String>) -> Self {
        Self::new(id, NodeRole::Peer, addr)
    }

    /// Set capacity
    pub fn with_capacity(mut self, capacity_bytes: u64) -> Self {
        self.capacity_bytes = capacity_bytes;
        self
    }

    /// Update heartbeat
    pub fn touch(&mut self) {
        self.last_heartbeat = Utc::now();
    }

    /// Check if heartbeat timed out
    pub fn is_heartbeat_timeout(&self, timeout_secs: i64) -> bool {
        let elapsed = Utc::now().signed_duration_since(self.last_heartbeat);
        elapsed.num_seconds() > timeout_secs
    }

    pub fn is_active(&self) -> bool {
        self.status == NodeStatus::Active
    }

    /// Active peer that can host chunk payloads
    pub fn is_placement_candidate(&self) -> bool {
        self.role == NodeRole::Peer && self.status == NodeStatus::Active
    }
}
