//! Chunk identifiers and ownership records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::NodeId;

/// Mask of the node-local counter part of a chunk ID
pub const LOCAL_ID_MASK: u64 = (1 << 48) - 1;

/// Chunk ID
///
/// High 16 bits: creator node. Low 48 bits: creator-local allocation counter.
/// The creator never changes; the current owner lives in [`ChunkRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChunkId(pub u64);

impl ChunkId {
    pub fn new(creator: NodeId, local_id: u64) -> Self {
        ChunkId(((creator.0 as u64) << 48) | (local_id & LOCAL_ID_MASK))
    }

    /// Like [`ChunkId::new`], but `None` when the counter does not fit in 48 bits
    pub fn checked(creator: NodeId, local_id: u64) -> Option<Self> {
        (local_id <= LOCAL_ID_MASK).then(|| Self::new(creator, local_id))
    }

    /// Node that allocated this ID
    pub fn creator(&self) -> NodeId {
        NodeId((self.0 >> 48) as u16)
    }

    pub fn local_id(&self) -> u64 {
        self.0 & LOCAL_ID_MASK
    }
}

impl std::fmt::Display for ChunkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:016X}", self.0)
    }
}

impl std::str::FromStr for ChunkId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let value = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            Some(hex) => u64::from_str_radix(hex, 16)?,
            None => s.parse::<u64>()?,
        };
        Ok(ChunkId(value))
    }
}

/// Chunk availability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChunkState {
    /// Owner is serving the chunk
    Available,
    /// Owner failed and no backup survived
    Lost,
}

/// Ownership record for one chunk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub id: ChunkId,
    /// Current owner, updated on migration or backup promotion
    pub owner: NodeId,
    /// Payload size in bytes
    pub size: u64,
    /// Peers holding a backup copy
    pub backups: Vec<NodeId>,
    pub state: ChunkState,
    pub created_at: DateTime<Utc>,
}

impl ChunkRecord {
    pub fn new(id: ChunkId, owner: NodeId, size: u64, backups: Vec<NodeId>) -> Self {
        Self {
            id,
            owner,
            size,
            backups,
            state: ChunkState::Available,
            created_at: Utc::now(),
        }
    }

    /// Owned by a node other than its creator
    pub fn is_migrated(&self) -> bool {
        self.owner != self.id.creator()
    }

    pub fn is_lost(&self) -> bool {
        self.state == ChunkState::Lost
    }
}
