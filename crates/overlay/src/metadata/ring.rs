//! Superpeer ring
//!
//! Consistent hashing over a 32-bit ring. Each superpeer sits at the hash of
//! its node ID and is authoritative for the contiguous range ending at its
//! own position, i.e. `(predecessor, self]`.

use crc::{Crc, CRC_32_ISCSI};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{ChunkId, NodeId};
use crate::error::{OverlayError, Result};

/// CRC32 calculator for ring positions
static CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

const TAG_SUPERPEER: u8 = 0;
const TAG_CHUNK: u8 = 1;
const TAG_NAME: u8 = 2;
const TAG_TEMP: u8 = 3;

fn hash_tagged(tag: u8, bytes: &[u8]) -> u32 {
    let mut digest = CRC32.digest();
    digest.update(&[tag]);
    digest.update(bytes);
    digest.finalize()
}

/// Ring position of a chunk ownership record
pub fn position_for_chunk(chunk: ChunkId) -> u32 {
    hash_tagged(TAG_CHUNK, &chunk.0.to_be_bytes())
}

/// Ring position of a name binding
pub fn position_for_name(name: &str) -> u32 {
    hash_tagged(TAG_NAME, name.as_bytes())
}

/// Ring position of a temporary storage entry
pub fn position_for_temp(id: u32) -> u32 {
    hash_tagged(TAG_TEMP, &id.to_be_bytes())
}

fn position_for_superpeer(node: NodeId) -> u32 {
    hash_tagged(TAG_SUPERPEER, &node.0.to_be_bytes())
}

/// Ownership range of one superpeer, both ends inclusive, may wrap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardRange {
    pub superpeer: NodeId,
    pub start: u32,
    pub end: u32,
}

impl ShardRange {
    pub fn contains(&self, pos: u32) -> bool {
        if self.start <= self.end {
            pos >= self.start && pos <= self.end
        } else {
            pos >= self.start || pos <= self.end
        }
    }
}

impl std::fmt::Display for ShardRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[0x{:08X}, 0x{:08X}]", self.start, self.end)
    }
}

/// Result of routing a ring position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub authority: NodeId,
    /// Forwarding hops taken after the entry superpeer
    pub hops: usize,
}

/// Superpeer ring
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SuperpeerRing {
    /// Ring position -> superpeer
    positions: BTreeMap<u32, NodeId>,
    /// Incremented on every membership change
    pub version: u64,
}

impl SuperpeerRing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.position_of(node).is_some()
    }

    pub fn superpeers(&self) -> Vec<NodeId> {
        self.positions.values().copied().collect()
    }

    fn position_of(&self, node: NodeId) -> Option<u32> {
        self.positions
            .iter()
            .find(|(_, n)| **n == node)
            .map(|(pos, _)| *pos)
    }

    /// Insert a superpeer. Returns its position.
    pub fn add(&mut self, node: NodeId) -> u32 {
        if let Some(pos) = self.position_of(node) {
            return pos;
        }
        // Step past occupied positions
        let mut pos = position_for_superpeer(node);
        while self.positions.contains_key(&pos) {
            pos = pos.wrapping_add(1);
        }
        self.positions.insert(pos, node);
        self.version += 1;
        pos
    }

    pub fn remove(&mut self, node: NodeId) -> bool {
        match self.position_of(node) {
            Some(pos) => {
                self.positions.remove(&pos);
                self.version += 1;
                true
            }
            None => false,
        }
    }

    /// Superpeer authoritative for a position
    pub fn authority(&self, pos: u32) -> Option<NodeId> {
        self.positions
            .range(pos..)
            .next()
            .or_else(|| self.positions.iter().next())
            .map(|(_, n)| *n)
    }

    /// Next superpeer clockwise
    pub fn successor(&self, node: NodeId) -> Option<NodeId> {
        let pos = self.position_of(node)?;
        self.positions
            .range(pos.wrapping_add(1)..)
            .next()
            .filter(|_| pos != u32::MAX)
            .or_else(|| self.positions.iter().next())
            .map(|(_, n)| *n)
    }

    /// Range owned by a superpeer
    pub fn range_of(&self, node: NodeId) -> Option<ShardRange> {
        let end = self.position_of(node)?;
        let predecessor = self
            .positions
            .range(..end)
            .next_back()
            .or_else(|| self.positions.iter().next_back())
            .map(|(pos, _)| *pos)
            .unwrap_or(end);
        Some(ShardRange {
            superpeer: node,
            start: predecessor.wrapping_add(1),
            end,
        })
    }

    /// All ownership ranges in ring order
    pub fn ranges(&self) -> Vec<ShardRange> {
        self.positions
            .values()
            .filter_map(|n| self.range_of(*n))
            .collect()
    }

    /// Route a position starting at `entry`, forwarding to successors.
    ///
    /// Each superpeer only consults its own range; the walk is capped at the
    /// number of superpeers.
    pub fn route(&self, entry: NodeId, pos: u32) -> Result<Route> {
        if self.positions.is_empty() {
            return Err(OverlayError::NoSuperpeer);
        }
        if !self.contains(entry) {
            return Err(OverlayError::UnknownNode(entry));
        }

        let max_hops = self.positions.len();
        let mut current = entry;
        for hops in 0..=max_hops {
            let range = self
                .range_of(current)
                .ok_or(OverlayError::UnknownNode(current))?;
            if range.contains(pos) {
                return Ok(Route {
                    authority: current,
                    hops,
                });
            }
            current = self.successor(current).ok_or(OverlayError::NoSuperpeer)?;
        }
        Err(OverlayError::RoutingExceeded { hops: max_hops })
    }
}
