//! Metadata shard held by one superpeer

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use super::ring::{position_for_chunk, position_for_name, position_for_temp, ShardRange};
use super::{ChunkId, ChunkRecord, NameBinding, NodeId};

/// Entry in the superpeer temporary storage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TempEntry {
    pub id: u32,
    pub size: u64,
    pub created_at: DateTime<Utc>,
}

/// Records a superpeer is authoritative for
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataShard {
    pub superpeer: NodeId,
    pub chunks: HashMap<ChunkId, ChunkRecord>,
    pub names: BTreeMap<String, NameBinding>,
    pub temp: BTreeMap<u32, TempEntry>,
}

impl MetadataShard {
    pub fn new(superpeer: NodeId) -> Self {
        Self {
            superpeer,
            chunks: HashMap::new(),
            names: BTreeMap::new(),
            temp: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty() && self.names.is_empty() && self.temp.is_empty()
    }

    /// Move out every record that falls inside `range`
    pub fn split_off(&mut self, range: &ShardRange) -> MetadataShard {
        let mut moved = MetadataShard::new(range.superpeer);

        let chunk_ids: Vec<_> = self
            .chunks
            .keys()
            .filter(|id| range.contains(position_for_chunk(**id)))
            .copied()
            .collect();
        for id in chunk_ids {
            if let Some(record) = self.chunks.remove(&id) {
                moved.chunks.insert(id, record);
            }
        }

        let names: Vec<_> = self
            .names
            .keys()
            .filter(|name| range.contains(position_for_name(name)))
            .cloned()
            .collect();
        for name in names {
            if let Some(binding) = self.names.remove(&name) {
                moved.names.insert(name, binding);
            }
        }

        let temp_ids: Vec<_> = self
            .temp
            .keys()
            .filter(|id| range.contains(position_for_temp(**id)))
            .copied()
            .collect();
        for id in temp_ids {
            if let Some(entry) = self.temp.remove(&id) {
                moved.temp.insert(id, entry);
            }
        }

        moved
    }

    /// Take over all records of another shard
    pub fn absorb(&mut self, other: MetadataShard) {
        self.chunks.extend(other.chunks);
        self.names.extend(other.names);
        self.temp.extend(other.temp);
    }

    pub fn temp_bytes(&self) -> u64 {
        self.temp.values().map(|e| e.size).sum()
    }
}
