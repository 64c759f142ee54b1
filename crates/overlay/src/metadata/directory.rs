//! Metadata directory
//!
//! Chunk ownership records, name bindings and temporary entries, sharded
//! over the superpeer ring. Each record lives in exactly one shard: the one
//! held by the superpeer whose range contains the record's ring position.
//!
//! Structural state (ring + shards) sits behind one short-held lock that is
//! never held across an await. Ownership changes are serialized per chunk by
//! an async read/write lock: migration takes the write half for the whole
//! transfer, so owner lookups on that chunk wait for the flip while lookups
//! on other chunks proceed.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::OwnedRwLockWriteGuard;
use tracing::{debug, error, info};

use super::ring::{position_for_chunk, position_for_name, position_for_temp, Route};
use super::shard::{MetadataShard, TempEntry};
use super::{ChunkId, ChunkRecord, ChunkState, NameBinding, NodeId, ShardRange, SuperpeerRing};
use crate::error::{OverlayError, Result};

type ChunkLock = Arc<tokio::sync::RwLock<()>>;

#[derive(Debug, Default)]
struct DirectoryState {
    ring: SuperpeerRing,
    shards: HashMap<NodeId, MetadataShard>,
}

impl DirectoryState {
    fn shard_mut(&mut self, superpeer: NodeId) -> &mut MetadataShard {
        self.shards
            .entry(superpeer)
            .or_insert_with(|| MetadataShard::new(superpeer))
    }

    fn find_chunk(&self, id: ChunkId) -> Option<&ChunkRecord> {
        let authority = self.ring.authority(position_for_chunk(id))?;
        self.shards.get(&authority)?.chunks.get(&id)
    }

    fn find_chunk_mut(&mut self, id: ChunkId) -> Option<&mut ChunkRecord> {
        let authority = self.ring.authority(position_for_chunk(id))?;
        self.shards.get_mut(&authority)?.chunks.get_mut(&id)
    }

    fn records(&self) -> impl Iterator<Item = &ChunkRecord> {
        self.shards.values().flat_map(|s| s.chunks.values())
    }

    fn records_mut(&mut self) -> impl Iterator<Item = &mut ChunkRecord> {
        self.shards.values_mut().flat_map(|s| s.chunks.values_mut())
    }
}

/// Which shards a summary covers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SummaryScope {
    All,
    Superpeer(NodeId),
}

impl std::str::FromStr for SummaryScope {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("all") {
            return Ok(SummaryScope::All);
        }
        s.parse::<NodeId>()
            .map(SummaryScope::Superpeer)
            .map_err(|e| format!("invalid scope '{}': {}", s, e))
    }
}

/// Aggregate counts for one shard
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardSummary {
    pub superpeer: NodeId,
    pub range: ShardRange,
    pub chunk_count: usize,
    pub lost_chunk_count: usize,
    pub name_count: usize,
    pub temp_count: usize,
    pub temp_bytes: u64,
}

/// Status of the superpeer temporary storage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TempStatus {
    pub total_bytes: u64,
    pub superpeers: Vec<TempShardStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TempShardStatus {
    pub superpeer: NodeId,
    pub entries: Vec<TempEntry>,
}

/// Flat, shard-independent form used for persistence
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DirectorySnapshot {
    pub superpeers: Vec<NodeId>,
    pub chunks: Vec<ChunkRecord>,
    pub names: Vec<NameBinding>,
    pub temp: Vec<TempEntry>,
}

/// Metadata directory
pub struct MetadataDirectory {
    state: RwLock<DirectoryState>,
    chunk_locks: Mutex<HashMap<ChunkId, ChunkLock>>,
    /// Rotates the superpeer a request enters the ring at
    entry_cursor: AtomicUsize,
}

impl MetadataDirectory {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(DirectoryState::default()),
            chunk_locks: Mutex::new(HashMap::new()),
            entry_cursor: AtomicUsize::new(0),
        }
    }

    // ==================== Ring membership ====================

    /// Add a superpeer and hand it the records of its new range
    pub fn add_superpeer(&self, superpeer: NodeId) {
        let mut state = self.state.write();
        if state.ring.contains(superpeer) {
            return;
        }
        state.ring.add(superpeer);

        let mut shard = MetadataShard::new(superpeer);
        if let (Some(range), Some(successor)) = (
            state.ring.range_of(superpeer),
            state.ring.successor(superpeer),
        ) {
            if successor != superpeer {
                if let Some(previous) = state.shards.get_mut(&successor) {
                    shard = previous.split_off(&range);
                }
            }
        }
        info!(
            "Superpeer {} joined ring: {} chunks, {} names handed over",
            superpeer,
            shard.chunks.len(),
            shard.names.len()
        );
        state.shards.insert(superpeer, shard);
    }

    /// Remove a superpeer, its successor takes over its range and records
    pub fn remove_superpeer(&self, superpeer: NodeId) -> Result<()> {
        let mut state = self.state.write();
        if !state.ring.contains(superpeer) {
            return Err(OverlayError::UnknownNode(superpeer));
        }
        if state.ring.len() == 1 {
            return Err(OverlayError::NoSuperpeer);
        }
        let successor = state
            .ring
            .successor(superpeer)
            .ok_or(OverlayError::NoSuperpeer)?;
        state.ring.remove(superpeer);

        if let Some(shard) = state.shards.remove(&superpeer) {
            info!(
                "Superpeer {} left ring: {} chunks, {} names handed to {}",
                superpeer,
                shard.chunks.len(),
                shard.names.len(),
                successor
            );
            state.shard_mut(successor).absorb(shard);
        }
        Ok(())
    }

    pub fn superpeers(&self) -> Vec<NodeId> {
        self.state.read().ring.superpeers()
    }

    /// Route a position through the ring, entering at a rotating superpeer
    pub fn route(&self, pos: u32) -> Result<Route> {
        let state = self.state.read();
        Self::route_in(&state, pos, &self.entry_cursor)
    }

    fn route_in(state: &DirectoryState, pos: u32, cursor: &AtomicUsize) -> Result<Route> {
        let superpeers = state.ring.superpeers();
        if superpeers.is_empty() {
            return Err(OverlayError::NoSuperpeer);
        }
        let entry = superpeers[cursor.fetch_add(1, Ordering::Relaxed) % superpeers.len()];
        let route = state.ring.route(entry, pos)?;
        debug!(
            "Routed 0x{:08X} via {} to {} in {} hop(s)",
            pos, entry, route.authority, route.hops
        );
        Ok(route)
    }

    // ==================== Chunk records ====================

    /// Record a freshly created chunk
    pub fn register_chunk(&self, record: ChunkRecord) -> Result<()> {
        let mut state = self.state.write();
        let route = Self::route_in(&state, position_for_chunk(record.id), &self.entry_cursor)?;
        let shard = state.shard_mut(route.authority);
        if shard.chunks.contains_key(&record.id) {
            return Err(OverlayError::Conflict(record.id.to_string()));
        }
        shard.chunks.insert(record.id, record);
        Ok(())
    }

    /// Drop a chunk record and every name pointing at it
    pub async fn remove_chunk(&self, id: ChunkId) -> Result<ChunkRecord> {
        let lock = self.chunk_lock(id)?;
        let _guard = lock.write().await;

        let record = {
            let mut state = self.state.write();
            let route = Self::route_in(&state, position_for_chunk(id), &self.entry_cursor)?;
            let record = state
                .shard_mut(route.authority)
                .chunks
                .remove(&id)
                .ok_or(OverlayError::UnknownChunk(id))?;
            for shard in state.shards.values_mut() {
                shard.names.retain(|_, binding| binding.chunk != id);
            }
            record
        };
        self.chunk_locks.lock().remove(&id);
        info!("Removed chunk {}", id);
        Ok(record)
    }

    /// Current owner of a chunk
    ///
    /// Waits while a migration of this chunk is in flight.
    pub async fn lookup_owner(&self, id: ChunkId) -> Result<NodeId> {
        let record = self.record(id).await?;
        if record.is_lost() {
            error!("Lookup of lost chunk {}", id);
            return Err(OverlayError::DataLoss { chunks: vec![id] });
        }
        Ok(record.owner)
    }

    /// Full record of a chunk, waiting for any in-flight migration
    pub async fn record(&self, id: ChunkId) -> Result<ChunkRecord> {
        let lock = self.chunk_lock(id)?;
        let _guard = lock.read().await;
        self.record_now(id)
    }

    /// Full record without waiting on the chunk lock
    pub(crate) fn record_now(&self, id: ChunkId) -> Result<ChunkRecord> {
        let state = self.state.read();
        let route = Self::route_in(&state, position_for_chunk(id), &self.entry_cursor)?;
        state
            .shards
            .get(&route.authority)
            .and_then(|s| s.chunks.get(&id))
            .cloned()
            .ok_or(OverlayError::UnknownChunk(id))
    }

    /// Take the exclusive ownership lock of a chunk
    pub(crate) async fn lock_chunk(&self, id: ChunkId) -> Result<OwnedRwLockWriteGuard<()>> {
        Ok(self.chunk_lock(id)?.write_owned().await)
    }

    /// Lock of a recorded chunk. IDs with no record get no entry, so lookups
    /// of unknown chunks leave the lock table untouched.
    fn chunk_lock(&self, id: ChunkId) -> Result<ChunkLock> {
        if let Some(lock) = self.chunk_locks.lock().get(&id) {
            return Ok(lock.clone());
        }
        self.record_now(id)?;
        Ok(self
            .chunk_locks
            .lock()
            .entry(id)
            .or_insert_with(|| Arc::new(tokio::sync::RwLock::new(())))
            .clone())
    }

    /// Highest local counter minted by `creator` among recorded chunks, 0 if none
    pub fn highest_local_id(&self, creator: NodeId) -> u64 {
        self.state
            .read()
            .records()
            .filter(|r| r.id.creator() == creator)
            .map(|r| r.id.local_id())
            .max()
            .unwrap_or(0)
    }

    /// Flip the owner of a chunk
    ///
    /// Callers hold the chunk's lock from [`lock_chunk`](Self::lock_chunk).
    /// The new owner stops being listed as a backup.
    pub(crate) fn update_owner(&self, id: ChunkId, new_owner: NodeId) -> Result<NodeId> {
        let mut state = self.state.write();
        let record = state
            .find_chunk_mut(id)
            .ok_or(OverlayError::UnknownChunk(id))?;
        let previous = record.owner;
        record.owner = new_owner;
        record.state = ChunkState::Available;
        record.backups.retain(|b| *b != new_owner);
        Ok(previous)
    }

    /// Mark a chunk unrecoverable. Callers hold the chunk's lock.
    pub(crate) fn mark_lost(&self, id: ChunkId) -> Result<()> {
        let mut state = self.state.write();
        let record = state
            .find_chunk_mut(id)
            .ok_or(OverlayError::UnknownChunk(id))?;
        record.state = ChunkState::Lost;
        record.backups.clear();
        Ok(())
    }

    /// Drop a departed node from every backup list
    pub(crate) fn remove_backup_everywhere(&self, node: NodeId) -> usize {
        let mut state = self.state.write();
        let mut touched = 0;
        for record in state.records_mut() {
            let before = record.backups.len();
            record.backups.retain(|b| *b != node);
            if record.backups.len() != before {
                touched += 1;
            }
        }
        touched
    }

    /// Available chunks currently owned by a node, sorted by ID
    pub fn chunks_owned_by(&self, node: NodeId) -> Vec<ChunkRecord> {
        let state = self.state.read();
        let mut records: Vec<_> = state
            .records()
            .filter(|r| r.owner == node && !r.is_lost())
            .cloned()
            .collect();
        records.sort_by_key(|r| r.id);
        records
    }

    /// Bytes of available chunks per owner
    pub fn usage_by_owner(&self) -> HashMap<NodeId, u64> {
        let state = self.state.read();
        let mut usage = HashMap::new();
        for record in state.records().filter(|r| !r.is_lost()) {
            *usage.entry(record.owner).or_insert(0) += record.size;
        }
        usage
    }

    pub fn chunk_count(&self) -> usize {
        self.state.read().records().count()
    }

    // ==================== Name service ====================

    /// Bind a name to an existing chunk
    pub fn put(&self, binding: NameBinding) -> Result<()> {
        let mut state = self.state.write();
        if state.find_chunk(binding.chunk).is_none() {
            return Err(OverlayError::UnknownChunk(binding.chunk));
        }

        let route = Self::route_in(&state, position_for_name(&binding.name), &self.entry_cursor)?;
        let shard = state.shard_mut(route.authority);
        if shard.names.contains_key(&binding.name) {
            return Err(OverlayError::Conflict(binding.name));
        }
        debug!("Bound name '{}' to chunk {}", binding.name, binding.chunk);
        shard.names.insert(binding.name.clone(), binding);
        Ok(())
    }

    /// Chunk bound to a name
    pub fn resolve(&self, name: &str) -> Result<ChunkId> {
        let state = self.state.read();
        let route = Self::route_in(&state, position_for_name(name), &self.entry_cursor)?;
        state
            .shards
            .get(&route.authority)
            .and_then(|s| s.names.get(name))
            .map(|b| b.chunk)
            .ok_or_else(|| OverlayError::NotFound(name.to_string()))
    }

    /// Resolve a name all the way to the current owner of its chunk
    pub async fn resolve_owner(&self, name: &str) -> Result<NodeId> {
        let chunk = self.resolve(name)?;
        self.lookup_owner(chunk).await
    }

    /// All bindings sorted by name
    pub fn names(&self) -> Vec<NameBinding> {
        let state = self.state.read();
        let mut names: Vec<_> = state
            .shards
            .values()
            .flat_map(|s| s.names.values().cloned())
            .collect();
        names.sort_by(|a, b| a.name.cmp(&b.name));
        names
    }

    // ==================== Temporary storage ====================

    /// Store a temporary entry on the superpeer authoritative for its ID
    pub fn temp_create(&self, id: u32, size: u64) -> Result<NodeId> {
        let mut state = self.state.write();
        let route = Self::route_in(&state, position_for_temp(id), &self.entry_cursor)?;
        let shard = state.shard_mut(route.authority);
        if shard.temp.contains_key(&id) {
            return Err(OverlayError::Conflict(format!("tmp:{}", id)));
        }
        shard.temp.insert(
            id,
            TempEntry {
                id,
                size,
                created_at: chrono::Utc::now(),
            },
        );
        Ok(route.authority)
    }

    pub fn temp_status(&self) -> TempStatus {
        let state = self.state.read();
        let mut superpeers: Vec<_> = state
            .shards
            .values()
            .map(|s| TempShardStatus {
                superpeer: s.superpeer,
                entries: s.temp.values().cloned().collect(),
            })
            .collect();
        superpeers.sort_by_key(|s| s.superpeer);
        TempStatus {
            total_bytes: state.shards.values().map(|s| s.temp_bytes()).sum(),
            superpeers,
        }
    }

    // ==================== Summaries and persistence ====================

    /// Per-shard counts, in ring order
    pub fn summary(&self, scope: SummaryScope) -> Result<Vec<ShardSummary>> {
        let state = self.state.read();
        if let SummaryScope::Superpeer(node) = scope {
            if !state.ring.contains(node) {
                return Err(OverlayError::UnknownNode(node));
            }
        }

        let summaries = state
            .ring
            .ranges()
            .into_iter()
            .filter(|range| match scope {
                SummaryScope::All => true,
                SummaryScope::Superpeer(node) => range.superpeer == node,
            })
            .map(|range| {
                let shard = state.shards.get(&range.superpeer);
                ShardSummary {
                    superpeer: range.superpeer,
                    range,
                    chunk_count: shard.map_or(0, |s| s.chunks.len()),
                    lost_chunk_count: shard
                        .map_or(0, |s| s.chunks.values().filter(|r| r.is_lost()).count()),
                    name_count: shard.map_or(0, |s| s.names.len()),
                    temp_count: shard.map_or(0, |s| s.temp.len()),
                    temp_bytes: shard.map_or(0, |s| s.temp_bytes()),
                }
            })
            .collect();
        Ok(summaries)
    }

    pub fn snapshot(&self) -> DirectorySnapshot {
        let state = self.state.read();
        let mut snapshot = DirectorySnapshot {
            superpeers: state.ring.superpeers(),
            ..Default::default()
        };
        for shard in state.shards.values() {
            snapshot.chunks.extend(shard.chunks.values().cloned());
            snapshot.names.extend(shard.names.values().cloned());
            snapshot.temp.extend(shard.temp.values().cloned());
        }
        snapshot
    }

    /// Rebuild from a snapshot, re-sharding every record over the ring
    pub fn restore(snapshot: DirectorySnapshot) -> Self {
        let directory = Self::new();
        {
            let mut state = directory.state.write();
            for superpeer in &snapshot.superpeers {
                state.ring.add(*superpeer);
                state.shard_mut(*superpeer);
            }
            for record in snapshot.chunks {
                if let Some(sp) = state.ring.authority(position_for_chunk(record.id)) {
                    state.shard_mut(sp).chunks.insert(record.id, record);
                }
            }
            for binding in snapshot.names {
                if let Some(sp) = state.ring.authority(position_for_name(&binding.name)) {
                    state.shard_mut(sp).names.insert(binding.name.clone(), binding);
                }
            }
            for entry in snapshot.temp {
                if let Some(sp) = state.ring.authority(position_for_temp(entry.id)) {
                    state.shard_mut(sp).temp.insert(entry.id, entry);
                }
            }
        }
        directory
    }
}

impl Default for MetadataDirectory {
    fn default() -> Self {
        Self::new()
    }
}
