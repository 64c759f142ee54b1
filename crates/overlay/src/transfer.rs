//! Chunk payload transfer
//!
//! The overlay only sequences ownership; moving bytes between peers is the
//! storage engine's job. [`ChunkTransfer`] is the seam to it.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tracing::debug;

use crate::metadata::{ChunkId, NodeId};

/// Storage-side operations the overlay drives
#[async_trait]
pub trait ChunkTransfer: Send + Sync {
    /// Copy a chunk payload from `from` to `to`
    async fn transfer(&self, chunk: ChunkId, from: NodeId, to: NodeId) -> Result<(), String>;

    /// Turn the backup copy held by `backup` into the primary copy
    async fn promote_backup(&self, chunk: ChunkId, backup: NodeId) -> Result<(), String>;
}

/// In-process transfer used when no storage engine is attached
///
/// Records every completed move and can be told to fail or stall, which the
/// tests use to drive the failure paths.
#[derive(Default)]
pub struct InMemoryTransfer {
    delay: Mutex<Option<Duration>>,
    /// Remaining forced failures per chunk
    failures: Mutex<HashMap<ChunkId, u32>>,
    unreachable: Mutex<HashSet<NodeId>>,
    /// Promotions never complete while set
    stall_promotions: Mutex<bool>,
    log: Mutex<Vec<(ChunkId, NodeId, NodeId)>>,
}

impl InMemoryTransfer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every transfer sleeps this long before completing
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock() = delay;
    }

    /// Fail the next `times` transfers of `chunk`
    pub fn fail_chunk(&self, chunk: ChunkId, times: u32) {
        self.failures.lock().insert(chunk, times);
    }

    /// Transfers and promotions involving `node` fail
    pub fn set_unreachable(&self, node: NodeId, unreachable: bool) {
        let mut nodes = self.unreachable.lock();
        if unreachable {
            nodes.insert(node);
        } else {
            nodes.remove(&node);
        }
    }

    /// Promotions hang until cleared, as with a backup that stopped answering
    pub fn set_stall_promotions(&self, stall: bool) {
        *self.stall_promotions.lock() = stall;
    }

    /// Completed transfers as (chunk, from, to)
    pub fn completed(&self) -> Vec<(ChunkId, NodeId, NodeId)> {
        self.log.lock().clone()
    }

    fn take_failure(&self, chunk: ChunkId) -> bool {
        let mut failures = self.failures.lock();
        match failures.get_mut(&chunk) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl ChunkTransfer for InMemoryTransfer {
    async fn transfer(&self, chunk: ChunkId, from: NodeId, to: NodeId) -> Result<(), String> {
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        {
            let unreachable = self.unreachable.lock();
            for node in [from, to] {
                if unreachable.contains(&node) {
                    return Err(format!("node {} unreachable", node));
                }
            }
        }
        if self.take_failure(chunk) {
            return Err(format!("injected failure for {}", chunk));
        }
        debug!("Transferred chunk {}: {} -> {}", chunk, from, to);
        self.log.lock().push((chunk, from, to));
        Ok(())
    }

    async fn promote_backup(&self, chunk: ChunkId, backup: NodeId) -> Result<(), String> {
        if self.unreachable.lock().contains(&backup) {
            return Err(format!("backup {} unreachable", backup));
        }
        let stalled = *self.stall_promotions.lock();
        if stalled {
            debug!("Promotion of chunk {} on {} stalled", chunk, backup);
            std::future::pending::<()>().await;
        }
        debug!("Promoted backup of chunk {} on {}", chunk, backup);
        Ok(())
    }
}
