//! Node departure handling
//!
//! Graceful shutdown drains a peer by migrating every chunk it owns before
//! removing it. Ungraceful failure marks the node failed at once and
//! recovers its chunks in the background from surviving backups.
//!
//! Node state machine:
//! `active -> leaving -> removed` or `active -> failed -> removed`.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedRwLockWriteGuard, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use super::{MigrationCoordinator, PlacementEngine};
use crate::error::{OverlayError, Result};
use crate::metadata::{ChunkId, MetadataDirectory, NodeId, NodeRole};
use crate::node_manager::NodeRegistry;
use crate::transfer::ChunkTransfer;

/// Departure handler configuration
#[derive(Debug, Clone)]
pub struct DepartureConfig {
    /// Upper bound on a graceful shutdown
    pub shutdown_timeout: Duration,
    /// Retries per chunk after the first attempt
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Concurrent migrations during a drain
    pub max_parallel: usize,
    /// Bound on one backup promotion attempt
    pub promote_timeout: Duration,
}

impl Default for DepartureConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout: Duration::from_secs(10),
            max_retries: 3,
            backoff_base: Duration::from_millis(50),
            backoff_max: Duration::from_secs(1),
            max_parallel: 8,
            promote_timeout: Duration::from_secs(5),
        }
    }
}

impl DepartureConfig {
    /// Exponential backoff before retry `attempt` (0-based), capped
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.backoff_base
            .checked_mul(factor)
            .unwrap_or(self.backoff_max)
            .min(self.backoff_max)
    }
}

/// What happened to each chunk of a failed node
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecoveryReport {
    pub node: Option<NodeId>,
    /// Chunks whose backup became the owner, with the new owner
    pub promoted: Vec<(ChunkId, NodeId)>,
    /// Chunks with no surviving backup
    pub lost: Vec<ChunkId>,
}

/// Background recovery of a failed node
pub struct RecoveryHandle {
    node: NodeId,
    handle: JoinHandle<RecoveryReport>,
}

impl RecoveryHandle {
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Wait for recovery. Lost chunks surface as [`OverlayError::DataLoss`].
    pub async fn wait(self) -> Result<RecoveryReport> {
        let report = self.handle.await.map_err(|e| OverlayError::InvalidTransition {
            node: self.node,
            reason: format!("recovery task aborted: {}", e),
        })?;
        if report.lost.is_empty() {
            Ok(report)
        } else {
            Err(OverlayError::DataLoss {
                chunks: report.lost,
            })
        }
    }
}

/// Result of a departure
pub enum DepartureOutcome {
    /// Drained and removed; lists the chunks moved with their new owners
    Removed { migrated: Vec<(ChunkId, NodeId)> },
    /// Marked failed; recovery is running
    Recovering(RecoveryHandle),
}

/// Graceful shutdown and failure recovery
pub struct DepartureHandler {
    registry: Arc<NodeRegistry>,
    directory: Arc<MetadataDirectory>,
    placement: Arc<PlacementEngine>,
    coordinator: Arc<MigrationCoordinator>,
    transfer: Arc<dyn ChunkTransfer>,
    config: DepartureConfig,
}

impl DepartureHandler {
    pub fn new(
        registry: Arc<NodeRegistry>,
        directory: Arc<MetadataDirectory>,
        placement: Arc<PlacementEngine>,
        coordinator: Arc<MigrationCoordinator>,
        transfer: Arc<dyn ChunkTransfer>,
        config: DepartureConfig,
    ) -> Self {
        Self {
            registry,
            directory,
            placement,
            coordinator,
            transfer,
            config,
        }
    }

    /// Handle a node leaving the overlay
    pub async fn on_node_departure(self: &Arc<Self>, node: NodeId, graceful: bool) -> Result<DepartureOutcome> {
        let info = self.registry.get(node).await?;
        match (info.role, graceful) {
            (NodeRole::Superpeer, true) => self.shutdown_superpeer(node).await,
            (NodeRole::Peer, true) => self.shutdown_peer(node).await,
            (_, false) => self.fail_node(node, info.role).await,
        }
    }

    async fn shutdown_superpeer(&self, node: NodeId) -> Result<DepartureOutcome> {
        if self.directory.superpeers().len() <= 1 {
            return Err(OverlayError::NoSuperpeer);
        }
        self.registry.leave(node, true).await?;
        self.directory.remove_superpeer(node)?;
        self.registry.remove(node).await?;
        info!("Superpeer {} shut down", node);
        Ok(DepartureOutcome::Removed {
            migrated: Vec::new(),
        })
    }

    async fn shutdown_peer(self: &Arc<Self>, node: NodeId) -> Result<DepartureOutcome> {
        self.registry.leave(node, true).await?;
        let chunks = self.directory.chunks_owned_by(node);
        info!("Draining {} chunk(s) from {}", chunks.len(), node);

        let semaphore = Arc::new(Semaphore::new(self.config.max_parallel.max(1)));
        let mut migrations = JoinSet::new();
        for record in chunks {
            let handler = self.clone();
            let semaphore = semaphore.clone();
            migrations.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let result = handler.migrate_with_retry(record.id, node, record.size).await;
                (record.id, result)
            });
        }

        let mut migrated = Vec::new();
        let drained = tokio::time::timeout(self.config.shutdown_timeout, async {
            while let Some(joined) = migrations.join_next().await {
                match joined {
                    Ok((chunk, Ok(target))) => migrated.push((chunk, target)),
                    Ok((chunk, Err(e))) => warn!("Giving up on chunk {} of {}: {}", chunk, node, e),
                    Err(e) => warn!("Migration task of {} panicked: {}", node, e),
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!("Shutdown of {} timed out after {:?}", node, self.config.shutdown_timeout);
        }
        // Aborts stragglers; an abort can only land before an owner flip
        migrations.shutdown().await;

        let remaining: Vec<_> = self
            .directory
            .chunks_owned_by(node)
            .into_iter()
            .map(|r| r.id)
            .collect();
        if !remaining.is_empty() {
            for chunk in &remaining {
                if let Some(task) = self.coordinator.manager().get_active_task_for_chunk(*chunk) {
                    let _ = self.coordinator.cancel(&task.id);
                }
            }
            warn!(
                "Shutdown of {} incomplete: {} chunk(s) still owned",
                node,
                remaining.len()
            );
            return Err(OverlayError::ShutdownIncomplete { chunks: remaining });
        }

        self.directory.remove_backup_everywhere(node);
        self.registry.remove(node).await?;
        info!("Peer {} shut down, {} chunk(s) migrated", node, migrated.len());
        Ok(DepartureOutcome::Removed { migrated })
    }

    /// Migrate one chunk off `source`, retrying transient failures
    async fn migrate_with_retry(&self, chunk: ChunkId, source: NodeId, size: u64) -> Result<NodeId> {
        let mut attempt = 0;
        loop {
            let outcome = match self.placement.place_excluding(size, &[source]).await {
                Ok(target) => self
                    .coordinator
                    .migrate(chunk, source, target)
                    .await
                    .map(|_| target),
                Err(e) => Err(e),
            };

            match outcome {
                Ok(target) => return Ok(target),
                // Someone else already moved it
                Err(OverlayError::OwnershipMismatch { actual, .. }) => return Ok(actual),
                Err(e) if attempt < self.config.max_retries && is_transient(&e) => {
                    let delay = self.config.backoff(attempt);
                    debug!(
                        "Retrying chunk {} in {:?} (attempt {}): {}",
                        chunk,
                        delay,
                        attempt + 1,
                        e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn fail_node(self: &Arc<Self>, node: NodeId, role: NodeRole) -> Result<DepartureOutcome> {
        self.registry.leave(node, false).await?;
        warn!("Node {} failed", node);

        // Block owner lookups on the failed node's chunks until each is recovered
        let mut ids: Vec<_> = self
            .directory
            .chunks_owned_by(node)
            .into_iter()
            .map(|r| r.id)
            .collect();
        ids.sort();
        let mut guards = Vec::with_capacity(ids.len());
        for id in ids {
            match self.directory.lock_chunk(id).await {
                Ok(guard) => guards.push((id, guard)),
                Err(e) => debug!("Chunk {} gone before recovery: {}", id, e),
            }
        }

        let handler = self.clone();
        let handle = tokio::spawn(async move {
            let report = match role {
                NodeRole::Superpeer => handler.recover_superpeer(node),
                NodeRole::Peer => handler.recover_peer(node, guards).await,
            };
            if let Err(e) = handler.registry.remove(node).await {
                warn!("Failed to remove {} after recovery: {}", node, e);
            }
            report
        });

        Ok(DepartureOutcome::Recovering(RecoveryHandle { node, handle }))
    }

    fn recover_superpeer(&self, node: NodeId) -> RecoveryReport {
        if let Err(e) = self.directory.remove_superpeer(node) {
            error!("Metadata of failed superpeer {} cannot be handed over: {}", node, e);
        }
        RecoveryReport {
            node: Some(node),
            ..Default::default()
        }
    }

    async fn recover_peer(
        &self,
        node: NodeId,
        guards: Vec<(ChunkId, OwnedRwLockWriteGuard<()>)>,
    ) -> RecoveryReport {
        self.directory.remove_backup_everywhere(node);

        let mut report = RecoveryReport {
            node: Some(node),
            ..Default::default()
        };
        for (chunk, guard) in guards {
            let record = match self.directory.record_now(chunk) {
                Ok(record) if record.owner == node => record,
                _ => continue,
            };

            let mut promoted = None;
            for backup in record.backups {
                if !self.registry.is_active_peer(backup).await {
                    continue;
                }
                if self.promote_with_retry(chunk, backup).await {
                    promoted = Some(backup);
                    break;
                }
            }

            match promoted {
                Some(backup) => match self.directory.update_owner(chunk, backup) {
                    Ok(_) => {
                        info!("Chunk {} recovered on backup {}", chunk, backup);
                        report.promoted.push((chunk, backup));
                    }
                    Err(e) => warn!("Promotion of {} not recorded: {}", chunk, e),
                },
                None => {
                    error!("Chunk {} lost: owner {} failed with no surviving backup", chunk, node);
                    if self.directory.mark_lost(chunk).is_ok() {
                        report.lost.push(chunk);
                    }
                }
            }
            drop(guard);
        }

        if !report.lost.is_empty() {
            error!(
                "Data loss after failure of {}: {} chunk(s) unrecoverable",
                node,
                report.lost.len()
            );
        }
        report
    }

    /// Each attempt runs under `promote_timeout`; the chunk lock is held throughout
    async fn promote_with_retry(&self, chunk: ChunkId, backup: NodeId) -> bool {
        for attempt in 0..=self.config.max_retries {
            let promotion = self.transfer.promote_backup(chunk, backup);
            match tokio::time::timeout(self.config.promote_timeout, promotion).await {
                Ok(Ok(())) => return true,
                Ok(Err(e)) => debug!("Promotion of {} on {} failed: {}", chunk, backup, e),
                Err(_) => warn!(
                    "Promotion of {} on {} timed out after {:?}",
                    chunk, backup, self.config.promote_timeout
                ),
            }
            if attempt < self.config.max_retries {
                tokio::time::sleep(self.config.backoff(attempt)).await;
            }
        }
        false
    }
}

fn is_transient(error: &OverlayError) -> bool {
    error.is_retryable()
        || matches!(
            error,
            OverlayError::TargetUnavailable(_) | OverlayError::NoCapacity { .. }
        )
}
