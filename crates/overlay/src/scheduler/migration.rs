//! Chunk migration
//!
//! Moves ownership of a chunk between peers. The chunk's ownership lock is
//! held from validation until the owner flip, so owner lookups on that chunk
//! wait for the migration and then observe the new owner. A migration can be
//! cancelled until it commits; once committed it stays committed.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{info, warn};

use crate::error::{OverlayError, Result};
use crate::metadata::{ChunkId, MetadataDirectory, NodeId};
use crate::node_manager::NodeRegistry;
use crate::transfer::ChunkTransfer;

/// Finished tasks kept for inspection
const FINISHED_TASKS_KEPT: usize = 1024;

/// Migration status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MigrationStatus {
    /// Created, lock acquired, transfer not started
    Pending,
    /// Payload transfer running
    InProgress,
    /// Owner flipped
    Completed,
    /// Transfer failed, ownership unchanged
    Failed,
    /// Cancelled before commit, ownership unchanged
    Cancelled,
}

impl std::fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MigrationStatus::Pending => write!(f, "pending"),
            MigrationStatus::InProgress => write!(f, "in_progress"),
            MigrationStatus::Completed => write!(f, "completed"),
            MigrationStatus::Failed => write!(f, "failed"),
            MigrationStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Migration task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationTask {
    pub id: String,
    pub chunk: ChunkId,
    pub from_node: NodeId,
    pub to_node: NodeId,
    pub status: MigrationStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl MigrationTask {
    fn new(id: String, chunk: ChunkId, from_node: NodeId, to_node: NodeId) -> Self {
        Self {
            id,
            chunk,
            from_node,
            to_node,
            status: MigrationStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
        }
    }

    fn start(&mut self) {
        self.status = MigrationStatus::InProgress;
        self.started_at = Some(Utc::now());
    }

    fn complete(&mut self) {
        self.status = MigrationStatus::Completed;
        self.completed_at = Some(Utc::now());
    }

    fn fail(&mut self, error: String) {
        self.status = MigrationStatus::Failed;
        self.completed_at = Some(Utc::now());
        self.error = Some(error);
    }

    fn cancel(&mut self) {
        self.status = MigrationStatus::Cancelled;
        self.completed_at = Some(Utc::now());
    }

    /// Completed, failed or cancelled
    pub fn is_finished(&self) -> bool {
        matches!(
            self.status,
            MigrationStatus::Completed | MigrationStatus::Failed | MigrationStatus::Cancelled
        )
    }
}

/// Outcome of a cancellation request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CancelOutcome {
    /// Stopped before the owner flip
    Cancelled,
    /// Owner already flipped, the migration stands
    AlreadyCommitted,
    /// Already failed or cancelled
    AlreadyFinished,
}

/// Migration task bookkeeping
pub struct MigrationManager {
    tasks: RwLock<HashMap<String, MigrationTask>>,
    cancel_signals: RwLock<HashMap<String, Arc<Notify>>>,
    next_seq: AtomicU64,
}

impl MigrationManager {
    pub fn new() -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            cancel_signals: RwLock::new(HashMap::new()),
            next_seq: AtomicU64::new(1),
        }
    }

    fn create_task(&self, chunk: ChunkId, from_node: NodeId, to_node: NodeId) -> (MigrationTask, Arc<Notify>) {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let task = MigrationTask::new(format!("migration_{}_{}", chunk, seq), chunk, from_node, to_node);
        let signal = Arc::new(Notify::new());
        self.cancel_signals
            .write()
            .insert(task.id.clone(), signal.clone());
        self.tasks.write().insert(task.id.clone(), task.clone());
        (task, signal)
    }

    pub fn get_task(&self, task_id: &str) -> Option<MigrationTask> {
        self.tasks.read().get(task_id).cloned()
    }

    /// Unfinished task for a chunk
    pub fn get_active_task_for_chunk(&self, chunk: ChunkId) -> Option<MigrationTask> {
        self.tasks
            .read()
            .values()
            .find(|t| t.chunk == chunk && !t.is_finished())
            .cloned()
    }

    pub fn active_tasks(&self) -> Vec<MigrationTask> {
        self.tasks
            .read()
            .values()
            .filter(|t| !t.is_finished())
            .cloned()
            .collect()
    }

    pub fn all_tasks(&self) -> Vec<MigrationTask> {
        let mut tasks: Vec<_> = self.tasks.read().values().cloned().collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        tasks
    }

    fn start_task(&self, task_id: &str) {
        if let Some(task) = self.tasks.write().get_mut(task_id) {
            task.start();
        }
    }

    /// Claim the commit. Fails if the task was cancelled first.
    fn commit_task(&self, task_id: &str) -> bool {
        let mut tasks = self.tasks.write();
        match tasks.get_mut(task_id) {
            Some(task) if !task.is_finished() => {
                task.complete();
                true
            }
            _ => false,
        }
    }

    fn fail_task(&self, task_id: &str, error: String) -> Option<MigrationTask> {
        let mut tasks = self.tasks.write();
        let task = tasks.get_mut(task_id)?;
        task.fail(error);
        Some(task.clone())
    }

    fn finish(&self, task_id: &str) {
        self.cancel_signals.write().remove(task_id);
        self.cleanup(FINISHED_TASKS_KEPT);
    }

    /// Cancel a task that has not committed yet
    pub fn cancel_task(&self, task_id: &str) -> Option<CancelOutcome> {
        let outcome = {
            let mut tasks = self.tasks.write();
            let task = tasks.get_mut(task_id)?;
            match task.status {
                MigrationStatus::Completed => CancelOutcome::AlreadyCommitted,
                MigrationStatus::Failed | MigrationStatus::Cancelled => {
                    CancelOutcome::AlreadyFinished
                }
                MigrationStatus::Pending | MigrationStatus::InProgress => {
                    task.cancel();
                    CancelOutcome::Cancelled
                }
            }
        };
        // The running migration keeps its own handle on the signal, and the
        // stored permit survives removal; an aborted one never calls finish
        if outcome == CancelOutcome::Cancelled {
            if let Some(signal) = self.cancel_signals.write().remove(task_id) {
                signal.notify_one();
            }
        }
        Some(outcome)
    }

    /// Drop finished tasks beyond the most recent `keep_count`
    pub fn cleanup(&self, keep_count: usize) {
        let mut tasks = self.tasks.write();

        let mut finished: Vec<_> = tasks
            .values()
            .filter(|t| t.is_finished())
            .map(|t| (t.completed_at, t.id.clone()))
            .collect();
        if finished.len() <= keep_count {
            return;
        }
        finished.sort_by(|a, b| b.0.cmp(&a.0));

        for (_, id) in finished.into_iter().skip(keep_count) {
            tasks.remove(&id);
        }
    }
}

impl Default for MigrationManager {
    fn default() -> Self {
        Self::new()
    }
}

enum TransferOutcome {
    Done,
    Failed(String),
    Cancelled,
}

/// Sequences the migration handshake and the owner flip
pub struct MigrationCoordinator {
    registry: Arc<NodeRegistry>,
    directory: Arc<MetadataDirectory>,
    transfer: Arc<dyn ChunkTransfer>,
    manager: MigrationManager,
    transfer_timeout: Duration,
}

impl MigrationCoordinator {
    pub fn new(
        registry: Arc<NodeRegistry>,
        directory: Arc<MetadataDirectory>,
        transfer: Arc<dyn ChunkTransfer>,
        transfer_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            directory,
            transfer,
            manager: MigrationManager::new(),
            transfer_timeout,
        }
    }

    pub fn manager(&self) -> &MigrationManager {
        &self.manager
    }

    /// Migrate `chunk` from `source` to `target`
    ///
    /// Errors are returned as-is; retrying is the caller's decision.
    pub async fn migrate(&self, chunk: ChunkId, source: NodeId, target: NodeId) -> Result<MigrationTask> {
        if !self.registry.is_active_peer(target).await {
            return Err(OverlayError::TargetUnavailable(target));
        }

        let guard = self.directory.lock_chunk(chunk).await?;

        let record = self.directory.record_now(chunk)?;
        if record.is_lost() {
            return Err(OverlayError::DataLoss {
                chunks: vec![chunk],
            });
        }
        if record.owner != source {
            return Err(OverlayError::OwnershipMismatch {
                chunk,
                expected: source,
                actual: record.owner,
            });
        }

        let (task, cancel_signal) = self.manager.create_task(chunk, source, target);
        if source == target {
            self.manager.commit_task(&task.id);
            self.manager.finish(&task.id);
            return Ok(self.manager.get_task(&task.id).unwrap_or(task));
        }

        self.manager.start_task(&task.id);
        info!("Migrating chunk {}: {} -> {} ({})", chunk, source, target, task.id);

        let outcome = tokio::select! {
            biased;
            _ = cancel_signal.notified() => TransferOutcome::Cancelled,
            result = tokio::time::timeout(
                self.transfer_timeout,
                self.transfer.transfer(chunk, source, target),
            ) => match result {
                Ok(Ok(())) => TransferOutcome::Done,
                Ok(Err(e)) => TransferOutcome::Failed(e),
                Err(_) => TransferOutcome::Failed(format!(
                    "transfer timed out after {:?}",
                    self.transfer_timeout
                )),
            },
        };

        let result = match outcome {
            TransferOutcome::Done if self.manager.commit_task(&task.id) => {
                match self.directory.update_owner(chunk, target) {
                    Ok(_) => {
                        info!("Committed migration of chunk {}: {} -> {}", chunk, source, target);
                        Ok(self.manager.get_task(&task.id).unwrap_or(task.clone()))
                    }
                    Err(e) => {
                        self.manager.fail_task(&task.id, e.to_string());
                        Err(e)
                    }
                }
            }
            TransferOutcome::Done | TransferOutcome::Cancelled => {
                info!("Migration of chunk {} cancelled before commit", chunk);
                Err(OverlayError::MigrationCancelled(chunk))
            }
            TransferOutcome::Failed(reason) => {
                warn!("Migration of chunk {} failed: {}", chunk, reason);
                self.manager.fail_task(&task.id, reason.clone());
                Err(OverlayError::MigrationFailed { chunk, reason })
            }
        };

        drop(guard);
        self.manager.finish(&task.id);
        result
    }

    /// Cancel an in-flight migration
    pub fn cancel(&self, task_id: &str) -> Result<CancelOutcome> {
        self.manager
            .cancel_task(task_id)
            .ok_or_else(|| OverlayError::NotFound(task_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{ChunkRecord, NodeInfo};
    use crate::node_manager::NodeRegistryConfig;
    use crate::transfer::InMemoryTransfer;

    const A: NodeId = NodeId(0x280);
    const B: NodeId = NodeId(0xC601);

    async fn setup() -> (Arc<MetadataDirectory>, Arc<InMemoryTransfer>, Arc<MigrationCoordinator>, ChunkId) {
        let registry = Arc::new(NodeRegistry::new(NodeRegistryConfig::default()));
        let directory = Arc::new(MetadataDirectory::new());
        registry
            .join(NodeInfo::superpeer(NodeId(0xC0C1), "10.0.0.1:22221"))
            .await
            .unwrap();
        directory.add_superpeer(NodeId(0xC0C1));
        for id in [A, B] {
            registry.join(NodeInfo::peer(id, "10.0.0.2:22222")).await.unwrap();
        }
        let chunk = ChunkId::new(A, 1);
        directory
            .register_chunk(ChunkRecord::new(chunk, A, 64, Vec::new()))
            .unwrap();

        let transfer = Arc::new(InMemoryTransfer::new());
        let coordinator = Arc::new(MigrationCoordinator::new(
            registry,
            directory.clone(),
            transfer.clone(),
            Duration::from_millis(500),
        ));
        (directory, transfer, coordinator, chunk)
    }

    #[tokio::test]
    async fn test_migrate_then_stale_source_mismatch() {
        let (directory, transfer, coordinator, chunk) = setup().await;

        let task = coordinator.migrate(chunk, A, B).await.unwrap();
        assert_eq!(task.status, MigrationStatus::Completed);
        assert_eq!(directory.lookup_owner(chunk).await.unwrap(), B);
        assert_eq!(transfer.completed(), vec![(chunk, A, B)]);

        match coordinator.migrate(chunk, A, B).await {
            Err(OverlayError::OwnershipMismatch { actual, .. }) => assert_eq!(actual, B),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_target_unavailable() {
        let (_, _, coordinator, chunk) = setup().await;
        assert!(matches!(
            coordinator.migrate(chunk, A, NodeId(0x9999)).await,
            Err(OverlayError::TargetUnavailable(_))
        ));
        assert!(matches!(
            coordinator.migrate(chunk, A, NodeId(0xC0C1)).await,
            Err(OverlayError::TargetUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_transfer_keeps_owner() {
        let (directory, transfer, coordinator, chunk) = setup().await;
        transfer.fail_chunk(chunk, 1);

        let err = coordinator.migrate(chunk, A, B).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(directory.lookup_owner(chunk).await.unwrap(), A);

        coordinator.migrate(chunk, A, B).await.unwrap();
        assert_eq!(directory.lookup_owner(chunk).await.unwrap(), B);
    }

    #[tokio::test]
    async fn test_transfer_timeout_fails_migration() {
        let (directory, transfer, coordinator, chunk) = setup().await;
        transfer.set_delay(Some(Duration::from_secs(5)));

        assert!(matches!(
            coordinator.migrate(chunk, A, B).await,
            Err(OverlayError::MigrationFailed { .. })
        ));
        assert_eq!(directory.lookup_owner(chunk).await.unwrap(), A);
    }

    #[tokio::test]
    async fn test_cancel_before_commit() {
        let (directory, transfer, coordinator, chunk) = setup().await;
        transfer.set_delay(Some(Duration::from_millis(200)));

        let running = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.migrate(chunk, A, B).await })
        };

        let task_id = loop {
            if let Some(task) = coordinator.manager().get_active_task_for_chunk(chunk) {
                break task.id;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        assert_eq!(coordinator.cancel(&task_id).unwrap(), CancelOutcome::Cancelled);

        assert!(matches!(
            running.await.unwrap(),
            Err(OverlayError::MigrationCancelled(_))
        ));
        assert_eq!(directory.lookup_owner(chunk).await.unwrap(), A);
        assert_eq!(
            coordinator.manager().get_task(&task_id).unwrap().status,
            MigrationStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn test_cancel_of_aborted_migration_drops_signal() {
        let (_, transfer, coordinator, chunk) = setup().await;
        transfer.set_delay(Some(Duration::from_secs(5)));

        let running = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.migrate(chunk, A, B).await })
        };
        let task_id = loop {
            if let Some(task) = coordinator.manager().get_active_task_for_chunk(chunk) {
                break task.id;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        running.abort();
        assert!(running.await.unwrap_err().is_cancelled());
        assert_eq!(coordinator.manager().cancel_signals.read().len(), 1);

        assert_eq!(coordinator.cancel(&task_id).unwrap(), CancelOutcome::Cancelled);
        assert!(coordinator.manager().cancel_signals.read().is_empty());
        assert!(coordinator.manager().active_tasks().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_after_commit_is_reported() {
        let (_, _, coordinator, chunk) = setup().await;
        let task = coordinator.migrate(chunk, A, B).await.unwrap();
        assert_eq!(
            coordinator.cancel(&task.id).unwrap(),
            CancelOutcome::AlreadyCommitted
        );
        assert!(matches!(
            coordinator.cancel("missing"),
            Err(OverlayError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_readers_see_old_or_new_owner_only() {
        let (directory, transfer, coordinator, chunk) = setup().await;
        transfer.set_delay(Some(Duration::from_millis(50)));

        let migration = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.migrate(chunk, A, B).await })
        };
        let mut readers = Vec::new();
        for _ in 0..8 {
            let directory = directory.clone();
            readers.push(tokio::spawn(async move { directory.lookup_owner(chunk).await }));
        }

        migration.await.unwrap().unwrap();
        for reader in readers {
            let owner = reader.await.unwrap().unwrap();
            assert!(owner == A || owner == B);
        }
        assert_eq!(directory.lookup_owner(chunk).await.unwrap(), B);
    }
}
