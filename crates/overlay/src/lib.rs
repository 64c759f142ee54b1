//! Overlay - superpeer metadata service
//!
//! Keeps track of which peer owns which chunk, resolves names to chunks,
//! and moves chunks between peers when nodes come and go.
//!
//! # Features
//! - Node registration, heartbeats and failure detection
//! - Chunk placement with optional backup peers
//! - Metadata sharded over a consistent-hashing ring of superpeers
//! - Chunk migration with a per-chunk ownership lock
//! - Graceful shutdown and failure recovery
//!
//! # Usage Example
//! ```ignore
//! use overlay::{Overlay, config::OverlayConfig, transfer::InMemoryTransfer};
//!
//! let overlay = Overlay::new(OverlayConfig::default(), Arc::new(InMemoryTransfer::new())).await?;
//! let chunks = overlay.chunk_create(5, None, Some(peer)).await?;
//! ```

pub mod api;
pub mod config;
pub mod error;
pub mod metadata;
pub mod node_manager;
pub mod scheduler;
pub mod storage;
pub mod transfer;

pub use error::{OverlayError, Result};

use std::fmt::Write as _;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use config::OverlayConfig;
use metadata::{
    ChunkId, ChunkRecord, MetadataDirectory, NameBinding, NodeId, NodeInfo, NodeRole,
    ShardSummary, SummaryScope, TempStatus,
};
use node_manager::{NodeListing, NodeRegistry, RegisterResult};
use scheduler::{
    CancelOutcome, DepartureHandler, DepartureOutcome, MigrationCoordinator, MigrationTask,
    PlacementEngine, PlacementStrategy,
};
use storage::{OverlaySnapshot, SnapshotStore, StorageError};
use transfer::ChunkTransfer;

/// The overlay service
///
/// Owns the registry and the directory and wires the schedulers on top of
/// them. Everything goes through this handle; there is no global state.
pub struct Overlay {
    config: OverlayConfig,
    storage: SnapshotStore,
    registry: Arc<NodeRegistry>,
    directory: Arc<MetadataDirectory>,
    placement: Arc<PlacementEngine>,
    coordinator: Arc<MigrationCoordinator>,
    departure: Arc<DepartureHandler>,
}

impl Overlay {
    /// Create the overlay, restoring the last snapshot in `data_dir` if any
    pub async fn new(
        config: OverlayConfig,
        transfer: Arc<dyn ChunkTransfer>,
    ) -> std::result::Result<Self, StorageError> {
        let storage = SnapshotStore::new(&config.cluster.data_dir);
        let registry_config = config.registry.to_registry_config();

        let (registry, directory) = match storage.load().await? {
            Some(snapshot) => (
                NodeRegistry::restore(registry_config, snapshot.nodes),
                MetadataDirectory::restore(snapshot.directory),
            ),
            None => (NodeRegistry::new(registry_config), MetadataDirectory::new()),
        };
        let registry = Arc::new(registry);
        let directory = Arc::new(directory);

        let placement = Arc::new(PlacementEngine::new(
            registry.clone(),
            directory.clone(),
            PlacementStrategy {
                load_balance: config.placement.load_balance,
            },
            config.placement.backup_count,
        ));
        let coordinator = Arc::new(MigrationCoordinator::new(
            registry.clone(),
            directory.clone(),
            transfer.clone(),
            config.migration.transfer_timeout(),
        ));
        let departure = Arc::new(DepartureHandler::new(
            registry.clone(),
            directory.clone(),
            placement.clone(),
            coordinator.clone(),
            transfer,
            config
                .departure
                .to_departure_config(config.migration.transfer_timeout()),
        ));

        info!(
            "Overlay initialized: cluster={}, data_dir={:?}, superpeers={}, chunks={}",
            config.cluster.name,
            config.cluster.data_dir,
            directory.superpeers().len(),
            directory.chunk_count()
        );

        Ok(Self {
            config,
            storage,
            registry,
            directory,
            placement,
            coordinator,
            departure,
        })
    }

    pub fn config(&self) -> &OverlayConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn directory(&self) -> &Arc<MetadataDirectory> {
        &self.directory
    }

    pub fn coordinator(&self) -> &Arc<MigrationCoordinator> {
        &self.coordinator
    }

    // ==================== Membership ====================

    /// Register a node; superpeers also take over a range of the ring
    ///
    /// A node rejoining under an old identity resumes its chunk counter past
    /// every chunk it created before, wherever those chunks live now.
    pub async fn join(&self, mut node: NodeInfo) -> Result<RegisterResult> {
        let (id, role) = (node.id, node.role);
        node.next_local_id = node
            .next_local_id
            .max(self.directory.highest_local_id(id) + 1);
        let result = self.registry.join(node).await?;
        if role == NodeRole::Superpeer {
            self.directory.add_superpeer(id);
        }
        Ok(result)
    }

    /// Return a leaving node to service after an incomplete shutdown
    pub async fn node_reactivate(&self, node: NodeId) -> Result<()> {
        self.registry.reactivate(node).await
    }

    pub async fn heartbeat(&self, node: NodeId) -> Result<()> {
        self.registry.heartbeat(node).await
    }

    /// Textual list of registered nodes, one per line
    pub async fn nodelist(&self) -> String {
        let listing = self.registry.list().await;
        let mut out = String::new();
        for node in &listing {
            let _ = writeln!(
                out,
                "{} {:<9} {:<7} {}",
                node.id,
                node.role.to_string(),
                node.status.to_string(),
                node.addr
            );
        }
        out
    }

    pub async fn node_listing(&self) -> NodeListing {
        self.registry.list().await
    }

    /// Graceful shutdown or ungraceful failure of a node
    pub async fn node_shutdown(&self, node: NodeId, graceful: bool) -> Result<DepartureOutcome> {
        self.departure.on_node_departure(node, graceful).await
    }

    // ==================== Chunks ====================

    /// Create `count` chunks, preferring `preferred` as their owner
    ///
    /// Chunk IDs are minted from the owner's local counter.
    pub async fn chunk_create(
        &self,
        count: usize,
        size: Option<u64>,
        preferred: Option<NodeId>,
    ) -> Result<Vec<ChunkId>> {
        let size = size.unwrap_or(self.config.placement.default_chunk_size);
        let mut created = Vec::with_capacity(count);
        for _ in 0..count {
            let owner = self.placement.place(size, preferred).await?;
            let local = self.registry.allocate_local_ids(owner, 1).await?;
            let id = ChunkId::new(owner, local.start);
            let backups = self.placement.select_backups(owner, size).await;
            self.directory
                .register_chunk(ChunkRecord::new(id, owner, size, backups))?;
            debug!("Created chunk {} on {}", id, owner);
            created.push(id);
        }
        info!("Created {} chunk(s), preferred={:?}", created.len(), preferred);
        Ok(created)
    }

    pub async fn remove_chunk(&self, chunk: ChunkId) -> Result<ChunkRecord> {
        self.directory.remove_chunk(chunk).await
    }

    pub async fn lookup_owner(&self, chunk: ChunkId) -> Result<NodeId> {
        self.directory.lookup_owner(chunk).await
    }

    /// Chunks owned by `node`; without `migrated`, only the ones it created
    pub async fn chunklist(&self, node: NodeId, migrated: bool) -> Result<Vec<ChunkId>> {
        self.registry.get(node).await?;
        Ok(self
            .directory
            .chunks_owned_by(node)
            .into_iter()
            .filter(|r| migrated || !r.is_migrated())
            .map(|r| r.id)
            .collect())
    }

    /// Move `chunk` from `source` to `target`
    pub async fn chunk_migrate(
        &self,
        chunk: ChunkId,
        target: NodeId,
        source: NodeId,
    ) -> Result<MigrationTask> {
        self.coordinator.migrate(chunk, source, target).await
    }

    pub fn cancel_migration(&self, task_id: &str) -> Result<CancelOutcome> {
        self.coordinator.cancel(task_id)
    }

    pub fn migrations(&self) -> Vec<MigrationTask> {
        self.coordinator.manager().all_tasks()
    }

    // ==================== Names ====================

    /// Bind `name` to the chunk `key` of table `table_id`
    pub fn namereg(&self, table_id: u16, key: u64, name: &str) -> Result<ChunkId> {
        let binding = NameBinding::from_table_key(table_id, key, name)
            .ok_or(OverlayError::KeyOutOfRange { key })?;
        let chunk = binding.chunk;
        self.directory.put(binding)?;
        Ok(chunk)
    }

    pub fn namelist(&self) -> Vec<NameBinding> {
        self.directory.names()
    }

    pub fn resolve(&self, name: &str) -> Result<ChunkId> {
        self.directory.resolve(name)
    }

    pub async fn resolve_owner(&self, name: &str) -> Result<NodeId> {
        self.directory.resolve_owner(name).await
    }

    // ==================== Summaries and temp storage ====================

    pub fn metadata_summary(&self, scope: SummaryScope) -> Result<Vec<ShardSummary>> {
        self.directory.summary(scope)
    }

    /// Store a temporary entry, returns the superpeer holding it
    pub fn tmp_create(&self, id: u32, size: u64) -> Result<NodeId> {
        self.directory.temp_create(id, size)
    }

    pub fn tmp_status(&self) -> TempStatus {
        self.directory.temp_status()
    }

    // ==================== Persistence and background tasks ====================

    pub async fn snapshot(&self) -> OverlaySnapshot {
        OverlaySnapshot {
            cluster_name: self.config.cluster.name.clone(),
            saved_at: chrono::Utc::now(),
            nodes: self.registry.snapshot().await,
            directory: self.directory.snapshot(),
        }
    }

    pub async fn save(&self) -> std::result::Result<(), StorageError> {
        let snapshot = self.snapshot().await;
        self.storage.save(&snapshot).await
    }

    /// Treat nodes with expired heartbeats as failed
    pub async fn check_heartbeats(&self) -> Vec<NodeId> {
        let expired = self.registry.expired_nodes().await;
        for node in &expired {
            warn!("Node {} heartbeat timeout, starting recovery", node);
            match self.departure.on_node_departure(*node, false).await {
                Ok(_) => {}
                Err(e) => error!("Failure handling of {} failed: {}", node, e),
            }
        }
        expired
    }

    /// Start heartbeat checker
    pub fn start_failure_detector(self: Arc<Self>) -> JoinHandle<()> {
        let period = self.registry.config().check_interval_secs.max(1);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(period));
            loop {
                interval.tick().await;
                self.check_heartbeats().await;
            }
        })
    }

    /// Start periodic save task
    pub fn start_periodic_save(self: Arc<Self>, interval_secs: u64) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(interval_secs.max(1)));
            loop {
                interval.tick().await;
                if let Err(e) = self.save().await {
                    error!("Failed to save overlay snapshot: {}", e);
                }
            }
        })
    }
}
