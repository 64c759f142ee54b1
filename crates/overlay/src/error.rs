//! Overlay error taxonomy

use crate::metadata::{ChunkId, NodeId};
use crate::storage::StorageError;

/// Errors surfaced by the registry, directory, placement, migration and
/// departure components
#[derive(Debug, thiserror::Error)]
pub enum OverlayError {
    #[error("Unknown node: {0}")]
    UnknownNode(NodeId),
    #[error("Name not found: {0}")]
    NotFound(String),
    #[error("Name already bound: {0}")]
    Conflict(String),
    #[error("Unknown chunk: {0}")]
    UnknownChunk(ChunkId),
    #[error("Key {key:#x} does not fit in a 48-bit local chunk counter")]
    KeyOutOfRange { key: u64 },
    #[error("No active peer can accept {size} bytes")]
    NoCapacity { size: u64 },
    #[error("Chunk {chunk} is owned by {actual}, not {expected}")]
    OwnershipMismatch {
        chunk: ChunkId,
        expected: NodeId,
        actual: NodeId,
    },
    #[error("Target node {0} is not an active peer")]
    TargetUnavailable(NodeId),
    #[error("Migration of chunk {chunk} failed: {reason}")]
    MigrationFailed { chunk: ChunkId, reason: String },
    #[error("Migration of chunk {0} was cancelled before commit")]
    MigrationCancelled(ChunkId),
    #[error("Shutdown incomplete, {} chunk(s) not migrated", .chunks.len())]
    ShutdownIncomplete { chunks: Vec<ChunkId> },
    #[error("Data loss, {} chunk(s) have no surviving replica", .chunks.len())]
    DataLoss { chunks: Vec<ChunkId> },
    #[error("Node {0} is already registered")]
    AlreadyRegistered(NodeId),
    #[error("Invalid transition for node {node}: {reason}")]
    InvalidTransition { node: NodeId, reason: String },
    #[error("No superpeer available")]
    NoSuperpeer,
    #[error("Routing exceeded {hops} hops")]
    RoutingExceeded { hops: usize },
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl OverlayError {
    /// Whether the caller may retry the failed operation unchanged
    pub fn is_retryable(&self) -> bool {
        matches!(self, OverlayError::MigrationFailed { .. })
    }
}

pub type Result<T> = std::result::Result<T, OverlayError>;
