//! Overlay metadata definitions
//!
//! Nodes, chunks, name bindings, the superpeer ring and the sharded
//! directory built on top of them

mod chunk;
mod directory;
mod name;
mod node;
pub mod ring;
mod shard;

pub use chunk::{ChunkId, ChunkRecord, ChunkState, LOCAL_ID_MASK};
pub use directory::{
    DirectorySnapshot, MetadataDirectory, ShardSummary, SummaryScope, TempShardStatus, TempStatus,
};
pub use name::NameBinding;
pub use node::{NodeId, NodeInfo, NodeRole, NodeStatus};
pub use ring::{Route, ShardRange, SuperpeerRing};
pub use shard::{MetadataShard, TempEntry};
