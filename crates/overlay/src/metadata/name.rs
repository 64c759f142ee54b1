//! Name bindings

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ChunkId, NodeId};

/// Human-readable alias for a chunk
///
/// Several names may point at the same chunk; a name is bound at most once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameBinding {
    pub name: String,
    pub chunk: ChunkId,
    pub registered_at: DateTime<Utc>,
}

impl NameBinding {
    pub fn new(name: impl Into<String>, chunk: ChunkId) -> Self {
        Self {
            name: name.into(),
            chunk,
            registered_at: Utc::now(),
        }
    }

    /// Binding addressed by (table, key), where the table is the creator node
    /// and the key its local chunk counter. `None` if the key exceeds 48 bits.
    pub fn from_table_key(table_id: u16, key: u64, name: impl Into<String>) -> Option<Self> {
        ChunkId::checked(NodeId(table_id), key).map(|chunk| Self::new(name, chunk))
    }
}
