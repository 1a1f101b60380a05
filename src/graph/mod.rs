//! Knowledge graph module: data model, neighbor lookups, traversal and store-side queries.
//!
//! Traversal never holds the graph in memory; every hop is a point lookup through a
//! [`NeighborLookup`], so the graph may be larger than RAM.

pub mod analytics;
pub mod lookup;
pub mod rename;
pub mod traversal;

pub use lookup::{CachedLookup, Direction, NeighborLookup, SqliteLookup};
pub use traversal::{
    distant_antonyms, distant_relations, distant_synonyms, shortest_path, validate_distance,
    DistantMatch, Reach, RelationQuery, RelationState, ShortestPath, TraversalOptions,
};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A concept node (name is the unique key).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub label: String,
}

/// A typed directed edge between two node names (from --relation--> to).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Edge {
    pub from: String,
    pub to: String,
    pub relation: String,
}

impl Edge {
    pub fn new(from: impl Into<String>, to: impl Into<String>, relation: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            relation: relation.into(),
        }
    }

    /// Stable write key: SHA256 of `from \0 to \0 relation`.
    ///
    /// The store ignores inserts whose key already exists, so retrying a batch
    /// that was in fact applied never duplicates rows.
    pub fn key(&self) -> String {
        edge_key(&self.from, &self.to, &self.relation)
    }
}

pub(crate) fn edge_key(from: &str, to: &str, relation: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(from.as_bytes());
    hasher.update([0u8]);
    hasher.update(to.as_bytes());
    hasher.update([0u8]);
    hasher.update(relation.as_bytes());
    format!("{:x}", hasher.finalize())
}
