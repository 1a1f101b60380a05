//! Graph Lookup Client: the only read path traversal uses.

use std::num::NonZeroUsize;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use lru::LruCache;
use rusqlite::{params, OptionalExtension};
use serde::Serialize;

use crate::db::Db;
use crate::error::Result;

/// Edge direction relative to the node being looked up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// `node -> neighbor`
    Outgoing,
    /// `neighbor -> node`
    Incoming,
}

/// Neighbor and label lookups against the backing store.
///
/// Every call is an independent point/predicate lookup; implementations must not
/// hold the whole graph in memory. Any error aborts the calling traversal.
#[async_trait]
pub trait NeighborLookup: Send + Sync {
    /// Neighbor names of `node` in `direction`, optionally restricted to one relation.
    /// Names repeat when several matching edges connect the same pair.
    async fn neighbors(&self, node: &str, direction: Direction, relation: Option<&str>) -> Result<Vec<String>>;

    /// Label stored for `node`, `None` when the node was never inserted
    async fn label(&self, node: &str) -> Result<Option<String>>;
}

/// [`NeighborLookup`] over the SQLite `edges` and `node` tables
#[derive(Debug, Clone)]
pub struct SqliteLookup {
    db: Db,
}

impl SqliteLookup {
    pub fn new(db: Db) -> Self {
        Self { db }
    }
}

#[async_trait]
impl NeighborLookup for SqliteLookup {
    async fn neighbors(&self, node: &str, direction: Direction, relation: Option<&str>) -> Result<Vec<String>> {
        let node = node.to_string();
        let relation = relation.map(str::to_string);
        self.db
            .with_connection(move |conn| {
                let (select, key) = match direction {
                    Direction::Outgoing => ("to_node", "from_node"),
                    Direction::Incoming => ("from_node", "to_node"),
                };
                // rowid order keeps enumeration, and so reported paths, stable
                let mut out = Vec::new();
                match relation {
                    Some(relation) => {
                        let sql = format!(
                            "SELECT {} FROM edges WHERE {} = ?1 AND relation = ?2 ORDER BY rowid",
                            select, key
                        );
                        let mut stmt = conn.prepare_cached(&sql)?;
                        let rows = stmt.query_map(params![node, relation], |row| row.get::<_, String>(0))?;
                        for row in rows {
                            out.push(row?);
                        }
                    }
                    None => {
                        let sql = format!("SELECT {} FROM edges WHERE {} = ?1 ORDER BY rowid", select, key);
                        let mut stmt = conn.prepare_cached(&sql)?;
                        let rows = stmt.query_map(params![node], |row| row.get::<_, String>(0))?;
                        for row in rows {
                            out.push(row?);
                        }
                    }
                }
                Ok(out)
            })
            .await
    }

    async fn label(&self, node: &str) -> Result<Option<String>> {
        let node = node.to_string();
        self.db
            .with_connection(move |conn| {
                Ok(conn
                    .query_row("SELECT label FROM node WHERE name = ?1", params![node], |row| row.get(0))
                    .optional()?)
            })
            .await
    }
}

type NeighborKey = (String, Direction, Option<String>);

/// Bounded LRU in front of another lookup.
///
/// Only successful neighbor lists are cached; labels always go to the inner lookup.
/// Entries can go stale if the store is written while the cache is alive.
pub struct CachedLookup<L> {
    inner: L,
    cache: Mutex<LruCache<NeighborKey, Vec<String>>>,
}

impl<L: NeighborLookup> CachedLookup<L> {
    /// Wrap `inner` with room for `capacity` neighbor lists (at least 1)
    pub fn new(inner: L, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn len(&self) -> usize {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

#[async_trait]
impl<L: NeighborLookup> NeighborLookup for CachedLookup<L> {
    async fn neighbors(&self, node: &str, direction: Direction, relation: Option<&str>) -> Result<Vec<String>> {
        let key: NeighborKey = (node.to_string(), direction, relation.map(str::to_string));
        let hit = self.cache.lock().unwrap_or_else(PoisonError::into_inner).get(&key).cloned();
        if let Some(neighbors) = hit {
            return Ok(neighbors);
        }

        let neighbors = self.inner.neighbors(node, direction, relation).await?;
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .put(key, neighbors.clone());
        Ok(neighbors)
    }

    async fn label(&self, node: &str) -> Result<Option<String>> {
        self.inner.label(node).await
    }
}
