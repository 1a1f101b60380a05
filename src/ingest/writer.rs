use async_trait::async_trait;
use rusqlite::params;
use uuid::Uuid;

use crate::db::Db;
use crate::error::{KgraphError, Result};

use super::batch::{Batch, BatchPayload};
use super::pool::BatchWriter;

/// Writes batches into the SQLite graph store, one transaction per batch.
///
/// Both tables are written with `INSERT OR IGNORE` on a deterministic key (node
/// name, edge key), so replaying a batch that was already committed changes nothing.
#[derive(Debug, Clone)]
pub struct SqliteBatchWriter {
    db: Db,
}

impl SqliteBatchWriter {
    pub fn new(db: Db) -> Self {
        Self { db }
    }
}

#[async_trait]
impl BatchWriter for SqliteBatchWriter {
    async fn write_batch(&self, batch: &Batch) -> Result<()> {
        let payload = batch.payload.clone();
        self.db
            .with_connection(move |conn| {
                let tx = conn.transaction()?;
                match &payload {
                    BatchPayload::Nodes(nodes) => {
                        let mut stmt = tx.prepare_cached(
                            "INSERT OR IGNORE INTO node (name, label, node_id) VALUES (?1, ?2, ?3)",
                        )?;
                        for node in nodes {
                            stmt.execute(params![node.name, node.label, Uuid::new_v4().to_string()])?;
                        }
                    }
                    BatchPayload::Edges(edges) => {
                        let mut stmt = tx.prepare_cached(
                            "INSERT OR IGNORE INTO edges (edge_id, edge_key, from_node, to_node, relation) \
                             VALUES (?1, ?2, ?3, ?4, ?5)",
                        )?;
                        for edge in edges {
                            stmt.execute(params![
                                Uuid::new_v4().to_string(),
                                edge.key(),
                                edge.from,
                                edge.to,
                                edge.relation,
                            ])?;
                        }
                    }
                }
                tx.commit()?;
                Ok::<(), KgraphError>(())
            })
            .await
    }
}
