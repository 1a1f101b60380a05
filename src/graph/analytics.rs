//! Store-side neighborhood and aggregate queries.
//!
//! Aggregates run as SQL inside the store; nothing here loads the edge table into
//! process memory.

use rusqlite::params;
use serde::Serialize;

use crate::db::Db;
use crate::error::{KgraphError, Result};

/// A node name with its stored label, if the node row exists
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LabeledNode {
    pub name: String,
    pub label: Option<String>,
}

/// Nodes sharing the highest count of distinct neighbours
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MostConnected {
    pub max_neighbors: usize,
    pub nodes: Vec<String>,
}

// Distinct undirected neighbour pairs, self loops excluded.
const DEGREES_CTE: &str = "WITH pairs AS (
        SELECT from_node AS a, to_node AS b FROM edges WHERE from_node != to_node
        UNION
        SELECT to_node AS a, from_node AS b FROM edges WHERE from_node != to_node
    ),
    degrees AS (SELECT a AS name, COUNT(*) AS n FROM pairs GROUP BY a)";

// Same pairs, but a self loop makes a node its own neighbour.
const DEGREES_WITH_LOOPS_CTE: &str = "WITH pairs AS (
        SELECT from_node AS a, to_node AS b FROM edges
        UNION
        SELECT to_node AS a, from_node AS b FROM edges
    ),
    degrees AS (SELECT a AS name, COUNT(*) AS n FROM pairs GROUP BY a)";

fn require_node(node: &str) -> Result<String> {
    let node = node.trim();
    if node.is_empty() {
        return Err(KgraphError::InvalidInput("node must not be empty".to_string()));
    }
    Ok(node.to_string())
}

async fn names(db: &Db, sql: &'static str, node: String) -> Result<Vec<String>> {
    db.with_connection(move |conn| {
        let mut stmt = conn.prepare_cached(sql)?;
        let rows = stmt.query_map(params![node], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    })
    .await
}

async fn labeled(db: &Db, sql: &'static str, node: String) -> Result<Vec<LabeledNode>> {
    db.with_connection(move |conn| {
        let mut stmt = conn.prepare_cached(sql)?;
        let rows = stmt.query_map(params![node], |row| {
            Ok(LabeledNode {
                name: row.get(0)?,
                label: row.get(1)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    })
    .await
}

/// Distinct successors of `node`, sorted
pub async fn successors(db: &Db, node: &str) -> Result<Vec<String>> {
    let node = require_node(node)?;
    names(
        db,
        "SELECT DISTINCT to_node FROM edges WHERE from_node = ?1 ORDER BY to_node",
        node,
    )
    .await
}

/// Distinct predecessors of `node`, sorted
pub async fn predecessors(db: &Db, node: &str) -> Result<Vec<String>> {
    let node = require_node(node)?;
    names(
        db,
        "SELECT DISTINCT from_node FROM edges WHERE to_node = ?1 ORDER BY from_node",
        node,
    )
    .await
}

/// Successors of successors, excluding `node` itself and paths through a self loop
pub async fn grandchildren(db: &Db, node: &str) -> Result<Vec<LabeledNode>> {
    let node = require_node(node)?;
    labeled(
        db,
        "SELECT DISTINCT e2.to_node, n.label
         FROM edges e1
         JOIN edges e2 ON e2.from_node = e1.to_node
         LEFT JOIN node n ON n.name = e2.to_node
         WHERE e1.from_node = ?1 AND e1.to_node != ?1 AND e2.to_node != ?1
         ORDER BY e2.to_node",
        node,
    )
    .await
}

/// Predecessors of predecessors, excluding `node` itself and paths through a self loop
pub async fn grandparents(db: &Db, node: &str) -> Result<Vec<LabeledNode>> {
    let node = require_node(node)?;
    labeled(
        db,
        "SELECT DISTINCT e2.from_node, n.label
         FROM edges e1
         JOIN edges e2 ON e2.to_node = e1.from_node
         LEFT JOIN node n ON n.name = e2.from_node
         WHERE e1.to_node = ?1 AND e1.from_node != ?1 AND e2.from_node != ?1
         ORDER BY e2.from_node",
        node,
    )
    .await
}

/// Number of stored nodes with no incoming edge
pub async fn count_roots(db: &Db) -> Result<usize> {
    db.with_connection(|conn| {
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM node n WHERE NOT EXISTS (SELECT 1 FROM edges e WHERE e.to_node = n.name)",
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    })
    .await
}

/// Nodes with the most distinct neighbours, either direction. Empty graph gives 0 and no nodes.
pub async fn most_connected(db: &Db) -> Result<MostConnected> {
    db.with_connection(|conn| {
        let sql = format!(
            "{} SELECT name, n FROM degrees WHERE n = (SELECT MAX(n) FROM degrees) ORDER BY name",
            DEGREES_CTE
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;

        let mut result = MostConnected {
            max_neighbors: 0,
            nodes: Vec::new(),
        };
        for row in rows {
            let (name, n) = row?;
            result.max_neighbors = n as usize;
            result.nodes.push(name);
        }
        Ok(result)
    })
    .await
}

/// Number of nodes with exactly one distinct neighbour, either direction.
///
/// Unlike [`most_connected`], a self loop counts: a node whose only edge is a
/// self loop has one neighbour, itself.
pub async fn single_neighbor_count(db: &Db) -> Result<usize> {
    db.with_connection(|conn| {
        let sql = format!("{} SELECT COUNT(*) FROM degrees WHERE n = 1", DEGREES_WITH_LOOPS_CTE);
        let count: i64 = conn.query_row(&sql, [], |row| row.get(0))?;
        Ok(count as usize)
    })
    .await
}
