//! Node rename as a resumable saga.
//!
//! A rename copies the node under its new name, re-points every edge and then
//! removes the old node. Each step commits in its own transaction together with
//! the `rename_log` row recording it, so after any failure the log names the last
//! step that is durably applied and [`resume_rename`] continues from there. Every
//! step is safe to re-run.

use std::fmt;
use std::str::FromStr;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::Serialize;
use uuid::Uuid;

use crate::db::Db;
use crate::error::{KgraphError, Result};

use super::edge_key;

/// Last durably completed step of a rename
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RenameStep {
    Started,
    NewNodeInserted,
    OutgoingMigrated,
    IncomingMigrated,
    OldEdgesDeleted,
    Completed,
}

impl RenameStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            RenameStep::Started => "started",
            RenameStep::NewNodeInserted => "new_node_inserted",
            RenameStep::OutgoingMigrated => "outgoing_migrated",
            RenameStep::IncomingMigrated => "incoming_migrated",
            RenameStep::OldEdgesDeleted => "old_edges_deleted",
            RenameStep::Completed => "completed",
        }
    }

    fn next(self) -> Option<Self> {
        match self {
            RenameStep::Started => Some(RenameStep::NewNodeInserted),
            RenameStep::NewNodeInserted => Some(RenameStep::OutgoingMigrated),
            RenameStep::OutgoingMigrated => Some(RenameStep::IncomingMigrated),
            RenameStep::IncomingMigrated => Some(RenameStep::OldEdgesDeleted),
            RenameStep::OldEdgesDeleted => Some(RenameStep::Completed),
            RenameStep::Completed => None,
        }
    }
}

impl fmt::Display for RenameStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RenameStep {
    type Err = KgraphError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "started" => Ok(RenameStep::Started),
            "new_node_inserted" => Ok(RenameStep::NewNodeInserted),
            "outgoing_migrated" => Ok(RenameStep::OutgoingMigrated),
            "incoming_migrated" => Ok(RenameStep::IncomingMigrated),
            "old_edges_deleted" => Ok(RenameStep::OldEdgesDeleted),
            "completed" => Ok(RenameStep::Completed),
            other => Err(KgraphError::Store(format!("unknown rename step {:?}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RenameStatus {
    InProgress,
    Failed,
    Completed,
}

impl RenameStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RenameStatus::InProgress => "in_progress",
            RenameStatus::Failed => "failed",
            RenameStatus::Completed => "completed",
        }
    }
}

impl FromStr for RenameStatus {
    type Err = KgraphError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "in_progress" => Ok(RenameStatus::InProgress),
            "failed" => Ok(RenameStatus::Failed),
            "completed" => Ok(RenameStatus::Completed),
            other => Err(KgraphError::Store(format!("unknown rename status {:?}", other))),
        }
    }
}

/// One row of `rename_log`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenameRecord {
    pub rename_id: String,
    pub old_name: String,
    pub new_name: String,
    pub label: String,
    pub step: RenameStep,
    pub status: RenameStatus,
    pub error_message: Option<String>,
    pub started_at: String,
    pub updated_at: String,
}

fn now() -> String {
    Utc::now().to_rfc3339()
}

fn load_record(conn: &Connection, rename_id: &str) -> Result<Option<RenameRecord>> {
    let row = conn
        .query_row(
            "SELECT rename_id, old_name, new_name, label, step, status, error_message, started_at, updated_at
             FROM rename_log WHERE rename_id = ?1",
            params![rename_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, Option<String>>(6)?,
                    row.get::<_, String>(7)?,
                    row.get::<_, String>(8)?,
                ))
            },
        )
        .optional()?;

    let Some((rename_id, old_name, new_name, label, step, status, error_message, started_at, updated_at)) = row else {
        return Ok(None);
    };
    Ok(Some(RenameRecord {
        rename_id,
        old_name,
        new_name,
        label,
        step: step.parse()?,
        status: status.parse()?,
        error_message,
        started_at,
        updated_at,
    }))
}

fn insert_edge(tx: &Transaction, from: &str, to: &str, relation: &str) -> Result<()> {
    tx.execute(
        "INSERT OR IGNORE INTO edges (edge_id, edge_key, from_node, to_node, relation) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![Uuid::new_v4().to_string(), edge_key(from, to, relation), from, to, relation],
    )?;
    Ok(())
}

fn apply_step(tx: &Transaction, record: &RenameRecord, step: RenameStep) -> Result<()> {
    let old = record.old_name.as_str();
    let new = record.new_name.as_str();
    match step {
        RenameStep::Started => {}
        RenameStep::NewNodeInserted => {
            tx.execute(
                "INSERT OR IGNORE INTO node (name, label, node_id) VALUES (?1, ?2, ?3)",
                params![new, record.label, Uuid::new_v4().to_string()],
            )?;
        }
        RenameStep::OutgoingMigrated => {
            let targets: Vec<(String, String)> = {
                let mut stmt = tx.prepare("SELECT to_node, relation FROM edges WHERE from_node = ?1 ORDER BY rowid")?;
                let rows = stmt.query_map(params![old], |row| Ok((row.get(0)?, row.get(1)?)))?;
                rows.collect::<std::result::Result<_, rusqlite::Error>>()?
            };
            for (to, relation) in targets {
                // Self loops stay self loops
                let to = if to == old { new } else { to.as_str() };
                insert_edge(tx, new, to, &relation)?;
            }
        }
        RenameStep::IncomingMigrated => {
            let sources: Vec<(String, String)> = {
                let mut stmt = tx.prepare(
                    "SELECT from_node, relation FROM edges WHERE to_node = ?1 AND from_node != ?1 ORDER BY rowid",
                )?;
                let rows = stmt.query_map(params![old], |row| Ok((row.get(0)?, row.get(1)?)))?;
                rows.collect::<std::result::Result<_, rusqlite::Error>>()?
            };
            for (from, relation) in sources {
                insert_edge(tx, &from, new, &relation)?;
            }
        }
        RenameStep::OldEdgesDeleted => {
            tx.execute("DELETE FROM edges WHERE from_node = ?1 OR to_node = ?1", params![old])?;
        }
        RenameStep::Completed => {
            tx.execute("DELETE FROM node WHERE name = ?1", params![old])?;
        }
    }
    Ok(())
}

fn mark_failed(conn: &Connection, rename_id: &str, message: &str) -> Result<()> {
    conn.execute(
        "UPDATE rename_log SET status = ?1, error_message = ?2, updated_at = ?3 WHERE rename_id = ?4",
        params![RenameStatus::Failed.as_str(), message, now(), rename_id],
    )?;
    Ok(())
}

/// Apply every step after `record.step`, one transaction per step
fn run_steps(conn: &mut Connection, mut record: RenameRecord) -> Result<RenameRecord> {
    while let Some(step) = record.step.next() {
        let applied = (|| -> Result<()> {
            let tx = conn.transaction()?;
            apply_step(&tx, &record, step)?;
            let status = if step == RenameStep::Completed {
                RenameStatus::Completed
            } else {
                RenameStatus::InProgress
            };
            tx.execute(
                "UPDATE rename_log SET step = ?1, status = ?2, error_message = NULL, updated_at = ?3
                 WHERE rename_id = ?4",
                params![step.as_str(), status.as_str(), now(), record.rename_id],
            )?;
            tx.commit()?;
            Ok(())
        })();

        if let Err(e) = applied {
            let message = e.to_string();
            log::error!(
                "rename {} ({} -> {}) failed at {}: {}",
                record.rename_id,
                record.old_name,
                record.new_name,
                step,
                message
            );
            if let Err(mark_err) = mark_failed(conn, &record.rename_id, &message) {
                log::warn!("could not mark rename {} failed: {}", record.rename_id, mark_err);
            }
            return Err(KgraphError::Rename {
                rename_id: record.rename_id,
                step: record.step.to_string(),
                message,
            });
        }

        log::debug!("rename {}: {}", record.rename_id, step);
        record.step = step;
    }

    log::info!("renamed {} -> {} ({})", record.old_name, record.new_name, record.rename_id);
    load_record(conn, &record.rename_id)?
        .ok_or_else(|| KgraphError::Store(format!("rename {} vanished from rename_log", record.rename_id)))
}

/// Rename `old_name` to `new_name`, moving its label and every incident edge.
///
/// A missing `old_name` or an existing `new_name` is rejected before anything is
/// written. A failing step leaves the log row `failed` and returns
/// [`KgraphError::Rename`]; pass its id to [`resume_rename`].
pub async fn rename_node(db: &Db, old_name: &str, new_name: &str) -> Result<RenameRecord> {
    let old_name = old_name.trim().to_string();
    let new_name = new_name.trim().to_string();
    if old_name.is_empty() || new_name.is_empty() {
        return Err(KgraphError::InvalidInput("old and new names are both required".to_string()));
    }
    if old_name == new_name {
        return Err(KgraphError::InvalidInput(format!("{} is already named {}", old_name, new_name)));
    }

    db.with_connection(move |conn| {
        let record = {
            let tx = conn.transaction()?;
            let label: Option<String> = tx
                .query_row("SELECT label FROM node WHERE name = ?1", params![old_name], |row| row.get(0))
                .optional()?;
            let label = label.ok_or_else(|| KgraphError::NodeNotFound(old_name.clone()))?;

            let taken: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM node WHERE name = ?1)",
                params![new_name],
                |row| row.get(0),
            )?;
            if taken {
                return Err(KgraphError::InvalidInput(format!("node {} already exists", new_name)));
            }

            let started_at = now();
            let record = RenameRecord {
                rename_id: Uuid::new_v4().to_string(),
                old_name,
                new_name,
                label,
                step: RenameStep::Started,
                status: RenameStatus::InProgress,
                error_message: None,
                started_at: started_at.clone(),
                updated_at: started_at,
            };
            tx.execute(
                "INSERT INTO rename_log
                    (rename_id, old_name, new_name, label, step, status, error_message, started_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, ?7, ?8)",
                params![
                    record.rename_id,
                    record.old_name,
                    record.new_name,
                    record.label,
                    record.step.as_str(),
                    record.status.as_str(),
                    record.started_at,
                    record.updated_at,
                ],
            )?;
            tx.commit()?;
            record
        };

        log::info!("rename {} started: {} -> {}", record.rename_id, record.old_name, record.new_name);
        run_steps(conn, record)
    })
    .await
}

/// Continue a rename from its last recorded step. A completed rename is returned as is.
pub async fn resume_rename(db: &Db, rename_id: &str) -> Result<RenameRecord> {
    let rename_id = rename_id.to_string();
    db.with_connection(move |conn| {
        let record = load_record(conn, &rename_id)?
            .ok_or_else(|| KgraphError::InvalidInput(format!("unknown rename id {}", rename_id)))?;
        if record.status == RenameStatus::Completed {
            return Ok(record);
        }
        log::info!("resuming rename {} after {}", record.rename_id, record.step);
        run_steps(conn, record)
    })
    .await
}

/// Fetch a `rename_log` row
pub async fn get_rename(db: &Db, rename_id: &str) -> Result<Option<RenameRecord>> {
    let rename_id = rename_id.to_string();
    db.with_connection(move |conn| load_record(conn, &rename_id)).await
}
