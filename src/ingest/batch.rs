//! Batcher: fixed-size groups of nodes or edges, the unit of write and retry.

use serde::Serialize;

use crate::graph::{Edge, Node};

/// Split `items` into groups of `size`, preserving order; the last group may be shorter.
///
/// A `size` of 0 is treated as 1.
pub fn batch<T>(items: Vec<T>, size: usize) -> Vec<Vec<T>> {
    let size = size.max(1);
    let mut groups = Vec::with_capacity(items.len().div_ceil(size));
    let mut current = Vec::with_capacity(size.min(items.len()));
    for item in items {
        current.push(item);
        if current.len() == size {
            groups.push(std::mem::replace(&mut current, Vec::with_capacity(size)));
        }
    }
    if !current.is_empty() {
        groups.push(current);
    }
    groups
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchKind {
    Nodes,
    Edges,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchPayload {
    Nodes(Vec<Node>),
    Edges(Vec<Edge>),
}

/// A group of writes applied, and retried, as one unit. Never split after creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub id: usize,
    pub payload: BatchPayload,
}

impl Batch {
    pub fn kind(&self) -> BatchKind {
        match self.payload {
            BatchPayload::Nodes(_) => BatchKind::Nodes,
            BatchPayload::Edges(_) => BatchKind::Edges,
        }
    }

    pub fn len(&self) -> usize {
        match &self.payload {
            BatchPayload::Nodes(nodes) => nodes.len(),
            BatchPayload::Edges(edges) => edges.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Node batches numbered from `first_id`
pub fn node_batches(nodes: Vec<Node>, size: usize, first_id: usize) -> Vec<Batch> {
    batch(nodes, size)
        .into_iter()
        .enumerate()
        .map(|(i, group)| Batch {
            id: first_id + i,
            payload: BatchPayload::Nodes(group),
        })
        .collect()
}

/// Edge batches numbered from `first_id`
pub fn edge_batches(edges: Vec<Edge>, size: usize, first_id: usize) -> Vec<Batch> {
    batch(edges, size)
        .into_iter()
        .enumerate()
        .map(|(i, group)| Batch {
            id: first_id + i,
            payload: BatchPayload::Edges(group),
        })
        .collect()
}
