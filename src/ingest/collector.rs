//! Deduplicating collector: unique node set plus the raw edge list.
//!
//! First sighting wins: the label from the earliest line naming a node is kept and
//! later sightings are dropped, not merged. This trades label fidelity for a single
//! map probe per sighting. Parser threads may observe lines out of order, so
//! "earliest" is decided by line number rather than arrival.
//!
//! Nodes and edges live behind separate locks; a parser thread never holds both.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Mutex, PoisonError};

use crate::error::Result;
use crate::graph::{Edge, Node};

use super::record::{try_parse_record, Record};

const LINE_CHANNEL_CAPACITY: usize = 10_000;

#[derive(Default)]
struct NodeTable {
    index: HashMap<String, usize>,
    // (first line seen, node)
    nodes: Vec<(u64, Node)>,
}

impl NodeTable {
    fn observe(&mut self, line_no: u64, name: &str, label: &str) {
        if let Some(&slot) = self.index.get(name) {
            let entry = &mut self.nodes[slot];
            if line_no < entry.0 {
                entry.0 = line_no;
                entry.1.label = label.to_string();
            }
            return;
        }
        self.index.insert(name.to_string(), self.nodes.len());
        self.nodes.push((
            line_no,
            Node {
                name: name.to_string(),
                label: label.to_string(),
            },
        ));
    }
}

/// Output of one collection run, in input order
#[derive(Debug, Default)]
pub struct Collected {
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
    /// Data lines seen (header excluded)
    pub records: usize,
    /// Lines rejected by the record parser
    pub skipped: usize,
}

/// Thread-safe accumulator shared by parser threads for one ingestion run
#[derive(Default)]
pub struct Collector {
    nodes: Mutex<NodeTable>,
    edges: Mutex<Vec<(u64, Edge)>>,
    records: AtomicUsize,
    skipped: AtomicUsize,
}

impl Collector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and collect one data line. Returns false when the line was skipped.
    pub fn add_line(&self, line_no: u64, line: &str) -> bool {
        self.records.fetch_add(1, Ordering::Relaxed);
        match try_parse_record(line) {
            Ok(record) => {
                self.add_record(line_no, record);
                true
            }
            Err(e) => {
                log::debug!("Skipping line {}: {}", line_no, e);
                self.skipped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Collect an already parsed record.
    ///
    /// A node is only collected when both name and label are present; an edge when
    /// both endpoint names are present.
    pub fn add_record(&self, line_no: u64, record: Record) {
        {
            let mut nodes = self.nodes.lock().unwrap_or_else(PoisonError::into_inner);
            if !record.first.is_empty() && !record.first_label.is_empty() {
                nodes.observe(line_no, &record.first, &record.first_label);
            }
            if !record.second.is_empty() && !record.second_label.is_empty() {
                nodes.observe(line_no, &record.second, &record.second_label);
            }
        }

        if !record.first.is_empty() && !record.second.is_empty() {
            let edge = Edge {
                from: record.first,
                to: record.second,
                relation: record.relation,
            };
            self.edges
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push((line_no, edge));
        }
    }

    /// Finish the run, ordering nodes by first sighting and edges by line
    pub fn into_collected(self) -> Collected {
        let mut nodes = self.nodes.into_inner().unwrap_or_else(PoisonError::into_inner).nodes;
        nodes.sort_by_key(|(line_no, _)| *line_no);

        let mut edges = self.edges.into_inner().unwrap_or_else(PoisonError::into_inner);
        // Stable: two edges from the same line keep their push order
        edges.sort_by_key(|(line_no, _)| *line_no);

        Collected {
            nodes: nodes.into_iter().map(|(_, n)| n).collect(),
            edges: edges.into_iter().map(|(_, e)| e).collect(),
            records: self.records.into_inner(),
            skipped: self.skipped.into_inner(),
        }
    }
}

/// Drop repeated `(from, to, relation)` triples, keeping the first.
///
/// Returns the surviving edges in order and the number removed.
pub fn dedup_edges(edges: Vec<Edge>) -> (Vec<Edge>, usize) {
    let before = edges.len();
    let mut seen = HashSet::with_capacity(edges.len());
    let kept: Vec<Edge> = edges
        .into_iter()
        .filter(|e| seen.insert((e.from.clone(), e.to.clone(), e.relation.clone())))
        .collect();
    let removed = before - kept.len();
    (kept, removed)
}

/// Feed numbered lines to `threads` parser threads sharing `collector`.
pub fn collect_lines<I>(lines: I, threads: usize, collector: &Collector)
where
    I: IntoIterator<Item = (u64, String)>,
{
    let (tx, rx) = mpsc::sync_channel::<(u64, String)>(LINE_CHANNEL_CAPACITY);
    let rx = Mutex::new(rx);

    std::thread::scope(|scope| {
        for _ in 0..threads.max(1) {
            scope.spawn(|| loop {
                let next = rx.lock().unwrap_or_else(PoisonError::into_inner).recv();
                match next {
                    Ok((line_no, line)) => {
                        collector.add_line(line_no, &line);
                    }
                    Err(_) => break,
                }
            });
        }

        for item in lines {
            if tx.send(item).is_err() {
                break;
            }
        }
        drop(tx);
    });
}

/// Read a TSV file (header skipped) and collect it with `threads` parser threads.
///
/// Blocking; call from `spawn_blocking` in async contexts.
pub fn collect_file(path: &Path, threads: usize) -> Result<Collected> {
    let mut reader = BufReader::new(File::open(path)?);
    let collector = Collector::new();
    let mut read_error = None;

    let mut header = Vec::new();
    reader.read_until(b'\n', &mut header)?;

    let lines = std::iter::from_fn(|| {
        let mut buf = Vec::new();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => None,
            Ok(_) => Some(String::from_utf8_lossy(&buf).into_owned()),
            Err(e) => {
                read_error = Some(e);
                None
            }
        }
    })
    .zip(2u64..)
    .map(|(line, line_no)| (line_no, line));

    collect_lines(lines, threads, &collector);

    if let Some(e) = read_error {
        return Err(e.into());
    }

    let collected = collector.into_collected();
    log::info!(
        "Collected {} unique nodes and {} edges from {} records ({} skipped) in {}",
        collected.nodes.len(),
        collected.edges.len(),
        collected.records,
        collected.skipped,
        path.display()
    );
    Ok(collected)
}
