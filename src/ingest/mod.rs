pub mod batch;
pub mod collector;
pub mod pool;
pub mod record;
pub mod writer;

pub use batch::{batch, edge_batches, node_batches, Batch, BatchKind, BatchPayload};
pub use collector::{collect_file, collect_lines, dedup_edges, Collected, Collector};
pub use pool::{Backoff, BatchOutcome, BatchStatus, BatchWriter, PoolOptions, PoolReport, Submission, WritePool};
pub use record::{parse_record, try_parse_record, Record, MIN_FIELDS};
pub use writer::SqliteBatchWriter;

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;

use crate::config::LoaderConfig;
use crate::db::Db;
use crate::error::{KgraphError, Result};

/// Summary of one load run
#[derive(Debug, Clone, Default, Serialize)]
pub struct LoadReport {
    pub records: usize,
    pub skipped: usize,
    pub nodes: usize,
    pub edges: usize,
    pub duplicate_edges_dropped: usize,
    pub node_batches: usize,
    pub edge_batches: usize,
    pub succeeded: usize,
    /// Ids of batches that failed every attempt
    pub exhausted: Vec<usize>,
    pub total_attempts: u64,
    pub elapsed_ms: u64,
}

impl LoadReport {
    /// True when every batch was written
    pub fn is_complete(&self) -> bool {
        self.exhausted.is_empty()
    }
}

/// Submit every batch to a fresh pool and wait for all of them to resolve
pub async fn write_graph(writer: Arc<dyn BatchWriter>, batches: Vec<Batch>, options: PoolOptions) -> Result<PoolReport> {
    let pool = WritePool::start(writer, options);
    for batch in batches {
        pool.submit(batch).await?;
    }
    pool.close().await
}

/// Dedup, batch and write an already collected graph. Node batches are queued first.
pub async fn load_collected(
    writer: Arc<dyn BatchWriter>,
    collected: Collected,
    config: &LoaderConfig,
) -> Result<LoadReport> {
    let Collected {
        nodes,
        edges,
        records,
        skipped,
    } = collected;

    let (edges, duplicate_edges_dropped) = if config.dedup_edges {
        dedup_edges(edges)
    } else {
        (edges, 0)
    };
    if duplicate_edges_dropped > 0 {
        log::info!("Dropped {} duplicate edges", duplicate_edges_dropped);
    }

    let node_count = nodes.len();
    let edge_count = edges.len();
    let mut batches = node_batches(nodes, config.batch_size, 0);
    let node_batch_count = batches.len();
    batches.extend(edge_batches(edges, config.batch_size, node_batch_count));
    let edge_batch_count = batches.len() - node_batch_count;

    log::info!(
        "Writing {} nodes in {} batches and {} edges in {} batches with {} workers",
        node_count,
        node_batch_count,
        edge_count,
        edge_batch_count,
        config.workers
    );

    let pool_report = write_graph(writer, batches, config.pool_options()).await?;

    let exhausted: Vec<usize> = pool_report.exhausted().iter().map(|o| o.batch_id).collect();
    if !exhausted.is_empty() {
        log::warn!("{} batches were not written: {:?}", exhausted.len(), exhausted);
    }

    Ok(LoadReport {
        records,
        skipped,
        nodes: node_count,
        edges: edge_count,
        duplicate_edges_dropped,
        node_batches: node_batch_count,
        edge_batches: edge_batch_count,
        succeeded: pool_report.succeeded(),
        exhausted,
        total_attempts: pool_report.total_attempts(),
        elapsed_ms: 0,
    })
}

/// Load a TSV edge list into the store at `db`.
///
/// Parsing runs on the blocking pool; writes go through a [`WritePool`] over a
/// [`SqliteBatchWriter`]. Exhausted batches are reported, not returned as errors.
pub async fn load_file(db: &Db, path: &Path, config: &LoaderConfig) -> Result<LoadReport> {
    let started = Instant::now();
    log::info!("Loading {}", path.display());

    let source = path.to_path_buf();
    let threads = config.parser_threads;
    let collected = tokio::task::spawn_blocking(move || collect_file(&source, threads))
        .await
        .map_err(|e| KgraphError::Store(format!("collector task failed: {}", e)))??;

    let writer: Arc<dyn BatchWriter> = Arc::new(SqliteBatchWriter::new(db.clone()));
    let mut report = load_collected(writer, collected, config).await?;
    report.elapsed_ms = started.elapsed().as_millis() as u64;

    log::info!(
        "Loaded {} in {} ms: {}/{} batches written, {} attempts",
        path.display(),
        report.elapsed_ms,
        report.succeeded,
        report.node_batches + report.edge_batches,
        report.total_attempts
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackoffKind, TraversalConfig};
    use crate::db::migrate;
    use crate::graph::{distant_antonyms, shortest_path, NeighborLookup, Reach, SqliteLookup, TraversalOptions};
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::fs;
    use std::sync::Mutex;
    use tempfile::TempDir;

    const HEADER: &str = "id\tnode1\trelation\tnode2\tnode1;label\tnode2;label\trelation;label";

    fn row(first: &str, first_label: &str, second: &str, second_label: &str, relation: &str) -> String {
        format!("e\t{}\t/r/x\t{}\t{}\t{}\t{}", first, second, first_label, second_label, relation)
    }

    fn fast_config() -> LoaderConfig {
        LoaderConfig {
            batch_size: 2,
            workers: 3,
            parser_threads: 2,
            queue_capacity: 2,
            max_attempts: 3,
            backoff: BackoffKind::Fixed,
            backoff_ms: 1,
            ..Default::default()
        }
    }

    async fn setup(rows: &[String]) -> (Db, TempDir, std::path::PathBuf) {
        let temp_dir = TempDir::new().unwrap();
        let db = Db::new(temp_dir.path().join("graph.db"));
        let migrations_dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("migrations");
        db.with_connection(move |conn| migrate::run_migrations(conn, &migrations_dir))
            .await
            .unwrap();

        let tsv = temp_dir.path().join("graph.tsv");
        let mut body = vec![HEADER.to_string()];
        body.extend(rows.iter().cloned());
        fs::write(&tsv, body.join("\n")).unwrap();
        (db, temp_dir, tsv)
    }

    async fn edge_rows(db: &Db) -> i64 {
        db.with_connection(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM edges", [], |r| r.get(0))?))
            .await
            .unwrap()
    }

    fn sample_rows() -> Vec<String> {
        vec![
            row("a", "first-a", "b", "B", "synonym"),
            row("b", "B", "c", "C", "antonym"),
            row("a", "second-a", "d", "D", "related"),
            row("d", "D", "c", "C", "related"),
            row("a", "third-a", "b", "B", "synonym"),
            "short\tline".to_string(),
        ]
    }

    #[tokio::test]
    async fn test_load_file_end_to_end() {
        let (db, _temp, tsv) = setup(&sample_rows()).await;

        let report = load_file(&db, &tsv, &fast_config()).await.unwrap();
        assert!(report.is_complete());
        assert_eq!(report.records, 6);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.nodes, 4);
        assert_eq!(report.edges, 4);
        assert_eq!(report.duplicate_edges_dropped, 1);
        assert_eq!(report.node_batches, 2);
        assert_eq!(report.edge_batches, 2);
        assert_eq!(report.succeeded, 4);
        assert_eq!(edge_rows(&db).await, 4);

        let lookup = SqliteLookup::new(db.clone());
        assert_eq!(lookup.label("a").await.unwrap().as_deref(), Some("first-a"));

        let path = shortest_path(&lookup, "a", "c", Reach::Directed, TraversalOptions::default())
            .await
            .unwrap();
        assert_eq!(path.distance, Some(2));

        let antonyms = distant_antonyms(&lookup, "a", 2, &TraversalConfig::default(), TraversalOptions::default())
            .await
            .unwrap();
        assert!(antonyms.iter().any(|m| m.node == "c"));
    }

    #[tokio::test]
    async fn test_reloading_same_file_adds_nothing() {
        let (db, _temp, tsv) = setup(&sample_rows()).await;
        let config = fast_config();
        load_file(&db, &tsv, &config).await.unwrap();
        load_file(&db, &tsv, &config).await.unwrap();
        assert_eq!(edge_rows(&db).await, 4);
    }

    /// Applies every batch, then reports failure on the first attempt of each
    struct AppliedThenFailed {
        inner: SqliteBatchWriter,
        seen: Mutex<HashSet<usize>>,
    }

    #[async_trait]
    impl BatchWriter for AppliedThenFailed {
        async fn write_batch(&self, batch: &Batch) -> Result<()> {
            self.inner.write_batch(batch).await?;
            if self.seen.lock().unwrap().insert(batch.id) {
                return Err(KgraphError::Store("acknowledgement lost".to_string()));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_retried_batches_do_not_duplicate_rows() {
        let (db, _temp, tsv) = setup(&sample_rows()).await;
        let collected = collect_file(&tsv, 2).unwrap();
        let writer = Arc::new(AppliedThenFailed {
            inner: SqliteBatchWriter::new(db.clone()),
            seen: Mutex::new(HashSet::new()),
        });

        let report = load_collected(writer, collected, &fast_config()).await.unwrap();
        assert!(report.is_complete());
        assert_eq!(report.total_attempts, 8);
        assert_eq!(edge_rows(&db).await, 4);
    }

    #[tokio::test]
    async fn test_exhausted_batches_reported_not_fatal() {
        struct AlwaysFails;

        #[async_trait]
        impl BatchWriter for AlwaysFails {
            async fn write_batch(&self, batch: &Batch) -> Result<()> {
                if batch.kind() == BatchKind::Edges {
                    return Err(KgraphError::Store("store unavailable".to_string()));
                }
                Ok(())
            }
        }

        let (_db, _temp, tsv) = setup(&sample_rows()).await;
        let collected = collect_file(&tsv, 1).unwrap();
        let report = load_collected(Arc::new(AlwaysFails), collected, &fast_config()).await.unwrap();

        assert!(!report.is_complete());
        assert_eq!(report.succeeded, 2);
        assert_eq!(report.exhausted, vec![2, 3]);
        assert_eq!(report.total_attempts, 2 + 2 * 3);
    }

    #[tokio::test]
    async fn test_dedup_can_be_disabled() {
        let (_db, _temp, tsv) = setup(&sample_rows()).await;
        let collected = collect_file(&tsv, 1).unwrap();
        struct Accept;

        #[async_trait]
        impl BatchWriter for Accept {
            async fn write_batch(&self, _batch: &Batch) -> Result<()> {
                Ok(())
            }
        }

        let config = LoaderConfig {
            dedup_edges: false,
            ..fast_config()
        };
        let report = load_collected(Arc::new(Accept), collected, &config).await.unwrap();
        assert_eq!(report.edges, 5);
        assert_eq!(report.duplicate_edges_dropped, 0);
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let temp_dir = TempDir::new().unwrap();
        let db = Db::new(temp_dir.path().join("graph.db"));
        let result = load_file(&db, &temp_dir.path().join("absent.tsv"), &fast_config()).await;
        assert!(matches!(result, Err(KgraphError::Io(_))));
    }
}
