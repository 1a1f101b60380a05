//! Write worker pool: bounded queue, fixed workers, whole-batch retry with backoff.
//!
//! A failed batch goes back into the same queue after its backoff delay. Because
//! retries can refill a queue that looked drained, completion is tracked with a
//! pending counter (batches submitted but not yet succeeded or exhausted) instead
//! of queue closure: workers stop only once the pool is closed *and* that counter
//! reaches zero.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;

use crate::error::{KgraphError, Result};

use super::batch::{Batch, BatchKind};

/// Store write surface: apply a whole batch or fail it.
#[async_trait]
pub trait BatchWriter: Send + Sync {
    async fn write_batch(&self, batch: &Batch) -> Result<()>;
}

/// Delay before retrying a failed batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Same delay after every failure
    Fixed(Duration),
    /// `base * attempt`
    Linear(Duration),
    /// `base * 2^(attempt - 1)`, capped at `max`
    Exponential { base: Duration, max: Duration },
}

impl Backoff {
    /// Delay after the `attempt`-th failure (1-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::Fixed(delay) => delay,
            Backoff::Linear(base) => base.saturating_mul(attempt.max(1)),
            Backoff::Exponential { base, max } => {
                let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
                base.saturating_mul(factor).min(max)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolOptions {
    pub workers: usize,
    pub queue_capacity: usize,
    /// Attempts per batch, first attempt included
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            workers: 8,
            queue_capacity: 64,
            max_attempts: 5,
            backoff: Backoff::Linear(Duration::from_secs(3)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum BatchStatus {
    Succeeded,
    Exhausted { error: String },
}

/// Final result for one batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchOutcome {
    pub batch_id: usize,
    pub kind: BatchKind,
    pub len: usize,
    pub attempts: u32,
    #[serde(flatten)]
    pub status: BatchStatus,
}

impl BatchOutcome {
    pub fn succeeded(&self) -> bool {
        self.status == BatchStatus::Succeeded
    }
}

/// Every outcome produced by a pool, ordered by batch id
#[derive(Debug, Default, Clone, Serialize)]
pub struct PoolReport {
    pub outcomes: Vec<BatchOutcome>,
}

impl PoolReport {
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.succeeded()).count()
    }

    pub fn exhausted(&self) -> Vec<&BatchOutcome> {
        self.outcomes.iter().filter(|o| !o.succeeded()).collect()
    }

    pub fn total_attempts(&self) -> u64 {
        self.outcomes.iter().map(|o| u64::from(o.attempts)).sum()
    }
}

/// Handle to the outcome of one submitted batch
pub struct Submission {
    rx: oneshot::Receiver<BatchOutcome>,
}

impl Submission {
    pub async fn outcome(self) -> Result<BatchOutcome> {
        self.rx.await.map_err(|_| KgraphError::PoolClosed)
    }
}

struct Envelope {
    batch: Batch,
    attempt: u32,
    reply: Option<oneshot::Sender<BatchOutcome>>,
}

struct Shared {
    pending: AtomicUsize,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
    outcomes: std::sync::Mutex<Vec<BatchOutcome>>,
}

impl Shared {
    fn resolve(&self, envelope: Envelope, status: BatchStatus) {
        let outcome = BatchOutcome {
            batch_id: envelope.batch.id,
            kind: envelope.batch.kind(),
            len: envelope.batch.len(),
            attempts: envelope.attempt,
            status,
        };
        self.outcomes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(outcome.clone());
        if let Some(reply) = envelope.reply {
            let _ = reply.send(outcome);
        }

        // Pairs with the store/load in `close`: whichever side runs second signals.
        if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 && self.closed.load(Ordering::SeqCst) {
            self.shutdown.send_replace(true);
        }
    }
}

/// Fixed set of workers draining a bounded batch queue into a [`BatchWriter`]
pub struct WritePool {
    sender: mpsc::Sender<Envelope>,
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl WritePool {
    /// Spawn the workers. Must be called inside a tokio runtime.
    pub fn start(writer: Arc<dyn BatchWriter>, options: PoolOptions) -> Self {
        let (sender, receiver) = mpsc::channel(options.queue_capacity.max(1));
        let (shutdown, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            pending: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            shutdown,
            outcomes: std::sync::Mutex::new(Vec::new()),
        });
        let queue = Arc::new(Mutex::new(receiver));

        let workers = (0..options.workers.max(1))
            .map(|id| {
                let worker = Worker {
                    id,
                    writer: writer.clone(),
                    queue: queue.clone(),
                    requeue: sender.clone(),
                    shared: shared.clone(),
                    max_attempts: options.max_attempts.max(1),
                    backoff: options.backoff,
                };
                tokio::spawn(worker.run())
            })
            .collect();

        Self { sender, shared, workers }
    }

    /// Enqueue a batch, waiting while the queue is full
    pub async fn submit(&self, batch: Batch) -> Result<Submission> {
        let (reply, rx) = oneshot::channel();
        self.shared.pending.fetch_add(1, Ordering::SeqCst);
        let envelope = Envelope {
            batch,
            attempt: 0,
            reply: Some(reply),
        };
        if self.sender.send(envelope).await.is_err() {
            self.shared.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(KgraphError::PoolClosed);
        }
        Ok(Submission { rx })
    }

    /// Stop accepting batches and wait until every submitted batch is resolved
    pub async fn close(self) -> Result<PoolReport> {
        let WritePool { sender, shared, workers } = self;
        drop(sender);

        shared.closed.store(true, Ordering::SeqCst);
        if shared.pending.load(Ordering::SeqCst) == 0 {
            shared.shutdown.send_replace(true);
        }

        for handle in workers {
            handle
                .await
                .map_err(|e| KgraphError::Store(format!("write worker failed: {}", e)))?;
        }

        let mut outcomes = std::mem::take(&mut *shared.outcomes.lock().unwrap_or_else(PoisonError::into_inner));
        outcomes.sort_by_key(|o| o.batch_id);
        Ok(PoolReport { outcomes })
    }
}

async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|done| *done).await;
}

struct Worker {
    id: usize,
    writer: Arc<dyn BatchWriter>,
    queue: Arc<Mutex<mpsc::Receiver<Envelope>>>,
    requeue: mpsc::Sender<Envelope>,
    shared: Arc<Shared>,
    max_attempts: u32,
    backoff: Backoff,
}

impl Worker {
    async fn run(self) {
        let mut shutdown = self.shared.shutdown.subscribe();
        loop {
            let next = {
                let mut queue = self.queue.lock().await;
                tokio::select! {
                    biased;
                    _ = shutdown_requested(&mut shutdown) => None,
                    envelope = queue.recv() => envelope,
                }
            };
            let Some(envelope) = next else { break };
            self.process(envelope).await;
        }
        log::debug!("write worker {} stopped", self.id);
    }

    async fn process(&self, mut envelope: Envelope) {
        envelope.attempt += 1;
        let batch_id = envelope.batch.id;

        match self.writer.write_batch(&envelope.batch).await {
            Ok(()) => {
                log::debug!(
                    "worker {}: batch {} ({} {:?}) written on attempt {}",
                    self.id,
                    batch_id,
                    envelope.batch.len(),
                    envelope.batch.kind(),
                    envelope.attempt
                );
                self.shared.resolve(envelope, BatchStatus::Succeeded);
            }
            Err(e) if envelope.attempt < self.max_attempts => {
                let delay = self.backoff.delay(envelope.attempt);
                log::warn!(
                    "worker {}: batch {} failed (attempt {}/{}), retrying in {:?}: {}",
                    self.id,
                    batch_id,
                    envelope.attempt,
                    self.max_attempts,
                    delay,
                    e
                );
                // The sleep and re-send happen off the worker so it keeps draining;
                // a full queue cannot then deadlock workers waiting on themselves.
                let requeue = self.requeue.clone();
                let shared = self.shared.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Err(mpsc::error::SendError(envelope)) = requeue.send(envelope).await {
                        shared.resolve(
                            envelope,
                            BatchStatus::Exhausted {
                                error: "queue closed before retry".to_string(),
                            },
                        );
                    }
                });
            }
            Err(e) => {
                log::error!(
                    "batch {} ({} {:?}) abandoned after {} attempts: {}",
                    batch_id,
                    envelope.batch.len(),
                    envelope.batch.kind(),
                    envelope.attempt,
                    e
                );
                self.shared.resolve(
                    envelope,
                    BatchStatus::Exhausted {
                        error: e.to_string(),
                    },
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Node;
    use crate::ingest::batch::node_batches;
    use std::collections::HashMap;

    /// Fails each batch id a configured number of times before succeeding.
    #[derive(Default)]
    struct FlakyWriter {
        failures: HashMap<usize, u32>,
        attempts: std::sync::Mutex<HashMap<usize, u32>>,
        successes: std::sync::Mutex<Vec<usize>>,
    }

    impl FlakyWriter {
        fn failing(failures: &[(usize, u32)]) -> Self {
            Self {
                failures: failures.iter().copied().collect(),
                ..Default::default()
            }
        }

        fn attempts_for(&self, id: usize) -> u32 {
            self.attempts.lock().unwrap().get(&id).copied().unwrap_or(0)
        }
    }

    #[async_trait]
    impl BatchWriter for FlakyWriter {
        async fn write_batch(&self, batch: &Batch) -> Result<()> {
            let attempt = {
                let mut attempts = self.attempts.lock().unwrap();
                let n = attempts.entry(batch.id).or_insert(0);
                *n += 1;
                *n
            };
            tokio::task::yield_now().await;
            if attempt <= self.failures.get(&batch.id).copied().unwrap_or(0) {
                return Err(KgraphError::Store(format!("injected failure {}", attempt)));
            }
            self.successes.lock().unwrap().push(batch.id);
            Ok(())
        }
    }

    fn batches(count: usize) -> Vec<Batch> {
        let nodes = (0..count)
            .map(|i| Node { name: format!("n{}", i), label: "l".into() })
            .collect();
        node_batches(nodes, 1, 0)
    }

    fn fast_options(workers: usize, queue_capacity: usize, max_attempts: u32) -> PoolOptions {
        PoolOptions {
            workers,
            queue_capacity,
            max_attempts,
            backoff: Backoff::Fixed(Duration::from_millis(1)),
        }
    }

    async fn run_pool(writer: Arc<FlakyWriter>, options: PoolOptions, batches: Vec<Batch>) -> PoolReport {
        let pool = WritePool::start(writer, options);
        for batch in batches {
            pool.submit(batch).await.unwrap();
        }
        pool.close().await.unwrap()
    }

    #[test]
    fn test_backoff_delays() {
        let base = Duration::from_millis(100);
        assert_eq!(Backoff::Fixed(base).delay(4), base);
        assert_eq!(Backoff::Linear(base).delay(3), Duration::from_millis(300));
        let exp = Backoff::Exponential { base, max: Duration::from_millis(500) };
        assert_eq!(exp.delay(1), base);
        assert_eq!(exp.delay(3), Duration::from_millis(400));
        assert_eq!(exp.delay(4), Duration::from_millis(500));
        assert_eq!(exp.delay(40), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_retry_then_success_reported_once() {
        let writer = Arc::new(FlakyWriter::failing(&[(0, 2)]));
        let report = run_pool(writer.clone(), fast_options(2, 4, 5), batches(3)).await;

        assert_eq!(report.outcomes.len(), 3);
        assert!(report.exhausted().is_empty());
        let first = &report.outcomes[0];
        assert_eq!(first.batch_id, 0);
        assert_eq!(first.attempts, 3);
        assert!(first.succeeded());
        assert_eq!(writer.attempts_for(0), 3);
        let successes = writer.successes.lock().unwrap();
        assert_eq!(successes.iter().filter(|id| **id == 0).count(), 1);
    }

    #[tokio::test]
    async fn test_success_on_last_allowed_attempt() {
        let writer = Arc::new(FlakyWriter::failing(&[(0, 4)]));
        let report = run_pool(writer, fast_options(1, 1, 5), batches(1)).await;
        assert_eq!(report.succeeded(), 1);
        assert_eq!(report.outcomes[0].attempts, 5);
    }

    #[tokio::test]
    async fn test_exhausted_batch_does_not_block_others() {
        let writer = Arc::new(FlakyWriter::failing(&[(1, u32::MAX)]));
        let report = run_pool(writer.clone(), fast_options(2, 2, 3), batches(6)).await;

        assert_eq!(report.outcomes.len(), 6);
        assert_eq!(report.succeeded(), 5);
        let exhausted = report.exhausted();
        assert_eq!(exhausted.len(), 1);
        assert_eq!(exhausted[0].batch_id, 1);
        assert_eq!(exhausted[0].attempts, 3);
        assert!(matches!(&exhausted[0].status, BatchStatus::Exhausted { error } if error.contains("injected")));
        assert_eq!(writer.attempts_for(1), 3);
    }

    #[tokio::test]
    async fn test_retries_after_close_still_drain() {
        // Tiny queue, few workers, every batch fails once: retries keep arriving
        // after the last submit and must all be resolved before close returns.
        let failures: Vec<(usize, u32)> = (0..40).map(|id| (id, 1)).collect();
        let writer = Arc::new(FlakyWriter::failing(&failures));
        let report = run_pool(writer.clone(), fast_options(2, 1, 3), batches(40)).await;

        assert_eq!(report.outcomes.len(), 40);
        assert_eq!(report.succeeded(), 40);
        assert_eq!(report.total_attempts(), 80);
        let ids: Vec<usize> = report.outcomes.iter().map(|o| o.batch_id).collect();
        assert_eq!(ids, (0..40).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_submission_outcome() {
        let writer = Arc::new(FlakyWriter::failing(&[(0, 1)]));
        let pool = WritePool::start(writer, fast_options(1, 1, 2));
        let submission = pool.submit(batches(1).remove(0)).await.unwrap();
        let outcome = submission.outcome().await.unwrap();
        assert!(outcome.succeeded());
        assert_eq!(outcome.attempts, 2);
        let report = pool.close().await.unwrap();
        assert_eq!(report.outcomes, vec![outcome]);
    }

    /// Process-wide logger keeping the text of every `error!` record
    struct ErrorLog;

    static ERROR_LINES: std::sync::Mutex<Vec<String>> = std::sync::Mutex::new(Vec::new());
    static ERROR_LOG: ErrorLog = ErrorLog;

    impl log::Log for ErrorLog {
        fn enabled(&self, metadata: &log::Metadata) -> bool {
            metadata.level() <= log::Level::Error
        }

        fn log(&self, record: &log::Record) {
            if self.enabled(record.metadata()) {
                ERROR_LINES.lock().unwrap().push(record.args().to_string());
            }
        }

        fn flush(&self) {}
    }

    /// Fails every attempt with a fixed message
    struct AlwaysFails {
        message: &'static str,
    }

    #[async_trait]
    impl BatchWriter for AlwaysFails {
        async fn write_batch(&self, _batch: &Batch) -> Result<()> {
            Err(KgraphError::Store(self.message.to_string()))
        }
    }

    #[tokio::test]
    async fn test_exhausted_batch_logs_one_error() {
        // Other tests may log errors too; only lines carrying this message are counted
        const MESSAGE: &str = "volume detached (pool error log test)";
        let _ = log::set_logger(&ERROR_LOG);
        log::set_max_level(log::LevelFilter::Error);

        let writer = Arc::new(AlwaysFails { message: MESSAGE });
        let pool = WritePool::start(writer, fast_options(2, 1, 4));
        for batch in batches(3) {
            pool.submit(batch).await.unwrap();
        }
        let report = pool.close().await.unwrap();
        assert_eq!(report.exhausted().len(), 3);
        assert_eq!(report.total_attempts(), 12);

        let lines: Vec<String> = ERROR_LINES
            .lock()
            .unwrap()
            .iter()
            .filter(|line| line.contains(MESSAGE))
            .cloned()
            .collect();
        assert_eq!(lines.len(), 3);
        for id in 0..3 {
            let prefix = format!("batch {} ", id);
            assert_eq!(lines.iter().filter(|line| line.starts_with(&prefix)).count(), 1);
        }
    }

    #[tokio::test]
    async fn test_close_without_batches() {
        let writer = Arc::new(FlakyWriter::default());
        let pool = WritePool::start(writer, fast_options(3, 1, 1));
        let report = pool.close().await.unwrap();
        assert!(report.outcomes.is_empty());
    }
}
