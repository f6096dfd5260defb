//! Output fan-out pipeline.
//!
//! The engine submits every chunk it reads to a small pool of worker threads.
//! Each worker owns a bounded queue and a private buffer, batches what it
//! receives and writes it out under the pipeline-wide [`Writer`] lock once a
//! byte or line threshold is crossed (or the queue runs dry). A coordinator
//! thread handles shutdown: once the producer is done it closes the intake,
//! waits for every worker to drain, and reports their statistics.
//!
//! Chunks that share a destination pair always go to the same worker, so the
//! bytes reaching any one descriptor keep their submission order.

mod chunk;
mod worker;
mod writer;

pub use chunk::{Chunk, Destination, Route};
pub use worker::WorkerStats;
pub use writer::{DEFAULT_STALL_LIMIT, Writer};

use crate::error::{Error, Result};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use worker::{Worker, WorkerBuffer};

const QUEUE_CAPACITY: usize = 1000;
const BASE_BYTE_THRESHOLD: usize = 256 * 1024;
const LINE_THRESHOLD: usize = 1000;

/// Tuning for one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSpec {
    pub queue_capacity: usize,
    /// Flush once more than this many bytes are pending.
    pub byte_threshold: usize,
    /// Flush once more than this many lines are pending.
    pub line_threshold: usize,
}

/// Worker pool layout.
///
/// Each distinct destination pair is pinned to one worker, round-robin in
/// the order the pairs are first submitted. A session only ever produces two
/// pairs (child output to the terminal, user input to the PTY), so with the
/// default three workers the third one never receives a chunk. It is still
/// started and drained like the others.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    pub workers: Vec<WorkerSpec>,
    /// Flush as soon as a worker's queue is empty instead of waiting for a
    /// threshold.
    pub idle_flush: bool,
    /// How long a write may wait on a full destination before failing.
    pub write_stall_limit: Duration,
}

impl PipelineConfig {
    /// `count` workers whose byte thresholds double from one to the next.
    pub fn graduated(
        count: usize,
        queue_capacity: usize,
        base_byte_threshold: usize,
        line_threshold: usize,
    ) -> Self {
        Self {
            workers: (0..count)
                .map(|i| WorkerSpec {
                    queue_capacity,
                    byte_threshold: base_byte_threshold << i,
                    line_threshold,
                })
                .collect(),
            idle_flush: true,
            write_stall_limit: DEFAULT_STALL_LIMIT,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.workers.is_empty() {
            return Err(Error::General("output pipeline needs at least one worker".into()));
        }
        if self.workers.iter().any(|w| w.queue_capacity == 0) {
            return Err(Error::General("worker queue capacity must be positive".into()));
        }
        Ok(())
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::graduated(3, QUEUE_CAPACITY, BASE_BYTE_THRESHOLD, LINE_THRESHOLD)
    }
}

/// What each worker handled, in worker order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineReport {
    pub workers: Vec<WorkerStats>,
}

impl PipelineReport {
    pub fn total_bytes(&self) -> u64 {
        self.workers.iter().map(|w| w.bytes).sum()
    }

    pub fn total_chunks(&self) -> u64 {
        self.workers.iter().map(|w| w.chunks).sum()
    }
}

type Intake = Arc<Mutex<Option<Vec<mpsc::Sender<Chunk>>>>>;

pub struct Pipeline {
    intake: Intake,
    /// Destination pairs in the order they were first seen.
    routes: Vec<Route>,
    writer: Writer,
    buffers: Vec<Arc<Mutex<WorkerBuffer>>>,
    producer_done: Option<oneshot::Sender<()>>,
    stopped: Option<oneshot::Receiver<PipelineReport>>,
    threads: Vec<JoinHandle<()>>,
}

impl Pipeline {
    /// Start the workers and the coordinator.
    pub fn start(config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        let writer = Writer::with_stall_limit(config.write_stall_limit);
        let mut senders = Vec::with_capacity(config.workers.len());
        let mut buffers = Vec::with_capacity(config.workers.len());
        let mut workers_done = Vec::with_capacity(config.workers.len());
        let mut threads = Vec::with_capacity(config.workers.len() + 1);

        for (id, spec) in config.workers.iter().copied().enumerate() {
            let (tx, rx) = mpsc::channel(spec.queue_capacity);
            let (done_tx, done_rx) = oneshot::channel();
            let buffer = Arc::new(Mutex::new(WorkerBuffer::default()));
            let worker = Worker {
                id,
                spec,
                idle_flush: config.idle_flush,
                queue: rx,
                buffer: Arc::clone(&buffer),
                writer: writer.clone(),
            };
            let handle = thread::Builder::new()
                .name(format!("passh-worker-{id}"))
                .spawn(move || worker.run(done_tx))
                .map_err(|e| Error::io("failed to start output worker", e))?;

            senders.push(tx);
            buffers.push(buffer);
            workers_done.push(done_rx);
            threads.push(handle);
        }

        let intake: Intake = Arc::new(Mutex::new(Some(senders)));
        let (producer_done_tx, producer_done_rx) = oneshot::channel();
        let (stopped_tx, stopped_rx) = oneshot::channel();
        let coordinator_intake = Arc::clone(&intake);
        let handle = thread::Builder::new()
            .name("passh-coordinator".into())
            .spawn(move || {
                coordinate(coordinator_intake, producer_done_rx, workers_done, stopped_tx)
            })
            .map_err(|e| Error::io("failed to start output coordinator", e))?;
        threads.push(handle);

        debug!(workers = config.workers.len(), "output pipeline started");
        Ok(Self {
            intake,
            routes: Vec::new(),
            writer,
            buffers,
            producer_done: Some(producer_done_tx),
            stopped: Some(stopped_rx),
            threads,
        })
    }

    /// Handle for writes that bypass the queues but must not interleave with
    /// flushed output.
    pub fn writer(&self) -> Writer {
        self.writer.clone()
    }

    /// Queue a chunk. Blocks while the target worker's queue is full.
    pub fn submit(&mut self, chunk: Chunk) -> Result<()> {
        if chunk.is_empty() {
            return Ok(());
        }
        if let Some(err) = self.writer.take_failure() {
            return Err(err);
        }

        let slot = self.slot_for(chunk.route());
        let sender = self
            .intake
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(|senders| senders.get(slot).cloned());
        let Some(sender) = sender else {
            return Err(Error::PipelineClosed("intake is closed".into()));
        };

        sender.blocking_send(chunk).map_err(|_| {
            self.writer
                .take_failure()
                .unwrap_or_else(|| Error::PipelineClosed(format!("worker {slot} stopped")))
        })
    }

    fn slot_for(&mut self, route: Route) -> usize {
        let index = match self.routes.iter().position(|r| *r == route) {
            Some(index) => index,
            None => {
                self.routes.push(route);
                self.routes.len() - 1
            }
        };
        index % self.buffers.len()
    }

    /// Tell the coordinator no more chunks are coming.
    pub fn request_shutdown(&mut self) {
        if let Some(done) = self.producer_done.take() {
            debug!("output pipeline shutdown requested");
            let _ = done.send(());
        }
    }

    /// Wait until every worker has flushed and exited.
    ///
    /// Returns the first write failure any worker hit, if there was one.
    pub fn await_shutdown(&mut self) -> Result<PipelineReport> {
        self.request_shutdown();
        let stopped = self
            .stopped
            .take()
            .ok_or_else(|| Error::PipelineClosed("already shut down".into()))?;
        let report = stopped
            .blocking_recv()
            .map_err(|_| Error::PipelineClosed("coordinator exited without a report".into()));

        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                self.writer
                    .fail(Error::PipelineClosed("output thread panicked".into()));
            }
        }
        if let Some(err) = self.writer.take_failure() {
            return Err(err);
        }
        let report = report?;
        debug!(
            bytes = report.total_bytes(),
            chunks = report.total_chunks(),
            "output pipeline stopped"
        );
        Ok(report)
    }

    /// Current per-worker counters.
    pub fn stats(&self) -> Vec<WorkerStats> {
        self.buffers
            .iter()
            .map(|b| b.lock().unwrap_or_else(PoisonError::into_inner).stats())
            .collect()
    }

    /// True once every worker has written everything and stopped.
    pub fn is_drained(&self) -> bool {
        self.buffers.iter().all(|b| {
            let buffer = b.lock().unwrap_or_else(PoisonError::into_inner);
            buffer.is_closed() && buffer.pending_bytes() == 0
        })
    }
}

fn coordinate(
    intake: Intake,
    producer_done: oneshot::Receiver<()>,
    workers_done: Vec<oneshot::Receiver<WorkerStats>>,
    stopped: oneshot::Sender<PipelineReport>,
) {
    // A dropped pipeline counts as done too.
    let _ = producer_done.blocking_recv();

    // Dropping the senders lets each worker drain its queue and exit.
    let senders = intake.lock().unwrap_or_else(PoisonError::into_inner).take();
    drop(senders);

    let mut report = PipelineReport::default();
    for (id, done) in workers_done.into_iter().enumerate() {
        match done.blocking_recv() {
            Ok(stats) => report.workers.push(stats),
            Err(_) => {
                warn!(worker = id, "worker exited without reporting");
                report.workers.push(WorkerStats::default());
            }
        }
    }
    let _ = stopped.send(report);
}
