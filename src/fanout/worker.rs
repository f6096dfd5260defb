use super::WorkerSpec;
use super::chunk::{Chunk, Route};
use super::writer::Writer;
use crate::error::{Error, Result};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc::Receiver;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::oneshot;
use tracing::{debug, trace};

/// Counters a worker keeps about the traffic it handled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub bytes: u64,
    pub chunks: u64,
    pub lines: u64,
    pub flushes: u64,
}

struct Segment {
    producer: &'static str,
    route: Route,
    bytes: Vec<u8>,
}

/// Bytes a worker has accepted but not yet written.
#[derive(Default)]
pub(crate) struct WorkerBuffer {
    segments: Vec<Segment>,
    pending_bytes: usize,
    pending_lines: usize,
    stats: WorkerStats,
    closed: bool,
}

impl WorkerBuffer {
    /// Whole chunks only: a chunk is never split across two flushes.
    fn append(&mut self, chunk: Chunk) {
        let lines = chunk.line_count();
        let len = chunk.len();
        let producer = chunk.producer();
        let route = chunk.route();

        match self.segments.last_mut() {
            Some(last) if last.route == route && last.producer == producer => {
                last.bytes.extend_from_slice(chunk.bytes());
            }
            _ => self.segments.push(Segment {
                producer,
                route,
                bytes: chunk.into_bytes(),
            }),
        }

        self.pending_bytes += len;
        self.pending_lines += lines;
        self.stats.bytes += len as u64;
        self.stats.lines += lines as u64;
        self.stats.chunks += 1;
    }

    fn over_threshold(&self, spec: &WorkerSpec) -> bool {
        self.pending_bytes > spec.byte_threshold || self.pending_lines > spec.line_threshold
    }

    fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Hand out everything pending and start over with an empty buffer.
    fn take(&mut self) -> Result<Vec<Segment>> {
        if self.closed {
            return Err(Error::PipelineClosed("flush on a closed worker buffer".into()));
        }
        self.pending_bytes = 0;
        self.pending_lines = 0;
        self.stats.flushes += 1;
        Ok(std::mem::take(&mut self.segments))
    }

    pub(crate) fn stats(&self) -> WorkerStats {
        self.stats
    }

    pub(crate) fn pending_bytes(&self) -> usize {
        self.pending_bytes
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed
    }
}

pub(crate) struct Worker {
    pub(crate) id: usize,
    pub(crate) spec: WorkerSpec,
    pub(crate) idle_flush: bool,
    pub(crate) queue: Receiver<Chunk>,
    pub(crate) buffer: Arc<Mutex<WorkerBuffer>>,
    pub(crate) writer: Writer,
}

impl Worker {
    /// Consume the queue until it is closed and drained, then report.
    pub(crate) fn run(mut self, done: oneshot::Sender<WorkerStats>) {
        debug!(worker = self.id, "worker started");
        if let Err(e) = self.consume() {
            // Closing the queue makes the producer's next submit fail.
            self.queue.close();
            self.writer.fail(e);
        }
        let stats = match self.lock() {
            Ok(mut buffer) => {
                buffer.closed = true;
                buffer.stats()
            }
            Err(_) => WorkerStats::default(),
        };
        debug!(worker = self.id, ?stats, "worker stopped");
        let _ = done.send(stats);
    }

    fn consume(&mut self) -> Result<()> {
        while let Some(chunk) = self.queue.blocking_recv() {
            self.accept(chunk)?;
            loop {
                match self.queue.try_recv() {
                    Ok(chunk) => self.accept(chunk)?,
                    Err(TryRecvError::Empty) => {
                        // Nothing else queued: flush what we have so
                        // interactive output does not sit in the buffer.
                        if self.idle_flush {
                            self.flush()?;
                        }
                        break;
                    }
                    Err(TryRecvError::Disconnected) => break,
                }
            }
        }
        self.flush()
    }

    fn accept(&self, chunk: Chunk) -> Result<()> {
        let ready = {
            let mut buffer = self.lock()?;
            buffer.append(chunk);
            if buffer.over_threshold(&self.spec) {
                Some(buffer.take()?)
            } else {
                None
            }
        };
        match ready {
            Some(segments) => self.write(segments),
            None => Ok(()),
        }
    }

    fn flush(&self) -> Result<()> {
        let ready = {
            let mut buffer = self.lock()?;
            if buffer.is_empty() {
                return Ok(());
            }
            buffer.take()?
        };
        self.write(ready)
    }

    fn write(&self, segments: Vec<Segment>) -> Result<()> {
        trace!(worker = self.id, segments = segments.len(), "flushing");
        self.writer.write_batch(
            segments
                .iter()
                .map(|s| (s.producer, s.route, s.bytes.as_slice())),
        )
    }

    fn lock(&self) -> Result<MutexGuard<'_, WorkerBuffer>> {
        self.buffer
            .lock()
            .map_err(|_| Error::PipelineClosed(format!("worker {} buffer poisoned", self.id)))
    }
}
