use super::chunk::{Destination, Route};
use crate::error::{Error, Result};
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// How long a write may wait on a full descriptor before it counts as short.
pub const DEFAULT_STALL_LIMIT: Duration = Duration::from_secs(10);

const STALL_POLL_MS: u16 = 100;

/// Serialized access to every physical write the session performs.
///
/// Workers flush through it, and the engine uses it for the bytes it injects
/// into the PTY itself, so output to one descriptor never interleaves
/// mid-write. It also remembers the first fatal write failure.
///
/// A write that hits a full non-blocking descriptor gives the lock up while
/// it waits, so the other destinations keep moving. If the descriptor stays
/// full for longer than the stall limit the write fails as short.
#[derive(Clone, Default)]
pub struct Writer {
    shared: Arc<Shared>,
}

struct Shared {
    lock: Mutex<()>,
    failure: Mutex<Option<Error>>,
    stall_limit: Duration,
}

impl Default for Shared {
    fn default() -> Self {
        Self {
            lock: Mutex::new(()),
            failure: Mutex::new(None),
            stall_limit: DEFAULT_STALL_LIMIT,
        }
    }
}

type Slot<'a> = Option<MutexGuard<'a, ()>>;

impl Writer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stall_limit(stall_limit: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                stall_limit,
                ..Shared::default()
            }),
        }
    }

    /// Write all of `bytes` to `dest`.
    pub fn write_to(&self, producer: &'static str, dest: Destination, bytes: &[u8]) -> Result<()> {
        let mut slot = Some(self.lock());
        self.write_all(&mut slot, producer, dest, bytes)
    }

    /// Write several byte strings to `dest` back to back, with nothing else
    /// written to any destination in between unless `dest` stalls.
    pub fn write_parts(&self, producer: &'static str, dest: Destination, parts: &[&[u8]]) -> Result<()> {
        let mut slot = Some(self.lock());
        for part in parts {
            self.write_all(&mut slot, producer, dest, part)?;
        }
        Ok(())
    }

    /// Write `bytes` to the visible destination of `route` and then to its
    /// transcript, as one unit.
    pub fn write_route(&self, producer: &'static str, route: Route, bytes: &[u8]) -> Result<()> {
        let mut slot = Some(self.lock());
        self.write_route_locked(&mut slot, producer, route, bytes)
    }

    /// Write a batch of routed segments under a single acquisition of the lock.
    pub(crate) fn write_batch<'a, I>(&self, segments: I) -> Result<()>
    where
        I: IntoIterator<Item = (&'static str, Route, &'a [u8])>,
    {
        let mut slot = Some(self.lock());
        for (producer, route, bytes) in segments {
            self.write_route_locked(&mut slot, producer, route, bytes)?;
        }
        Ok(())
    }

    /// Record a fatal failure. Only the first one is kept.
    pub fn fail(&self, err: Error) {
        let mut failure = self.shared.failure.lock().unwrap_or_else(PoisonError::into_inner);
        if failure.is_none() {
            warn!("output pipeline failed: {err}");
            *failure = Some(err);
        }
    }

    /// Take the recorded failure, if any.
    pub fn take_failure(&self) -> Option<Error> {
        self.shared
            .failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        // The lock guards no data, so a poisoned lock is still usable.
        self.shared.lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_route_locked<'s>(
        &'s self,
        slot: &mut Slot<'s>,
        producer: &'static str,
        route: Route,
        bytes: &[u8],
    ) -> Result<()> {
        self.write_all(slot, producer, route.visible, bytes)?;
        if let Some(transcript) = route.transcript {
            self.write_all(slot, producer, transcript, bytes)?;
        }
        Ok(())
    }

    fn write_all<'s>(
        &'s self,
        slot: &mut Slot<'s>,
        producer: &'static str,
        dest: Destination,
        bytes: &[u8],
    ) -> Result<()> {
        let fd = dest.borrow();
        let short = |written| Error::ShortWrite {
            producer,
            fd: dest.fd(),
            written,
            expected: bytes.len(),
        };
        let mut written = 0;
        let mut stalled = Duration::ZERO;
        while written < bytes.len() {
            if slot.is_none() {
                *slot = Some(self.lock());
            }
            match nix::unistd::write(fd, &bytes[written..]) {
                Ok(0) => return Err(short(written)),
                Ok(n) => {
                    written += n;
                    stalled = Duration::ZERO;
                }
                Err(Errno::EINTR) => continue,
                Err(Errno::EAGAIN) => {
                    if stalled >= self.shared.stall_limit {
                        debug!(producer, fd = dest.fd(), ?stalled, "destination stayed full");
                        return Err(short(written));
                    }
                    *slot = None;
                    let started = Instant::now();
                    let mut fds = [PollFd::new(fd, PollFlags::POLLOUT)];
                    match poll(&mut fds, PollTimeout::from(STALL_POLL_MS)) {
                        Ok(_) | Err(Errno::EINTR) => stalled += started.elapsed(),
                        Err(e) => return Err(Error::sys(format!("<{producer}> poll"), e)),
                    }
                }
                Err(e) if written > 0 => {
                    trace!(producer, fd = dest.fd(), "write failed after {written} bytes: {e}");
                    return Err(short(written));
                }
                Err(e) => return Err(Error::sys(format!("<{producer}> write: fd {}", dest.fd()), e)),
            }
        }
        Ok(())
    }
}
