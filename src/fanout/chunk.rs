use std::os::fd::{AsRawFd, BorrowedFd, RawFd};

/// A descriptor the pipeline writes to.
///
/// The pipeline does not own the descriptor: whoever hands it in keeps it
/// open until [`Pipeline::await_shutdown`](super::Pipeline::await_shutdown)
/// has returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Destination {
    fd: RawFd,
}

impl Destination {
    pub fn new(fd: RawFd) -> Self {
        Self { fd }
    }

    pub fn of(fd: &impl AsRawFd) -> Self {
        Self::new(fd.as_raw_fd())
    }

    pub fn stdout() -> Self {
        Self::new(libc::STDOUT_FILENO)
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub(crate) fn borrow(&self) -> BorrowedFd<'_> {
        // SAFETY: see the type-level contract; the fd outlives the pipeline.
        unsafe { BorrowedFd::borrow_raw(self.fd) }
    }
}

/// Where a chunk's bytes end up: one visible destination plus an optional
/// transcript that receives an identical copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Route {
    pub visible: Destination,
    pub transcript: Option<Destination>,
}

/// Bytes captured from one read, on their way to their destinations.
#[derive(Debug)]
pub struct Chunk {
    producer: &'static str,
    bytes: Vec<u8>,
    route: Route,
}

impl Chunk {
    pub fn new(
        producer: &'static str,
        bytes: impl Into<Vec<u8>>,
        visible: Destination,
        transcript: Option<Destination>,
    ) -> Self {
        Self {
            producer,
            bytes: bytes.into(),
            route: Route {
                visible,
                transcript,
            },
        }
    }

    pub fn producer(&self) -> &'static str {
        self.producer
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn route(&self) -> Route {
        self.route
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn line_count(&self) -> usize {
        self.bytes.iter().filter(|&&b| b == b'\n').count()
    }

    pub(crate) fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}
