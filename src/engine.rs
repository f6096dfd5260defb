use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::fanout::{Chunk, Destination, Pipeline, Route, Writer};
use crate::pty::{ChildState, PtySession, ReadOutcome};
use crate::responder::{Reply, Responder};
use crate::signals;
use crate::terminal;
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use secrecy::{ExposeSecret, SecretString};
use std::os::fd::BorrowedFd;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

const BUFFSIZE: usize = 8192;
const POLL_TIMEOUT_MS: u16 = 1100;
const EOF_INTERVAL_MS: u16 = 50;
const EOF_INTERVAL: Duration = Duration::from_millis(EOF_INTERVAL_MS as u64);
const YES_REPLY: &[u8] = b"yes\r";
const PASSWORD_MASK: &[u8] = b"********\r";

/// Where the engine sends what it relays.
#[derive(Debug, Clone, Copy)]
pub struct Sinks {
    /// Receives the child's output; normally standard output.
    pub terminal: Destination,
    /// Transcript of everything written to the child.
    pub sent: Option<Destination>,
    /// Transcript of everything the child wrote.
    pub received: Option<Destination>,
}

impl Default for Sinks {
    fn default() -> Self {
        Self {
            terminal: Destination::stdout(),
            sent: None,
            received: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EngineOptions {
    /// Relay standard input to the child. Only done when it is a terminal.
    pub poll_stdin: bool,
    /// Copy the terminal size to the child on SIGWINCH.
    pub track_window: bool,
    /// Pass SIGTERM, SIGHUP and SIGINT received by passh on to the child.
    pub forward_termination: bool,
    /// One-second waits allowed for the child to open its side of the PTY.
    pub startup_retries: u32,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            poll_stdin: false,
            track_window: false,
            forward_termination: false,
            startup_retries: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    WaitingForChildPtyOpen,
    Running,
    DrainingAfterExit,
    Done,
}

#[derive(Debug, Default)]
struct Readiness {
    master: bool,
    stdin: bool,
    timed_out: bool,
}

/// The multiplexing loop between the user's terminal and the child.
pub struct Engine<'s> {
    pty: &'s PtySession,
    input: BorrowedFd<'s>,
    pipeline: &'s mut Pipeline,
    writer: Writer,
    responder: Responder,
    password: &'s SecretString,
    master: Destination,
    sinks: Sinks,
    options: EngineOptions,
    phase: Phase,
    stdin_eof: bool,
    master_hung_up: bool,
    last_eof: Option<Instant>,
    exit_code: Option<i32>,
    buf: Vec<u8>,
}

impl<'s> Engine<'s> {
    pub fn new(
        config: &'s SessionConfig,
        pty: &'s PtySession,
        pipeline: &'s mut Pipeline,
        sinks: Sinks,
        options: EngineOptions,
    ) -> Self {
        Engine {
            pty,
            // SAFETY: standard input stays open for the life of the process.
            input: unsafe { BorrowedFd::borrow_raw(libc::STDIN_FILENO) },
            writer: pipeline.writer(),
            pipeline,
            responder: Responder::new(config, Instant::now()),
            password: &config.password,
            master: Destination::new(pty.master_raw()),
            sinks,
            options,
            phase: Phase::WaitingForChildPtyOpen,
            stdin_eof: false,
            master_hung_up: false,
            last_eof: None,
            exit_code: None,
            buf: vec![0; BUFFSIZE],
        }
    }

    /// Read the user's keystrokes, and the window size, from `input`
    /// instead of standard input.
    pub fn with_input(mut self, input: BorrowedFd<'s>) -> Self {
        self.input = input;
        self
    }

    /// Run until the child is gone and all output is written.
    ///
    /// Returns the child's exit code, or `128 + signo` if it was killed.
    pub fn run(&mut self) -> Result<i32> {
        while self.phase != Phase::Done {
            let next = match self.phase {
                Phase::WaitingForChildPtyOpen => {
                    self.pty.wait_until_writable(self.options.startup_retries)?;
                    Phase::Running
                }
                Phase::Running => self.step()?,
                Phase::DrainingAfterExit => {
                    self.drain()?;
                    Phase::Done
                }
                Phase::Done => Phase::Done,
            };
            if next != self.phase {
                debug!(from = ?self.phase, to = ?next, "engine phase change");
                self.phase = next;
            }
        }
        self.finish()
    }

    /// One pass of the main loop.
    fn step(&mut self) -> Result<Phase> {
        if let Some(next) = self.handle_signals()? {
            return Ok(next);
        }

        let now = Instant::now();
        self.responder.check_timeout(now)?;

        if self.stdin_eof && !self.forward_eof(now) {
            return Ok(Phase::DrainingAfterExit);
        }

        let ready = self.wait_for_input()?;
        if ready.master
            && let Some(next) = self.relay_master()?
        {
            return Ok(next);
        }
        if ready.stdin {
            self.relay_stdin()?;
        }
        if ready.timed_out
            && let Some(next) = self.reap()?
        {
            return Ok(next);
        }
        Ok(Phase::Running)
    }

    fn handle_signals(&mut self) -> Result<Option<Phase>> {
        if self.options.forward_termination
            && let Some(signal) = signals::take_termination()
        {
            info!(?signal, "forwarding signal to child");
            self.pty.signal(signal)?;
        }
        if self.options.track_window && signals::take_window_changed() {
            if let Err(e) = terminal::propagate_window_size(self.input, self.pty.master()) {
                warn!("failed to propagate window size: {e}");
            }
        }
        if signals::take_child_changed() {
            return self.reap();
        }
        Ok(None)
    }

    /// Collect the child's status if it has finished.
    fn reap(&mut self) -> Result<Option<Phase>> {
        match self.pty.try_reap()? {
            ChildState::Running => Ok(None),
            state => {
                info!(pid = %self.pty.pid(), ?state, "child finished");
                self.exit_code = state.exit_code();
                Ok(Some(Phase::DrainingAfterExit))
            }
        }
    }

    /// A child that closed the PTY, or whose input has ended, is about to
    /// go away, so check on it often.
    fn poll_timeout(&self) -> u16 {
        if self.stdin_eof || self.master_hung_up {
            EOF_INTERVAL_MS
        } else {
            POLL_TIMEOUT_MS
        }
    }

    fn wait_for_input(&self) -> Result<Readiness> {
        let poll_master = !self.master_hung_up;
        let poll_stdin = self.options.poll_stdin && !self.stdin_eof;

        let mut fds = Vec::with_capacity(2);
        if poll_master {
            fds.push(PollFd::new(self.pty.master(), PollFlags::POLLIN));
        }
        if poll_stdin {
            fds.push(PollFd::new(self.input, PollFlags::POLLIN));
        }

        match poll(&mut fds, PollTimeout::from(self.poll_timeout())) {
            Ok(0) => Ok(Readiness {
                timed_out: true,
                ..Readiness::default()
            }),
            Ok(_) => Ok(Readiness {
                master: poll_master && fds.first().is_some_and(has_input),
                stdin: poll_stdin && fds.last().is_some_and(has_input),
                timed_out: false,
            }),
            Err(Errno::EINTR) => Ok(Readiness::default()),
            Err(e) => Err(Error::sys("poll error", e)),
        }
    }

    /// Relay everything the child has written so far, answering prompts.
    fn relay_master(&mut self) -> Result<Option<Phase>> {
        loop {
            match self.pty.read_available(&mut self.buf)? {
                ReadOutcome::Data(n) => {
                    trace!(bytes = n, "read from pty");
                    self.pipeline.submit(Chunk::new(
                        "pty",
                        &self.buf[..n],
                        self.sinks.terminal,
                        self.sinks.received,
                    ))?;
                    if let Some(reply) = self.responder.on_output(&self.buf[..n], Instant::now())? {
                        self.answer(reply)?;
                    }
                }
                ReadOutcome::WouldBlock => return Ok(None),
                ReadOutcome::Closed => {
                    if !self.master_hung_up {
                        debug!("pty master hung up");
                        self.master_hung_up = true;
                    }
                    return self.reap();
                }
            }
        }
    }

    fn answer(&self, reply: Reply) -> Result<()> {
        match reply {
            Reply::Yes => {
                info!("answering yes/no prompt");
                let route = Route {
                    visible: self.master,
                    transcript: self.sinks.sent,
                };
                self.writer.write_route("yes_no", route, YES_REPLY)
            }
            Reply::Password => {
                info!(seen = self.responder.passwords_seen(), "sending password");
                self.writer.write_parts(
                    "password",
                    self.master,
                    &[self.password.expose_secret().as_bytes(), b"\r"],
                )?;
                match self.sinks.sent {
                    Some(log) => self.writer.write_to("password", log, PASSWORD_MASK),
                    None => Ok(()),
                }
            }
        }
    }

    fn relay_stdin(&mut self) -> Result<()> {
        match nix::unistd::read(self.input, &mut self.buf) {
            Ok(0) => {
                debug!("end of input, forwarding EOF to child");
                self.stdin_eof = true;
                Ok(())
            }
            Ok(n) => {
                self.responder.mark_interactive();
                self.pipeline.submit(Chunk::new(
                    "stdin",
                    &self.buf[..n],
                    self.master,
                    self.sinks.sent,
                ))
            }
            Err(Errno::EINTR | Errno::EAGAIN) => Ok(()),
            Err(e) => Err(Error::sys("read error from stdin", e)),
        }
    }

    /// Keep typing the EOF character until the child exits. Closing the
    /// master instead would hang the child up.
    ///
    /// Returns false when the PTY can no longer take it.
    fn forward_eof(&mut self, now: Instant) -> bool {
        let Some(last) = self.last_eof else {
            self.last_eof = Some(now);
            return true;
        };
        if now.saturating_duration_since(last) < EOF_INTERVAL {
            return true;
        }
        self.last_eof = Some(now);

        let eof = match self.pty.eof_char() {
            Ok(eof) => eof,
            Err(e) => {
                debug!("cannot read EOF character: {e}");
                return false;
            }
        };
        if let Err(e) = self.writer.write_to("eof", self.master, &[eof]) {
            debug!("cannot send EOF: {e}");
            return false;
        }
        if let Some(log) = self.sinks.sent
            && let Err(e) = self.writer.write_to("eof", log, &[eof])
        {
            warn!("failed to log EOF: {e}");
        }
        true
    }

    /// Pick up whatever output the child left behind, then stop the pipeline.
    fn drain(&mut self) -> Result<()> {
        loop {
            match self.pty.read_available(&mut self.buf) {
                Ok(ReadOutcome::Data(n)) => {
                    self.pipeline.submit(Chunk::new(
                        "drain",
                        &self.buf[..n],
                        self.sinks.terminal,
                        self.sinks.received,
                    ))?;
                }
                Ok(_) => break,
                Err(e) => {
                    debug!("stopped draining pty: {e}");
                    break;
                }
            }
        }
        self.pipeline.request_shutdown();
        let report = self.pipeline.await_shutdown()?;
        debug!(?report, "output drained");
        Ok(())
    }

    fn finish(&mut self) -> Result<i32> {
        if self.exit_code.is_none() {
            self.exit_code = self.pty.try_reap()?.exit_code();
        }
        self.exit_code.ok_or(Error::NoExitStatus)
    }
}

fn has_input(fd: &PollFd<'_>) -> bool {
    fd.revents().is_some_and(|r| {
        r.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR)
    })
}
