//! One passh run, from terminal setup to teardown.

use crate::config::SessionConfig;
use crate::engine::{Engine, EngineOptions, Sinks};
use crate::error::{Error, Result};
use crate::fanout::{Destination, Pipeline};
use crate::pty::{PtySession, SlaveSettings};
use crate::signals;
use crate::terminal::{self, RawModeGuard};
use nix::sys::termios::tcgetattr;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::AsFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use tracing::{debug, info, warn};

/// Run the configured command under a PTY and return its exit code.
///
/// The user's terminal is put into raw mode only when both standard input
/// and standard output are terminals, and is restored before this returns,
/// whether the run succeeded or not.
pub fn run(config: &SessionConfig) -> Result<i32> {
    let stdin = io::stdin();
    let stdout = io::stdout();
    let stdin_is_tty = terminal::is_terminal(stdin.as_fd());
    let raw_mode = stdin_is_tty && terminal::is_terminal(stdout.as_fd());

    signals::watch_child()?;

    // The child's terminal starts out looking like ours.
    let slave = if stdin_is_tty {
        let termios =
            tcgetattr(stdin.as_fd()).map_err(|e| Error::sys("tcgetattr error on stdin", e))?;
        let winsize = terminal::window_size(stdin.as_fd())?;
        Some(SlaveSettings { termios, winsize })
    } else {
        None
    };

    let sent_log = config.log_to_pty.as_deref().map(open_transcript).transpose()?;
    let received_log = config
        .log_from_pty
        .as_deref()
        .map(open_transcript)
        .transpose()?;

    let pty = PtySession::spawn(&config.command, slave.as_ref(), config.nohup_child)?;

    let mut guard = if raw_mode {
        let guard = RawModeGuard::enter(stdin.as_fd())?;
        signals::watch_window_changes()?;
        Some(guard)
    } else {
        None
    };
    signals::watch_termination()?;

    let mut pipeline = Pipeline::start(config.pipeline.clone())?;
    let sinks = Sinks {
        terminal: Destination::stdout(),
        sent: sent_log.as_ref().map(Destination::of),
        received: received_log.as_ref().map(Destination::of),
    };
    let options = EngineOptions {
        poll_stdin: stdin_is_tty,
        track_window: raw_mode,
        forward_termination: true,
        ..EngineOptions::default()
    };
    let result = Engine::new(config, &pty, &mut pipeline, sinks, options).run();

    // On failure the engine never reached its own drain; still write out
    // what was captured before giving the terminal back.
    if result.is_err()
        && let Err(e) = pipeline.await_shutdown()
    {
        debug!("pipeline shutdown after failure: {e}");
    }

    if let Some(guard) = guard.as_mut()
        && let Err(e) = guard.restore()
    {
        warn!("{e}");
    }
    drop(sent_log);
    drop(received_log);

    match &result {
        Ok(code) => info!(code, program = %config.program(), "session finished"),
        Err(e) => debug!("session failed: {e}"),
    }
    result
}

/// Create or truncate a transcript file, readable by the owner only.
fn open_transcript(path: &Path) -> Result<File> {
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .map_err(|e| Error::io(format!("open: {}", path.display()), e))
}
