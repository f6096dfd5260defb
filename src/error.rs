//! Error taxonomy and the process exit codes each category maps to.

use nix::errno::Errno;
use std::io;
use thiserror::Error;

/// Exit code for failures that fit no other category.
pub const EXIT_GENERAL: i32 = 201;
/// Exit code for bad arguments or patterns.
pub const EXIT_USAGE: i32 = 202;
/// Exit code when no password prompt showed up in time.
pub const EXIT_TIMEOUT: i32 = 203;
/// Exit code when a system call failed.
pub const EXIT_SYSTEM: i32 = 204;
/// Exit code when the prompt kept coming back after the allowed tries.
pub const EXIT_MAX_TRIES: i32 = 205;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Usage(String),

    #[error("{0}")]
    General(String),

    #[error("{context}: {source} ({})", errno_code(.source))]
    System {
        context: String,
        #[source]
        source: Errno,
    },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("can't execute: {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("not a terminal")]
    NotATty,

    #[error("tty_raw error: only part of the raw mode settings took effect")]
    PartialRawMode,

    #[error("failed to wait for ptym to be writable")]
    ChildNeverOpenedPty,

    #[error("timeout waiting for password prompt")]
    Timeout,

    #[error("still prompted for passwords after {0} tries")]
    MaxTries(u32),

    #[error("<{producer}> write: fd {fd} | wrote {written} but expected {expected}")]
    ShortWrite {
        producer: &'static str,
        fd: i32,
        written: usize,
        expected: usize,
    },

    #[error("output pipeline stopped unexpectedly: {0}")]
    PipelineClosed(String),

    #[error("child exited without a status")]
    NoExitStatus,
}

fn errno_code(errno: &Errno) -> i32 {
    *errno as i32
}

impl Error {
    pub fn sys(context: impl Into<String>, source: Errno) -> Self {
        Error::System {
            context: context.into(),
            source,
        }
    }

    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Error::Io {
            context: context.into(),
            source,
        }
    }

    /// The process exit code for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Usage(_) => EXIT_USAGE,
            Error::Timeout => EXIT_TIMEOUT,
            Error::MaxTries(_) => EXIT_MAX_TRIES,
            Error::System { .. }
            | Error::Io { .. }
            | Error::Spawn { .. }
            | Error::NotATty
            | Error::PartialRawMode
            | Error::ShortWrite { .. } => EXIT_SYSTEM,
            Error::General(_)
            | Error::ChildNeverOpenedPty
            | Error::PipelineClosed(_)
            | Error::NoExitStatus => EXIT_GENERAL,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
