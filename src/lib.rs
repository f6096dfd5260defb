//! # passh
//!
//! Run a command inside a pseudo-terminal and type its passwords for it.
//!
//! passh starts the command on the slave side of a fresh PTY, relays
//! everything between the user's terminal and the command, and watches the
//! command's output for a password prompt. When the prompt shows up, the
//! configured password is typed in, followed by a carriage return. It can
//! also answer `(yes/no)?` questions such as ssh's host key confirmation.
//!
//! ## Quick start
//!
//! ```no_run
//! use passh::{SessionConfig, resolve_password, session};
//!
//! fn main() -> passh::Result<()> {
//!     let mut config = SessionConfig::new(vec!["ssh".into(), "user@host".into()])?;
//!     config.password = resolve_password("env:SSH_PASSWORD")?;
//!     config.max_tries = Some(1);
//!     config.fatal_on_max_tries = true;
//!
//!     let code = session::run(&config)?;
//!     std::process::exit(code);
//! }
//! ```
//!
//! ## Prompts
//!
//! Prompt patterns use POSIX basic regular expression syntax, as `grep` does.
//! See [`PromptMatcher`] for details. The defaults are:
//!
//! | Prompt | Pattern |
//! |--------|---------|
//! | password | `[Pp]assword: \{0,1\}$` |
//! | yes/no | `(yes/no)? \{0,1\}$` |
//!
//! ## Exit status
//!
//! A finished session reports the command's own exit status, or `128 + N`
//! when it was killed by signal `N`. passh's own failures use the codes in
//! [`error`]: 201 general, 202 usage, 203 prompt timeout, 204 system error,
//! 205 too many password prompts.
//!
//! ## Output
//!
//! Everything read from the PTY goes through the [`fanout`] pipeline, a small
//! pool of buffering worker threads, so slow destinations never hold up the
//! loop that watches for prompts.

pub mod config;
pub mod engine;
pub mod error;
pub mod fanout;
pub mod prompt;
pub mod pty;
pub mod responder;
pub mod session;
pub mod signals;
pub mod terminal;

pub use config::{SessionConfig, parse_timeout, resolve_password};
pub use engine::{Engine, EngineOptions, Phase, Sinks};
pub use error::{Error, Result};
pub use fanout::{Chunk, Destination, Pipeline, PipelineConfig, PipelineReport, WorkerSpec};
pub use prompt::PromptMatcher;
pub use pty::PtySession;
pub use responder::{PromptCache, Reply, Responder};
pub use terminal::RawModeGuard;
