//! Session configuration and the helpers that build it from user input.
//!
//! The command-line front end turns its arguments into a [`SessionConfig`]
//! through [`resolve_password`], [`parse_timeout`] and
//! [`PromptMatcher::compile`](crate::prompt::PromptMatcher::compile).

use crate::error::{Error, Result};
use crate::fanout::PipelineConfig;
use crate::prompt::PromptMatcher;
use secrecy::SecretString;
use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_PASSWORD: &str = "password";
pub const DEFAULT_PROMPT: &str = r"[Pp]assword: \{0,1\}$";
pub const DEFAULT_YESNO: &str = r"(yes/no)? \{0,1\}$";

/// Everything the engine needs to run one session. Immutable once built.
pub struct SessionConfig {
    pub password: SecretString,
    pub prompt: PromptMatcher,
    /// Present only when yes/no questions should be answered automatically.
    pub yesno: Option<PromptMatcher>,
    pub ignore_case: bool,
    /// How long to wait for the next password prompt. `None` waits forever.
    pub timeout: Option<Duration>,
    /// Maximum number of passwords to send. `None` means unlimited.
    pub max_tries: Option<u32>,
    pub fatal_on_max_tries: bool,
    pub fatal_on_timeout: bool,
    /// Ignore SIGHUP in the child (e.g. for `ssh -f`).
    pub nohup_child: bool,
    pub command: Vec<OsString>,
    /// Transcript of every byte written to the PTY, passwords masked.
    pub log_to_pty: Option<PathBuf>,
    /// Transcript of every byte read from the PTY.
    pub log_from_pty: Option<PathBuf>,
    pub pipeline: PipelineConfig,
}

impl SessionConfig {
    /// A configuration with the default password, prompt and policies.
    pub fn new(command: Vec<OsString>) -> Result<Self> {
        if command.is_empty() {
            return Err(Error::Usage("Error: no command specified".into()));
        }
        Ok(Self {
            password: secret(DEFAULT_PASSWORD.to_string()),
            prompt: PromptMatcher::compile(DEFAULT_PROMPT, false)?,
            yesno: None,
            ignore_case: false,
            timeout: None,
            max_tries: None,
            fatal_on_max_tries: false,
            fatal_on_timeout: false,
            nohup_child: false,
            command,
            log_to_pty: None,
            log_from_pty: None,
            pipeline: PipelineConfig::default(),
        })
    }

    /// The program name, for diagnostics.
    pub fn program(&self) -> String {
        self.command
            .first()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Resolve a `-p` argument into the password it names.
///
/// - `env:VAR` reads the environment variable `VAR`
/// - `file:PATH` reads the first line of `PATH`, without its line ending;
///   an empty file is an error
/// - anything else is the password itself
pub fn resolve_password(arg: &str) -> Result<SecretString> {
    if let Some(path) = arg.strip_prefix("file:") {
        let content = std::fs::read(path)
            .map_err(|e| Error::io(format!("failed to open file {path}"), e))?;
        if content.is_empty() {
            return Err(Error::General("failed to read the file".into()));
        }
        let first_line = content.split(|b| *b == b'\n').next().unwrap_or_default();
        let token = first_line
            .split(|b| *b == b'\r')
            .find(|t| !t.is_empty())
            .unwrap_or_default();
        Ok(secret(String::from_utf8_lossy(token).into_owned()))
    } else if let Some(var) = arg.strip_prefix("env:") {
        let value = std::env::var(var)
            .map_err(|_| Error::General(format!("env var not found: {var}")))?;
        Ok(secret(value))
    } else {
        Ok(secret(arg.to_string()))
    }
}

fn secret(value: String) -> SecretString {
    SecretString::new(value.into_boxed_str())
}

/// Parse a timeout: bare seconds (`5`), `500ms`, or `1.5s`. Zero disables it.
pub fn parse_timeout(s: &str) -> Result<Option<Duration>> {
    let s = s.trim();
    let duration = if let Some(ms_str) = s.strip_suffix("ms") {
        let ms: u64 = ms_str
            .trim()
            .parse()
            .map_err(|_| Error::Usage(format!("Invalid milliseconds value: {s}")))?;
        Duration::from_millis(ms)
    } else {
        let secs_str = s.strip_suffix('s').unwrap_or(s).trim();
        let secs: f64 = secs_str
            .parse()
            .map_err(|_| Error::Usage(format!("Invalid timeout: {s}")))?;
        Duration::try_from_secs_f64(secs).map_err(|_| Error::Usage(format!("Invalid timeout: {s}")))?
    };
    Ok((!duration.is_zero()).then_some(duration))
}
