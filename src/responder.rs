//! Prompt recognition and the policy that decides what to answer.
//!
//! [`Responder`] is fed every chunk read from the PTY. It keeps a rolling
//! [`PromptCache`] of recent output, looks for the yes/no and password
//! prompts in it, and tracks how many passwords were sent and how long ago
//! the last prompt was seen. The engine performs the writes it asks for.

use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::prompt::PromptMatcher;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Bytes of output kept for matching before the cache is trimmed.
pub const CACHE_CAPACITY: usize = 16 * 1024;
/// Bytes kept after a trim.
pub const CACHE_TAIL: usize = 8 * 1024;

/// Recent PTY output that has not been consumed by a prompt match.
#[derive(Debug, Default)]
pub struct PromptCache {
    buf: Vec<u8>,
}

impl PromptCache {
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(CACHE_CAPACITY),
        }
    }

    /// Append output. NUL bytes are stored as `0xff` so patterns can match
    /// across them.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf
            .extend(bytes.iter().map(|&b| if b == 0 { 0xff } else { b }));
        if self.buf.len() >= CACHE_CAPACITY {
            let cut = self.buf.len() - CACHE_TAIL;
            self.buf.drain(..cut);
        }
    }

    /// Drop everything up to `end`.
    pub fn consume(&mut self, end: usize) {
        let end = end.min(self.buf.len());
        self.buf.drain(..end);
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

/// What the engine should type into the PTY.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// Answer a host-key style question with `yes`.
    Yes,
    /// Send the password.
    Password,
}

pub struct Responder {
    prompt: PromptMatcher,
    yesno: Option<PromptMatcher>,
    timeout: Option<Duration>,
    max_tries: Option<u32>,
    fatal_on_max_tries: bool,
    fatal_on_timeout: bool,
    cache: PromptCache,
    passwords_seen: u32,
    /// Start of the session, then the time of the latest password prompt.
    last_prompt: Instant,
    given_up: bool,
    interactive: bool,
}

impl Responder {
    pub fn new(config: &SessionConfig, now: Instant) -> Self {
        Self {
            prompt: config.prompt.clone(),
            yesno: config.yesno.clone(),
            timeout: config.timeout,
            max_tries: config.max_tries,
            fatal_on_max_tries: config.fatal_on_max_tries,
            fatal_on_timeout: config.fatal_on_timeout,
            cache: PromptCache::new(),
            passwords_seen: 0,
            last_prompt: now,
            given_up: false,
            interactive: false,
        }
    }

    /// Fail if no password prompt appeared in time and that is fatal.
    pub fn check_timeout(&self, now: Instant) -> Result<()> {
        if let Some(timeout) = self.timeout
            && self.fatal_on_timeout
            && self.passwords_seen == 0
            && now.saturating_duration_since(self.last_prompt) > timeout
        {
            return Err(Error::Timeout);
        }
        Ok(())
    }

    /// The user typed something: from now on, output is only relayed.
    pub fn mark_interactive(&mut self) {
        if !self.interactive {
            debug!("input from the user, prompt matching disabled");
            self.interactive = true;
            self.cache.clear();
        }
    }

    /// Feed one chunk of PTY output and decide whether to answer it.
    pub fn on_output(&mut self, bytes: &[u8], now: Instant) -> Result<Option<Reply>> {
        if !self.given_up
            && let Some(timeout) = self.timeout
            && now.saturating_duration_since(self.last_prompt) >= timeout
        {
            info!("no password prompt within {timeout:?}, giving up on matching");
            self.given_up = true;
        }

        if !self.is_matching() {
            self.cache.clear();
            return Ok(None);
        }
        self.cache.push(bytes);

        if self.passwords_seen == 0
            && let Some(yesno) = &self.yesno
            && let Some(end) = yesno.find_end(self.cache.as_bytes())
        {
            debug!("yes/no prompt matched");
            self.cache.consume(end);
            return Ok(Some(Reply::Yes));
        }

        let Some(end) = self.prompt.find_end(self.cache.as_bytes()) else {
            return Ok(None);
        };
        self.passwords_seen += 1;
        self.last_prompt = now;
        debug!(seen = self.passwords_seen, "password prompt matched");

        if let Some(max) = self.max_tries {
            if self.fatal_on_max_tries {
                if self.passwords_seen > max {
                    return Err(Error::MaxTries(max));
                }
            } else if self.passwords_seen >= max {
                info!("sent the last of {max} passwords, giving up on matching");
                self.given_up = true;
            }
        }

        self.cache.consume(end);
        Ok(Some(Reply::Password))
    }

    fn is_matching(&self) -> bool {
        !self.given_up && !self.interactive
    }

    pub fn passwords_seen(&self) -> u32 {
        self.passwords_seen
    }

    pub fn given_up(&self) -> bool {
        self.given_up
    }

    pub fn cache(&self) -> &PromptCache {
        &self.cache
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_YESNO;

    fn config() -> SessionConfig {
        SessionConfig::new(vec!["ssh".into()]).unwrap()
    }

    fn responder(config: &SessionConfig) -> (Responder, Instant) {
        let now = Instant::now();
        (Responder::new(config, now), now)
    }

    #[test]
    fn test_cache_substitutes_nul() {
        let mut cache = PromptCache::new();
        cache.push(b"a\0b");
        assert_eq!(cache.as_bytes(), b"a\xffb");
    }

    #[test]
    fn test_cache_keeps_tail_when_full() {
        let mut cache = PromptCache::new();
        cache.push(&vec![b'a'; CACHE_CAPACITY - 1]);
        assert_eq!(cache.len(), CACHE_CAPACITY - 1);
        cache.push(b"xyz");
        assert_eq!(cache.len(), CACHE_TAIL);
        assert!(cache.as_bytes().ends_with(b"aaxyz"));
    }

    #[test]
    fn test_cache_consume_past_end() {
        let mut cache = PromptCache::new();
        cache.push(b"abc");
        cache.consume(10);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_password_prompt_split_across_chunks() {
        let cfg = config();
        let (mut r, now) = responder(&cfg);
        assert_eq!(r.on_output(b"user@host's pass", now).unwrap(), None);
        assert_eq!(r.on_output(b"word: ", now).unwrap(), Some(Reply::Password));
        assert_eq!(r.passwords_seen(), 1);
        assert!(r.cache().is_empty());
    }

    #[test]
    fn test_prompt_not_answered_twice() {
        let cfg = config();
        let (mut r, now) = responder(&cfg);
        assert_eq!(r.on_output(b"Password: ", now).unwrap(), Some(Reply::Password));
        assert_eq!(r.on_output(b"\r\nWelcome\r\n", now).unwrap(), None);
    }

    #[test]
    fn test_two_tries_then_relay_only() {
        let mut cfg = config();
        cfg.max_tries = Some(2);
        let (mut r, now) = responder(&cfg);

        assert_eq!(r.on_output(b"Password: ", now).unwrap(), Some(Reply::Password));
        assert_eq!(r.on_output(b"Password: ", now).unwrap(), Some(Reply::Password));
        assert!(r.given_up());
        assert_eq!(r.on_output(b"Password: ", now).unwrap(), None);
        assert_eq!(r.passwords_seen(), 2);
    }

    #[test]
    fn test_fatal_on_prompt_after_max_tries() {
        let mut cfg = config();
        cfg.max_tries = Some(1);
        cfg.fatal_on_max_tries = true;
        let (mut r, now) = responder(&cfg);

        assert_eq!(r.on_output(b"Password: ", now).unwrap(), Some(Reply::Password));
        let err = r.on_output(b"Password: ", now).unwrap_err();
        assert!(matches!(err, Error::MaxTries(1)));
        assert_eq!(err.exit_code(), crate::error::EXIT_MAX_TRIES);
    }

    #[test]
    fn test_yesno_answered_once_before_password() {
        let mut cfg = config();
        cfg.yesno = Some(PromptMatcher::compile(DEFAULT_YESNO, false).unwrap());
        let (mut r, now) = responder(&cfg);

        let question = b"Are you sure you want to continue connecting (yes/no)? ";
        assert_eq!(r.on_output(question, now).unwrap(), Some(Reply::Yes));
        assert_eq!(r.on_output(b"Password: ", now).unwrap(), Some(Reply::Password));
        // After a password went out, the question is no longer answered.
        assert_eq!(r.on_output(question, now).unwrap(), None);
    }

    #[test]
    fn test_yesno_ignored_when_disabled() {
        let cfg = config();
        let (mut r, now) = responder(&cfg);
        assert_eq!(r.on_output(b"(yes/no)? ", now).unwrap(), None);
    }

    #[test]
    fn test_interactive_disables_matching() {
        let cfg = config();
        let (mut r, now) = responder(&cfg);
        r.on_output(b"Pass", now).unwrap();
        r.mark_interactive();
        assert!(r.cache().is_empty());
        assert_eq!(r.on_output(b"Password: ", now).unwrap(), None);
        assert!(r.cache().is_empty());
    }

    #[test]
    fn test_timeout_gives_up_silently() {
        let mut cfg = config();
        cfg.timeout = Some(Duration::from_secs(1));
        let (mut r, start) = responder(&cfg);

        let later = start + Duration::from_secs(2);
        r.check_timeout(later).unwrap();
        assert_eq!(r.on_output(b"Password: ", later).unwrap(), None);
        assert!(r.given_up());
    }

    #[test]
    fn test_fatal_timeout_before_first_prompt() {
        let mut cfg = config();
        cfg.timeout = Some(Duration::from_secs(1));
        cfg.fatal_on_timeout = true;
        let (r, start) = responder(&cfg);

        r.check_timeout(start + Duration::from_millis(500)).unwrap();
        let err = r.check_timeout(start + Duration::from_secs(2)).unwrap_err();
        assert_eq!(err.exit_code(), crate::error::EXIT_TIMEOUT);
    }

    #[test]
    fn test_fatal_timeout_not_after_password() {
        let mut cfg = config();
        cfg.timeout = Some(Duration::from_secs(1));
        cfg.fatal_on_timeout = true;
        let (mut r, start) = responder(&cfg);

        r.on_output(b"Password: ", start).unwrap();
        r.check_timeout(start + Duration::from_secs(10)).unwrap();
    }

    #[test]
    fn test_nul_bytes_do_not_break_matching() {
        let cfg = config();
        let (mut r, now) = responder(&cfg);
        assert_eq!(
            r.on_output(b"\0\0Password: ", now).unwrap(),
            Some(Reply::Password)
        );
    }
}
