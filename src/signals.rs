//! Asynchronous signal notification.
//!
//! Handlers only store to atomics. The engine polls and clears the flags from
//! its own thread, where reaping and resizing are safe to do.

use crate::error::{Error, Result};
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

static SIGCHLD_RECEIVED: AtomicBool = AtomicBool::new(false);
static SIGWINCH_RECEIVED: AtomicBool = AtomicBool::new(false);
static TERMINATION_SIGNAL: AtomicI32 = AtomicI32::new(0);

extern "C" fn handle_sigchld(_: libc::c_int) {
    SIGCHLD_RECEIVED.store(true, Ordering::SeqCst);
}

extern "C" fn handle_sigwinch(_: libc::c_int) {
    SIGWINCH_RECEIVED.store(true, Ordering::SeqCst);
}

extern "C" fn handle_termination(signo: libc::c_int) {
    TERMINATION_SIGNAL.store(signo, Ordering::SeqCst);
}

/// Signals that ask passh itself to stop; they are passed on to the child.
const TERMINATION_SIGNALS: [Signal; 3] = [Signal::SIGTERM, Signal::SIGHUP, Signal::SIGINT];

fn install(signal: Signal, handler: extern "C" fn(libc::c_int)) -> Result<()> {
    // No SA_RESTART: an interrupted poll() should return early so the flag
    // is looked at right away.
    let action = SigAction::new(
        SigHandler::Handler(handler),
        SaFlags::empty(),
        SigSet::empty(),
    );
    // SAFETY: the handlers only perform atomic stores.
    unsafe { sigaction(signal, &action) }
        .map_err(|e| Error::sys(format!("sigaction {signal:?}"), e))?;
    Ok(())
}

/// Watch for child state changes. Must run before the child is spawned.
pub fn watch_child() -> Result<()> {
    SIGCHLD_RECEIVED.store(false, Ordering::SeqCst);
    install(Signal::SIGCHLD, handle_sigchld)
}

/// Watch for terminal resizes.
pub fn watch_window_changes() -> Result<()> {
    install(Signal::SIGWINCH, handle_sigwinch)
}

/// Catch termination requests so they can be forwarded to the child.
pub fn watch_termination() -> Result<()> {
    for signal in TERMINATION_SIGNALS {
        install(signal, handle_termination)?;
    }
    Ok(())
}

/// True (once) if a SIGCHLD arrived since the last call.
pub fn take_child_changed() -> bool {
    SIGCHLD_RECEIVED.swap(false, Ordering::SeqCst)
}

/// True (once) if a SIGWINCH arrived since the last call.
pub fn take_window_changed() -> bool {
    SIGWINCH_RECEIVED.swap(false, Ordering::SeqCst)
}

/// Serializes tests that raise signals or consume the process-wide flags.
#[cfg(test)]
pub(crate) fn test_guard() -> std::sync::MutexGuard<'static, ()> {
    static LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
    LOCK.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// The last termination signal received since the previous call, if any.
pub fn take_termination() -> Option<Signal> {
    match TERMINATION_SIGNAL.swap(0, Ordering::SeqCst) {
        0 => None,
        signo => Signal::try_from(signo).ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_change_delivery() {
        let _guard = test_guard();
        watch_window_changes().unwrap();
        nix::sys::signal::raise(Signal::SIGWINCH).unwrap();
        assert!(take_window_changed());
        assert!(!take_window_changed());
    }

    #[test]
    fn test_termination_flag_round_trip() {
        TERMINATION_SIGNAL.store(libc::SIGTERM, Ordering::SeqCst);
        assert_eq!(take_termination(), Some(Signal::SIGTERM));
        assert_eq!(take_termination(), None);
    }
}
