//! Controlling-terminal management: raw mode, restoration, window size.

use crate::error::{Error, Result};
use nix::errno::Errno;
use nix::pty::Winsize;
use nix::sys::termios::{
    ControlFlags, InputFlags, LocalFlags, OutputFlags, SetArg, SpecialCharacterIndices, Termios,
    tcgetattr, tcsetattr,
};
use nix::unistd::isatty;
use std::os::fd::{AsFd, AsRawFd};
use tracing::{debug, warn};

const RAW_LOCAL: LocalFlags = LocalFlags::ECHO
    .union(LocalFlags::ICANON)
    .union(LocalFlags::IEXTEN)
    .union(LocalFlags::ISIG);
const RAW_INPUT: InputFlags = InputFlags::BRKINT
    .union(InputFlags::ICRNL)
    .union(InputFlags::INPCK)
    .union(InputFlags::ISTRIP)
    .union(InputFlags::IXON);

pub fn is_terminal<F: AsFd>(fd: F) -> bool {
    isatty(fd).unwrap_or(false)
}

/// Puts a terminal into raw mode and puts it back exactly once.
///
/// Restoration happens on [`restore`](Self::restore) or, failing that, when
/// the guard is dropped, so every exit path leaves the terminal usable.
pub struct RawModeGuard<F: AsFd> {
    fd: F,
    saved: Termios,
    restored: bool,
}

impl<F: AsFd> RawModeGuard<F> {
    /// Switch `fd` to raw mode, saving its current attributes.
    ///
    /// Partial application counts as failure: the original attributes are
    /// put back and [`Error::PartialRawMode`] is returned.
    pub fn enter(fd: F) -> Result<Self> {
        if !is_terminal(&fd) {
            return Err(Error::NotATty);
        }
        let saved = tcgetattr(&fd).map_err(|e| Error::sys("tcgetattr error on stdin", e))?;

        let mut raw = saved.clone();
        make_raw(&mut raw);
        tcsetattr(&fd, SetArg::TCSAFLUSH, &raw).map_err(|e| Error::sys("tty_raw error", e))?;

        // tcsetattr() can report success after applying only some changes.
        let applied = match tcgetattr(&fd) {
            Ok(applied) => applied,
            Err(e) => {
                let _ = tcsetattr(&fd, SetArg::TCSAFLUSH, &saved);
                return Err(Error::sys("tty_raw error", e));
            }
        };
        if !is_raw(&applied) {
            let _ = tcsetattr(&fd, SetArg::TCSAFLUSH, &saved);
            return Err(Error::PartialRawMode);
        }

        debug!(fd = fd.as_fd().as_raw_fd(), "terminal switched to raw mode");
        Ok(Self {
            fd,
            saved,
            restored: false,
        })
    }

    /// The attributes that were in effect before raw mode.
    pub fn saved(&self) -> &Termios {
        &self.saved
    }

    /// Put the saved attributes back. Later calls do nothing.
    pub fn restore(&mut self) -> Result<()> {
        if self.restored {
            return Ok(());
        }
        tcsetattr(&self.fd, SetArg::TCSAFLUSH, &self.saved)
            .map_err(|e| Error::sys("tty_reset error", e))?;
        self.restored = true;
        debug!("terminal attributes restored");
        Ok(())
    }
}

impl<F: AsFd> Drop for RawModeGuard<F> {
    fn drop(&mut self) {
        if let Err(e) = self.restore() {
            warn!("failed to restore terminal: {e}");
        }
    }
}

fn make_raw(t: &mut Termios) {
    t.local_flags.remove(RAW_LOCAL);
    t.input_flags.remove(RAW_INPUT);
    t.control_flags.remove(ControlFlags::CSIZE | ControlFlags::PARENB);
    t.control_flags.insert(ControlFlags::CS8);
    t.output_flags.remove(OutputFlags::OPOST);
    t.control_chars[SpecialCharacterIndices::VMIN as usize] = 1;
    t.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;
}

fn is_raw(t: &Termios) -> bool {
    !t.local_flags.intersects(RAW_LOCAL)
        && !t.input_flags.intersects(RAW_INPUT)
        && (t.control_flags & (ControlFlags::CSIZE | ControlFlags::PARENB)) == ControlFlags::CS8
        && !t.output_flags.contains(OutputFlags::OPOST)
        && t.control_chars[SpecialCharacterIndices::VMIN as usize] == 1
        && t.control_chars[SpecialCharacterIndices::VTIME as usize] == 0
}

/// Current window size of the terminal behind `fd`.
pub fn window_size<F: AsFd>(fd: F) -> Result<Winsize> {
    let mut ws = Winsize {
        ws_row: 0,
        ws_col: 0,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    // SAFETY: TIOCGWINSZ writes a `winsize` into the pointed-to struct.
    let ret = unsafe { libc::ioctl(fd.as_fd().as_raw_fd(), libc::TIOCGWINSZ, &mut ws) };
    if ret == -1 {
        return Err(Error::sys("TIOCGWINSZ error", Errno::last()));
    }
    Ok(ws)
}

/// Apply a window size to a terminal or PTY master.
pub fn set_window_size<F: AsFd>(fd: F, ws: &Winsize) -> Result<()> {
    // SAFETY: TIOCSWINSZ only reads the pointed-to `winsize`.
    let ret = unsafe { libc::ioctl(fd.as_fd().as_raw_fd(), libc::TIOCSWINSZ, ws) };
    if ret == -1 {
        return Err(Error::sys("TIOCSWINSZ error", Errno::last()));
    }
    Ok(())
}

/// Copy the real terminal's geometry onto the PTY master so the child's
/// window tracks the user's.
pub fn propagate_window_size<F: AsFd, M: AsFd>(from: F, master: M) -> Result<()> {
    let ws = window_size(from)?;
    debug!(rows = ws.ws_row, cols = ws.ws_col, "propagating window size");
    set_window_size(master, &ws)
}

/// Attributes compared when checking that a terminal is back where it was.
#[cfg(test)]
fn same_attributes(a: &Termios, b: &Termios) -> bool {
    a.input_flags == b.input_flags
        && a.output_flags == b.output_flags
        && a.control_flags == b.control_flags
        && a.local_flags == b.local_flags
        && a.control_chars == b.control_chars
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::pty::openpty;

    #[test]
    fn test_enter_raw_mode_on_pty() {
        let pty = openpty(None, None).unwrap();
        let guard = RawModeGuard::enter(&pty.slave).unwrap();
        let now = tcgetattr(&pty.slave).unwrap();
        assert!(is_raw(&now));
        assert!(!is_raw(guard.saved()));
    }

    #[test]
    fn test_restore_is_idempotent() {
        let pty = openpty(None, None).unwrap();
        let original = tcgetattr(&pty.slave).unwrap();

        let mut guard = RawModeGuard::enter(&pty.slave).unwrap();
        guard.restore().unwrap();
        let after_first = tcgetattr(&pty.slave).unwrap();
        assert!(same_attributes(&original, &after_first));

        guard.restore().unwrap();
        let after_second = tcgetattr(&pty.slave).unwrap();
        assert!(same_attributes(&after_first, &after_second));
    }

    #[test]
    fn test_restore_on_drop() {
        let pty = openpty(None, None).unwrap();
        let original = tcgetattr(&pty.slave).unwrap();
        {
            let _guard = RawModeGuard::enter(&pty.slave).unwrap();
            assert!(!same_attributes(&original, &tcgetattr(&pty.slave).unwrap()));
        }
        assert!(same_attributes(&original, &tcgetattr(&pty.slave).unwrap()));
    }

    #[test]
    fn test_restore_after_drop_of_restored_guard_changes_nothing() {
        let pty = openpty(None, None).unwrap();
        let mut guard = RawModeGuard::enter(&pty.slave).unwrap();
        guard.restore().unwrap();

        // Someone else changes the terminal after we restored it.
        let mut changed = tcgetattr(&pty.slave).unwrap();
        changed.local_flags.remove(LocalFlags::ECHO);
        tcsetattr(&pty.slave, SetArg::TCSANOW, &changed).unwrap();

        drop(guard);
        assert!(same_attributes(&changed, &tcgetattr(&pty.slave).unwrap()));
    }

    #[test]
    fn test_enter_raw_mode_rejects_non_tty() {
        let file = tempfile::tempfile().unwrap();
        assert!(matches!(RawModeGuard::enter(&file), Err(Error::NotATty)));
    }

    #[test]
    fn test_window_size_round_trip_through_master() {
        let ws = Winsize {
            ws_row: 40,
            ws_col: 120,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        let real = openpty(Some(&ws), None).unwrap();
        let child = openpty(None, None).unwrap();

        propagate_window_size(&real.slave, &child.master).unwrap();
        let seen = window_size(&child.slave).unwrap();
        assert_eq!((seen.ws_row, seen.ws_col), (40, 120));
    }
}
