use crate::error::{Error, Result};
use nix::errno::Errno;
use nix::fcntl::{FcntlArg, OFlag, fcntl};
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::pty::{Winsize, openpty};
use nix::sys::signal::{Signal, kill};
use nix::sys::termios::{SpecialCharacterIndices, Termios, tcgetattr};
use nix::unistd::{Pid, read};
use std::ffi::OsString;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::os::unix::process::CommandExt;
use std::process::Command;
use tracing::{debug, info};

/// Terminal attributes and geometry copied onto the slave side at creation.
pub struct SlaveSettings {
    pub termios: Termios,
    pub winsize: Winsize,
}

/// What a non-blocking read from the master produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    Data(usize),
    /// Nothing available right now.
    WouldBlock,
    /// The slave side has been closed (EOF or EIO).
    Closed,
}

/// The child's state as seen by a deferred reap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildState {
    /// Still alive, stopped, or continued.
    Running,
    /// Exited normally with this code.
    Exited(i32),
    /// Killed by this signal number.
    Signaled(i32),
}

impl ChildState {
    /// The exit code passh should finish with, once the child is gone.
    pub fn exit_code(self) -> Option<i32> {
        match self {
            ChildState::Running => None,
            ChildState::Exited(code) => Some(code),
            ChildState::Signaled(signo) => Some(128 + signo),
        }
    }
}

/// A program running on the slave side of a PTY, seen from the master side.
pub struct PtySession {
    master: OwnedFd,
    pid: Pid,
}

impl PtySession {
    /// Spawn `argv` attached to a fresh PTY.
    ///
    /// The child gets a new session with the slave as its controlling
    /// terminal and as fds 0, 1 and 2. When `slave` is given, its attributes
    /// and window size are applied to the slave before the child starts.
    pub fn spawn(argv: &[OsString], slave: Option<&SlaveSettings>, nohup: bool) -> Result<Self> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| Error::Usage("Error: no command specified".into()))?;

        let pty = match slave {
            Some(s) => openpty(&s.winsize, &s.termios),
            None => openpty(None, None),
        }
        .map_err(|e| Error::sys("can't open master pty", e))?;

        let master_fd = pty.master.as_raw_fd();
        let slave_fd = pty.slave.as_raw_fd();

        let mut cmd = Command::new(program);
        cmd.args(args);
        // SAFETY: the hook only makes async-signal-safe libc calls.
        unsafe {
            cmd.pre_exec(move || attach_to_slave(master_fd, slave_fd, nohup));
        }
        let child = cmd.spawn().map_err(|source| Error::Spawn {
            command: program.to_string_lossy().into_owned(),
            source,
        })?;

        // All done with the slave in the parent.
        drop(pty.slave);

        let pid = Pid::from_raw(child.id() as i32);
        info!(pid = pid.as_raw(), command = ?argv, "spawned child on pty");

        Ok(Self {
            master: pty.master,
            pid,
        })
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn master(&self) -> BorrowedFd<'_> {
        self.master.as_fd()
    }

    pub fn master_raw(&self) -> RawFd {
        self.master.as_raw_fd()
    }

    /// Wait until the master is writable, which tells us the child has the
    /// slave open, then switch the master to non-blocking mode.
    ///
    /// Waits in one-second slices, up to `retries` of them.
    pub fn wait_until_writable(&self, retries: u32) -> Result<()> {
        for attempt in 1..=retries {
            let mut fds = [PollFd::new(self.master.as_fd(), PollFlags::POLLOUT)];
            match poll(&mut fds, PollTimeout::from(1000u16)) {
                Ok(n) if n > 0 => {
                    let writable = fds[0]
                        .revents()
                        .is_some_and(|r| r.contains(PollFlags::POLLOUT));
                    if writable {
                        debug!(attempt, "pty master is writable");
                        return self.set_nonblocking();
                    }
                }
                Ok(_) | Err(Errno::EINTR) => {}
                Err(e) => return Err(Error::sys("poll error on ptym", e)),
            }
            debug!(attempt, "still waiting for the child to open the pty");
        }
        Err(Error::ChildNeverOpenedPty)
    }

    fn set_nonblocking(&self) -> Result<()> {
        let flags = fcntl(&self.master, FcntlArg::F_GETFL)
            .map_err(|e| Error::sys("fcntl F_GETFL failed", e))?;
        let flags = OFlag::from_bits_truncate(flags);
        fcntl(&self.master, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))
            .map_err(|e| Error::sys("fcntl F_SETFL failed", e))?;
        Ok(())
    }

    /// Read whatever is available on the master without blocking.
    pub fn read_available(&self, buf: &mut [u8]) -> Result<ReadOutcome> {
        loop {
            match read(&self.master, buf) {
                Ok(0) => return Ok(ReadOutcome::Closed),
                Ok(n) => return Ok(ReadOutcome::Data(n)),
                Err(Errno::EAGAIN) => return Ok(ReadOutcome::WouldBlock),
                Err(Errno::EINTR) => {}
                // Linux reports EIO once the last slave fd is closed.
                Err(Errno::EIO) => return Ok(ReadOutcome::Closed),
                Err(e) => return Err(Error::sys("read error from ptym", e)),
            }
        }
    }

    /// Collect the child's status if it changed. Never blocks.
    ///
    /// The raw status is decoded here so that children killed by signals
    /// nix has no `Signal` for (the real-time ones) still report `128 + n`.
    pub fn try_reap(&self) -> Result<ChildState> {
        let mut status: libc::c_int = 0;
        let flags = libc::WNOHANG | libc::WUNTRACED | libc::WCONTINUED;
        // SAFETY: `status` is a valid out-pointer for the duration of the call.
        let ret = unsafe { libc::waitpid(self.pid.as_raw(), &mut status, flags) };
        match ret {
            0 => Ok(ChildState::Running),
            -1 => match Errno::last() {
                Errno::EINTR => Ok(ChildState::Running),
                e => Err(Error::sys("received SIGCHLD but waitpid() failed", e)),
            },
            _ if libc::WIFEXITED(status) => Ok(ChildState::Exited(libc::WEXITSTATUS(status))),
            _ if libc::WIFSIGNALED(status) => Ok(ChildState::Signaled(libc::WTERMSIG(status))),
            _ => {
                debug!(status, "child changed state but is still around");
                Ok(ChildState::Running)
            }
        }
    }

    /// The end-of-file character currently configured on the PTY.
    pub fn eof_char(&self) -> Result<u8> {
        let termios = tcgetattr(&self.master).map_err(|e| Error::sys("tcgetattr error on ptym", e))?;
        Ok(termios.control_chars[SpecialCharacterIndices::VEOF as usize])
    }

    /// Pass a signal on to the child.
    pub fn signal(&self, signal: Signal) -> Result<()> {
        debug!(?signal, pid = self.pid.as_raw(), "forwarding signal to child");
        match kill(self.pid, signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(Error::sys(format!("kill {signal:?}"), e)),
        }
    }
}

/// Runs in the forked child, between fork and exec.
fn attach_to_slave(master_fd: RawFd, slave_fd: RawFd, nohup: bool) -> io::Result<()> {
    // SAFETY: plain syscalls on descriptors this process owns; nothing here
    // allocates or takes locks.
    unsafe {
        if libc::setsid() == -1 {
            return Err(io::Error::last_os_error());
        }
        libc::close(master_fd);
        // Not checked: some platforms acquire the controlling tty on open().
        libc::ioctl(slave_fd, libc::TIOCSCTTY as _, 0);
        for target in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
            if libc::dup2(slave_fd, target) == -1 {
                return Err(io::Error::last_os_error());
            }
        }
        if slave_fd > libc::STDERR_FILENO {
            libc::close(slave_fd);
        }
        if nohup {
            libc::signal(libc::SIGHUP, libc::SIG_IGN);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::{Duration, Instant};

    fn sh(script: &str) -> Vec<OsString> {
        vec!["/bin/sh".into(), "-c".into(), script.into()]
    }

    fn reap_blocking(session: &PtySession) -> ChildState {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let state = session.try_reap().unwrap();
            if state != ChildState::Running || Instant::now() > deadline {
                return state;
            }
            thread::sleep(Duration::from_millis(20));
        }
    }

    fn read_until(session: &PtySession, needle: &str) -> String {
        let mut output = Vec::new();
        let mut buf = [0u8; 4096];
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            match session.read_available(&mut buf).unwrap() {
                ReadOutcome::Data(n) => {
                    output.extend_from_slice(&buf[..n]);
                    if String::from_utf8_lossy(&output).contains(needle) {
                        break;
                    }
                }
                ReadOutcome::WouldBlock => thread::sleep(Duration::from_millis(10)),
                ReadOutcome::Closed => break,
            }
        }
        String::from_utf8_lossy(&output).into_owned()
    }

    #[test]
    fn test_spawn_and_read_output() {
        let session = PtySession::spawn(&sh("echo PASSH_PTY_OK; sleep 1"), None, false).unwrap();
        session.wait_until_writable(5).unwrap();
        let text = read_until(&session, "PASSH_PTY_OK");
        assert!(text.contains("PASSH_PTY_OK"), "got: {text}");
        assert_eq!(reap_blocking(&session), ChildState::Exited(0));
    }

    #[test]
    fn test_child_has_pty_as_stdio() {
        let session =
            PtySession::spawn(&sh("test -t 0 && test -t 1 && echo IS_TTY; sleep 1"), None, false).unwrap();
        session.wait_until_writable(5).unwrap();
        let text = read_until(&session, "IS_TTY");
        assert!(text.contains("IS_TTY"), "got: {text}");
    }

    #[test]
    fn test_exit_code_is_reported() {
        let session = PtySession::spawn(&sh("exit 3"), None, false).unwrap();
        let state = reap_blocking(&session);
        assert_eq!(state, ChildState::Exited(3));
        assert_eq!(state.exit_code(), Some(3));
    }

    #[test]
    fn test_killed_child_maps_to_128_plus_signal() {
        let session = PtySession::spawn(&sh("kill -9 $$"), None, false).unwrap();
        let state = reap_blocking(&session);
        assert_eq!(state, ChildState::Signaled(9));
        assert_eq!(state.exit_code(), Some(137));
    }

    #[test]
    fn test_slave_settings_apply_window_size() {
        let base = openpty(None, None).unwrap();
        let settings = SlaveSettings {
            termios: tcgetattr(&base.slave).unwrap(),
            winsize: Winsize {
                ws_row: 33,
                ws_col: 101,
                ws_xpixel: 0,
                ws_ypixel: 0,
            },
        };
        let session =
            PtySession::spawn(&sh("stty size; sleep 1"), Some(&settings), false).unwrap();
        session.wait_until_writable(5).unwrap();
        let text = read_until(&session, "33 101");
        assert!(text.contains("33 101"), "got: {text}");
    }

    #[test]
    fn test_realtime_signal_maps_to_128_plus_signal() {
        let session = PtySession::spawn(&sh("kill -34 $$"), None, false).unwrap();
        let state = reap_blocking(&session);
        assert_eq!(state, ChildState::Signaled(34));
        assert_eq!(state.exit_code(), Some(162));
    }

    #[test]
    fn test_spawn_missing_program_fails() {
        let argv = vec![OsString::from("/nonexistent/passh-no-such-program")];
        let err = PtySession::spawn(&argv, None, false).err().unwrap();
        assert!(matches!(err, Error::Spawn { .. }), "got: {err}");
        assert_eq!(err.exit_code(), crate::error::EXIT_SYSTEM);
    }

    #[test]
    fn test_eof_char_defaults_to_ctrl_d() {
        let session = PtySession::spawn(&sh("sleep 1"), None, false).unwrap();
        assert_eq!(session.eof_char().unwrap(), 0x04);
        session.signal(Signal::SIGKILL).unwrap();
        assert_eq!(reap_blocking(&session), ChildState::Signaled(9));
    }
}
