// Jetporch
// Copyright (C) 2023 - Michael DeHaan <michael@michaeldehaan.net> + contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// long with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Abstraction over the local input/output stream pair a `run()` call relays
//! through: terminal size, whether it's a real controlling tty, and whether
//! the dispatcher may fan an action out into several of these concurrently.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use nix::sys::termios::{self, LocalFlags, SetArg, Termios};
use nix::sys::signal::{self, SigHandler, Signal};

/// A worker's view of the local terminal for the duration of one `run()`
/// call. `auxiliary_ptys_are_available` governs whether `HostsContainer::run`
/// and the action dispatcher may fan work out concurrently (§4.5, §4.7) or
/// must fall back to running isolations one at a time in this same pty.
pub trait Pty: Send + Sync {
    fn size(&self) -> (u16, u16);
    fn term(&self) -> &str;
    fn auxiliary_ptys_are_available(&self) -> bool;
    fn is_interactive(&self) -> bool;
}

pub type PtyRef = Arc<dyn Pty>;

/// The real controlling terminal. Used for the single in-place run and as
/// the parent pty a fan-out forks auxiliary workers from.
pub struct LocalTtyPty {
    term: String,
}

impl LocalTtyPty {
    pub fn new() -> Self {
        let term = std::env::var("TERM").unwrap_or_else(|_| "xterm".to_string());
        Self { term }
    }
}

impl Default for LocalTtyPty {
    fn default() -> Self {
        Self::new()
    }
}

impl Pty for LocalTtyPty {
    fn size(&self) -> (u16, u16) {
        get_window_size(libc_stdout_fd()).unwrap_or((80, 24))
    }

    fn term(&self) -> &str {
        &self.term
    }

    fn auxiliary_ptys_are_available(&self) -> bool {
        true
    }

    fn is_interactive(&self) -> bool {
        nix::unistd::isatty(libc_stdout_fd()).unwrap_or(false)
    }
}

/// A non-interactive pty: fixed size, never fans out. Used by sandbox mode
/// and by tests, matching the original's `DummyPty` posture of defaulting
/// auxiliary-pty support to unavailable.
pub struct DummyPty {
    pub cols: u16,
    pub rows: u16,
}

impl Default for DummyPty {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

impl Pty for DummyPty {
    fn size(&self) -> (u16, u16) {
        (self.cols, self.rows)
    }
    fn term(&self) -> &str {
        "dumb"
    }
    fn auxiliary_ptys_are_available(&self) -> bool {
        false
    }
    fn is_interactive(&self) -> bool {
        false
    }
}

fn libc_stdout_fd() -> RawFd {
    1
}

fn get_window_size(fd: RawFd) -> Option<(u16, u16)> {
    use nix::libc::{ioctl, winsize, TIOCGWINSZ};
    let mut ws: winsize = unsafe { std::mem::zeroed() };
    let rc = unsafe { ioctl(fd, TIOCGWINSZ as _, &mut ws as *mut winsize) };
    if rc != 0 {
        return None;
    }
    Some((ws.ws_col, ws.ws_row))
}

/// Set when the process has received `SIGWINCH` since the flag was last
/// cleared. The interactive relay loop polls this once per iteration instead
/// of running arbitrary code on the signal handler's stack.
static WINCH_RECEIVED: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_winch(_: nix::libc::c_int) {
    WINCH_RECEIVED.store(true, Ordering::SeqCst);
}

/// Install the `SIGWINCH` handler. Idempotent; safe to call once per process.
pub fn install_winch_handler() {
    unsafe {
        let _ = signal::signal(Signal::SIGWINCH, SigHandler::Handler(handle_winch));
    }
}

/// Returns true exactly once per resize event, clearing the flag.
pub fn take_resize_event() -> bool {
    WINCH_RECEIVED.swap(false, Ordering::SeqCst)
}

/// RAII guard that puts local stdin into raw mode and always restores the
/// original mode on drop, including on unwind (§4.2 step 2, §8 raw-mode
/// restoration property).
pub struct RawModeGuard {
    fd: RawFd,
    original: Termios,
}

impl RawModeGuard {
    pub fn enable(fd: RawFd) -> nix::Result<Self> {
        let original = termios::tcgetattr(fd)?;
        let mut raw = original.clone();
        raw.local_flags.remove(LocalFlags::ECHO | LocalFlags::ICANON | LocalFlags::ISIG);
        termios::tcsetattr(fd, SetArg::TCSANOW, &raw)?;
        Ok(Self { fd, original })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = termios::tcsetattr(self.fd, SetArg::TCSANOW, &self.original);
    }
}

/// Sequential fan-out result: every worker runs to completion, in order,
/// before the next starts. This is the posture used whenever the current pty
/// doesn't advertise auxiliary ptys.
pub fn run_sequential<T, F>(thunks: Vec<F>) -> Vec<T>
where
    F: FnOnce() -> T,
{
    thunks.into_iter().map(|f| f()).collect()
}
