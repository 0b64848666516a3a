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

//! The host execution layer (§4.2-4.3): command shaping, the sudo dance, and
//! the trait every concrete transport (SSH, local subprocess) implements.

pub mod cache;
pub mod local;
pub mod ssh;

use std::fmt;
use std::sync::Arc;

use crate::context::{esc1, HostContext};
use crate::error::{FrameworkError, Result};
use crate::logger::Logger;
use crate::pty::Pty;

/// Stand-in for Python's "class identity" used as the connection-cache key
/// and the LocalHost sudo-password-cell key (§3, §9). Two `Host` values that
/// should share one transport and one cached sudo password carry the same
/// `HostClassId`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostClassId(Arc<str>);

impl HostClassId {
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        HostClassId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HostClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub const DEFAULT_TERM: &str = "xterm";

/// Window (in bytes) scanned for `magic_sudo_prompt` at the tail of the
/// accumulated channel output (§4.2, §8).
pub const SUDO_PROMPT_WINDOW: usize = 32;

/// Options accepted by `Host::run` (§4.2).
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub use_sudo: bool,
    pub user: Option<String>,
    pub sandbox: bool,
    pub interactive: bool,
    pub ignore_exit_status: bool,
    pub initial_input: Option<String>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            use_sudo: false,
            user: None,
            sandbox: false,
            interactive: true,
            ignore_exit_status: false,
            initial_input: None,
        }
    }
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn sudo(mut self, on: bool) -> Self { self.use_sudo = on; self }
    pub fn as_user(mut self, user: impl Into<String>) -> Self { self.user = Some(user.into()); self }
    pub fn sandbox(mut self, on: bool) -> Self { self.sandbox = on; self }
    pub fn interactive(mut self, on: bool) -> Self { self.interactive = on; self }
    pub fn ignore_exit_status(mut self, on: bool) -> Self { self.ignore_exit_status = on; self }
    pub fn initial_input(mut self, input: impl Into<String>) -> Self { self.initial_input = Some(input.into()); self }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode {
    Read,
    Write,
}

const S_IFMT: u32 = 0o170000;
const S_IFDIR: u32 = 0o040000;
const S_IFREG: u32 = 0o100000;

/// A minimal POSIX-stat mirror returned by `Host::stat`/`Host::listdir`
/// (§4.3). Transports that can't distinguish file types leave `st_mode` at 0,
/// which makes both `is_dir`/`is_file` report `false`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RemoteStat {
    pub st_mode: u32,
    pub st_size: u64,
    pub st_uid: u32,
    pub st_gid: u32,
}

impl RemoteStat {
    pub fn is_dir(&self) -> bool {
        self.st_mode & S_IFMT == S_IFDIR
    }
    pub fn is_file(&self) -> bool {
        self.st_mode & S_IFMT == S_IFREG
    }
}

/// A scoped remote file handle (§4.3). Implementors must flush/close their
/// sudo temp-file dance from `close`, even when the caller drops it early —
/// concrete implementations do that work in their own `Drop`.
pub trait RemoteFile: Send {
    fn read(&mut self, max_bytes: usize) -> Result<Vec<u8>>;
    fn readline(&mut self) -> Result<Option<String>>;
    fn write(&mut self, data: &[u8]) -> Result<()>;
    fn close(self: Box<Self>) -> Result<()>;
}

/// Common behavior of every concrete transport. `SSHHost` and `LocalHost`
/// both implement this; `HostsContainer` and the dispatcher only ever see
/// `&dyn Host`.
pub trait Host: Send + Sync {
    fn slug(&self) -> &str;
    fn host_class(&self) -> &HostClassId;
    fn username(&self) -> &str;
    fn term(&self) -> &str;
    fn magic_sudo_prompt(&self) -> &str;
    fn start_path(&self) -> Result<String>;
    fn context(&self) -> &HostContext;

    fn run(&self, pty: &dyn Pty, logger: &dyn Logger, command: &str, options: &RunOptions) -> Result<String>;

    fn open(&self, logger: &dyn Logger, remote_path: &str, mode: FileMode, use_sudo: bool, sandbox: bool)
        -> Result<Box<dyn RemoteFile>>;

    /// Resolve `path` through this host's current `HostContext` cwd, without
    /// running a remote command (§10.4).
    fn expand_path(&self, path: &str) -> Result<String> {
        if path.starts_with('/') {
            return Ok(path.to_string());
        }
        let start = self.start_path()?;
        let cwd = self.context().cwd(&start);
        Ok(format!("{}/{}", cwd.trim_end_matches('/'), path))
    }

    /// `test -f || test -d` (§4.5).
    fn exists(&self, pty: &dyn Pty, logger: &dyn Logger, path: &str, use_sudo: bool) -> Result<bool> {
        let escaped = esc1(path);
        let command = format!("test -f '{escaped}' || test -d '{escaped}'");
        let opts = RunOptions::new().sudo(use_sudo).interactive(false).ignore_exit_status(false);
        match self.run(pty, logger, &command, &opts) {
            Ok(_) => Ok(true),
            Err(e) if e.is_command_failed() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Attach the local terminal to an interactive remote shell (§4.2, §10.4).
    /// Only meaningful for transports that relay a real pty; `LocalHost`
    /// inherits the default, which refuses rather than pretending to relay.
    fn start_interactive_shell(&self, _pty: &dyn Pty) -> Result<()> {
        Err(FrameworkError::Other(format!("{} does not support interactive shells", self.slug())))
    }

    /// `stat(2)` over this host's file-transfer subchannel, resetting the
    /// subchannel's working directory to this host's current cwd first
    /// (§4.3). Transports that don't implement file transfer inherit the
    /// default refusal.
    fn stat(&self, _path: &str) -> Result<RemoteStat> {
        Err(FrameworkError::Other(format!("{} does not support stat", self.slug())))
    }

    /// Directory listing over this host's file-transfer subchannel, same
    /// cwd-reset precondition as `stat` (§4.3).
    fn listdir(&self, _path: &str) -> Result<Vec<String>> {
        Err(FrameworkError::Other(format!("{} does not support listdir", self.slug())))
    }
}

/// `bash -n -c '<cmd>'; echo '<cmd>'` — sandbox mode validates syntax only
/// and echoes the command it would have run (§4.2).
pub fn sandbox_wrap(command: &str) -> String {
    let escaped = esc1(command);
    format!("bash -n -c '{escaped}' ;echo '{escaped}'")
}

/// Interactive sudo shape: `su` (not `sudo -u`) so `~` expands to the target
/// user's home (§4.2).
pub fn sudo_interactive_shape(magic_sudo_prompt: &str, user: Option<&str>, command: &str) -> String {
    let magic = esc1(magic_sudo_prompt);
    match user {
        Some(u) => format!("sudo -p '{}' su '{}' -c '{}'", magic, esc1(u), esc1(command)),
        None => format!("sudo -p '{}' bash -c '{}'", magic, esc1(command)),
    }
}

/// Non-interactive sudo shape: password piped on stdin (§4.2).
pub fn sudo_noninteractive_shape(password: &str, user: Option<&str>, command: &str) -> String {
    let pw = esc1(password);
    match user {
        Some(u) => format!("echo '{}' | sudo -p '(passwd)' -u '{}' -P {}", pw, esc1(u), command),
        None => format!("echo '{}' | sudo -p '(passwd)' -S {}", pw, command),
    }
}

/// Builds the final shaped command sent to the transport, in the
/// deterministic order described by §4.1/§4.2: prefix stack, then (if
/// sandboxing) the syntax-check wrap, then (if sudo) the sudo wrap, then the
/// outermost cd/export wrapping from the host's `HostContext`.
pub fn build_shaped_command(
    ctx: &HostContext,
    start_path: &str,
    raw_command: &str,
    options: &RunOptions,
    magic_sudo_prompt: &str,
    sudo_password: &str,
) -> String {
    let mut command = ctx.with_prefixes(raw_command);

    if options.sandbox {
        command = sandbox_wrap(&command);
    }

    if options.use_sudo {
        command = if options.interactive {
            sudo_interactive_shape(magic_sudo_prompt, options.user.as_deref(), &command)
        } else {
            sudo_noninteractive_shape(sudo_password, options.user.as_deref(), &command)
        };
    }

    ctx.shape(start_path, &command, options.sandbox)
}

/// True when `magic` appears anywhere in the last `SUDO_PROMPT_WINDOW` bytes
/// of `buffer` (§4.2, §8).
pub fn buffer_contains_magic_prompt(buffer: &[u8], magic: &str) -> bool {
    if magic.is_empty() {
        return false;
    }
    let start = buffer.len().saturating_sub(SUDO_PROMPT_WINDOW);
    let tail = &buffer[start..];
    let needle = magic.as_bytes();
    if needle.len() > tail.len() {
        return false;
    }
    tail.windows(needle.len()).any(|w| w == needle)
}

pub fn command_failed(command: &str, host_slug: &str, status_code: i32, partial_output: &str) -> FrameworkError {
    FrameworkError::CommandFailed {
        command: command.to_string(),
        host: host_slug.to_string(),
        status_code,
        partial_output: partial_output.to_string(),
    }
}
