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

//! A fake `Host` double shared by the crate's integration tests, standing in
//! for a real SSH or local transport the way `tests/connection/local.rs`
//! exercises the teacher's connection layer against a real local process.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use flotilla::{FileMode, Host, HostClassId, HostContext, Logger, Pty, RemoteFile, Result, RunOptions};

pub struct FakeHost {
    slug: String,
    class: HostClassId,
    context: HostContext,
    fail_times: AtomicUsize,
}

impl FakeHost {
    pub fn new(slug: &str) -> Arc<dyn Host> {
        Arc::new(FakeHost {
            slug: slug.to_string(),
            class: HostClassId::new(slug),
            context: HostContext::new(),
            fail_times: AtomicUsize::new(0),
        })
    }

    pub fn flaky(slug: &str, fail_times: usize) -> Arc<dyn Host> {
        Arc::new(FakeHost {
            slug: slug.to_string(),
            class: HostClassId::new(slug),
            context: HostContext::new(),
            fail_times: AtomicUsize::new(fail_times),
        })
    }
}

impl Host for FakeHost {
    fn slug(&self) -> &str {
        &self.slug
    }
    fn host_class(&self) -> &HostClassId {
        &self.class
    }
    fn username(&self) -> &str {
        "deploy"
    }
    fn term(&self) -> &str {
        "xterm"
    }
    fn magic_sudo_prompt(&self) -> &str {
        "MAGIC"
    }
    fn start_path(&self) -> Result<String> {
        Ok("/home/deploy".to_string())
    }
    fn context(&self) -> &HostContext {
        &self.context
    }
    fn run(&self, _pty: &dyn Pty, _logger: &dyn Logger, command: &str, _options: &RunOptions) -> Result<String> {
        let remaining = self.fail_times.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_times.store(remaining - 1, Ordering::SeqCst);
            return Err(flotilla::host::command_failed(command, &self.slug, 1, ""));
        }
        Ok(format!("{}:{}", self.slug, command))
    }
    fn open(&self, _logger: &dyn Logger, _remote_path: &str, _mode: FileMode, _use_sudo: bool, _sandbox: bool) -> Result<Box<dyn RemoteFile>> {
        Err("fake host does not support file transfer".into())
    }
}
