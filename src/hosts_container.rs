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

//! Facade over a role -> hosts mapping (§3, §4.5): filter by role, fan a
//! command out to every matching host, or narrow down to exactly one.

use std::collections::HashMap;
use std::sync::Arc;

use rayon::prelude::*;

use crate::context::{esc1, CdGuard, EnvGuard, PrefixGuard};
use crate::error::{FrameworkError, Result};
use crate::host::{FileMode, Host, RunOptions};
use crate::logger::LoggerRef;
use crate::pty::{run_sequential, PtyRef};

/// Role name matching "every host regardless of role" (§3).
pub const ALL_ROLES: &str = "*";

#[derive(Clone)]
pub struct HostsContainer {
    hosts: HashMap<String, Vec<Arc<dyn Host>>>,
    all: Vec<Arc<dyn Host>>,
    pty: PtyRef,
    logger: LoggerRef,
    sandbox: bool,
}

impl HostsContainer {
    /// Builds the container and validates that no two hosts share a slug
    /// (§4.5 invariant — duplicate slugs are a construction-time error).
    pub fn new(hosts: HashMap<String, Vec<Arc<dyn Host>>>, pty: PtyRef, logger: LoggerRef, sandbox: bool) -> Result<Self> {
        let mut all: Vec<Arc<dyn Host>> = Vec::new();
        for group in hosts.values() {
            for host in group {
                if !all.iter().any(|existing| Arc::ptr_eq(existing, host)) {
                    all.push(Arc::clone(host));
                }
            }
        }

        let mut seen_slugs = std::collections::HashSet::new();
        for host in &all {
            if !seen_slugs.insert(host.slug().to_string()) {
                return Err(FrameworkError::ConstructionError(format!("duplicate host slug {}", host.slug())));
            }
        }

        Ok(Self { hosts, all, pty, logger, sandbox })
    }

    fn new_with_same_settings(&self, hosts: HashMap<String, Vec<Arc<dyn Host>>>) -> Result<Self> {
        Self::new(hosts, Arc::clone(&self.pty), Arc::clone(&self.logger), self.sandbox)
    }

    pub fn len(&self) -> usize {
        self.all.len()
    }

    pub fn is_empty(&self) -> bool {
        self.all.is_empty()
    }

    pub fn roles(&self) -> Vec<String> {
        let mut roles: Vec<String> = self.hosts.keys().cloned().collect();
        roles.sort();
        roles
    }

    pub fn contains_slug(&self, slug: &str) -> bool {
        self.all.iter().any(|h| h.slug() == slug)
    }

    /// Narrow to exactly the host with `slug`, wrapped as a single-host
    /// container. Errors if no host in this container carries that slug.
    pub fn get_from_slug(&self, slug: &str) -> Result<HostsContainer> {
        let host = self
            .all
            .iter()
            .find(|h| h.slug() == slug)
            .ok_or_else(|| FrameworkError::ConstructionError(format!("no host with slug {slug} in this container")))?;
        let mut single = HashMap::new();
        single.insert("host".to_string(), vec![Arc::clone(host)]);
        self.new_with_same_settings(single)
    }

    /// Select the union of the named roles. `"*"` selects every host
    /// regardless of role (§3).
    pub fn filter(&self, roles: &[&str]) -> Result<HostsContainer> {
        let mut selected = HashMap::new();
        for &role in roles {
            let group = if role == ALL_ROLES {
                self.all.clone()
            } else {
                self.hosts.get(role).cloned().unwrap_or_default()
            };
            selected.insert(role.to_string(), group);
        }
        self.new_with_same_settings(selected)
    }

    /// Like `filter`, but requires the result to contain exactly one host.
    pub fn get(&self, roles: &[&str]) -> Result<HostsContainer> {
        let result = self.filter(roles)?;
        if result.len() == 1 {
            result.get_from_slug(result.all[0].slug())
        } else {
            Err(FrameworkError::ConstructionError(format!(
                "expected exactly one host for {:?}, found {}",
                roles,
                result.len()
            )))
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = Result<HostsContainer>> + '_ {
        self.all.iter().map(|h| self.get_from_slug(h.slug()))
    }

    /// Every distinct host in this container, regardless of role (§3 `ALL_HOSTS`).
    pub fn all_hosts(&self) -> Vec<Arc<dyn Host>> {
        self.all.clone()
    }

    pub fn pty_ref(&self) -> PtyRef {
        Arc::clone(&self.pty)
    }

    pub fn logger_ref(&self) -> LoggerRef {
        Arc::clone(&self.logger)
    }

    pub fn is_sandbox(&self) -> bool {
        self.sandbox
    }

    /// Run `command` on every host in this container. Fans out across
    /// `rayon` when there's more than one host and the current pty
    /// advertises auxiliary ptys (§4.5, §4.7); otherwise runs sequentially
    /// in slug order.
    pub fn run(&self, command: &str, options: RunOptions) -> Vec<Result<String>> {
        let pty = &*self.pty;
        let logger = &*self.logger;

        if self.all.len() > 1 && pty.auxiliary_ptys_are_available() {
            self.all
                .par_iter()
                .map(|host| host.run(pty, logger, command, &options))
                .collect()
        } else {
            let thunks: Vec<_> = self
                .all
                .iter()
                .map(|host| {
                    let command = command.to_string();
                    let options = options.clone();
                    move || host.run(pty, logger, &command, &options)
                })
                .collect();
            run_sequential(thunks)
        }
    }

    /// `run()` with the container's own default sandbox posture, for callers
    /// that don't need to override any `RunOptions` field.
    pub fn run_default(&self, command: &str) -> Vec<Result<String>> {
        self.run(command, RunOptions::new().sandbox(self.sandbox))
    }

    pub fn sudo(&self, command: &str, options: RunOptions) -> Vec<Result<String>> {
        self.run(command, options.sudo(true))
    }

    pub fn exists(&self, path: &str, use_sudo: bool) -> Vec<Result<bool>> {
        let pty = &*self.pty;
        let logger = &*self.logger;
        self.all.iter().map(|host| host.exists(pty, logger, path, use_sudo)).collect()
    }

    pub fn has_command(&self, command: &str, use_sudo: bool) -> Vec<bool> {
        let pty = &*self.pty;
        let logger = &*self.logger;
        let check = format!("which '{}'", esc1(command));
        let opts = RunOptions::new().sudo(use_sudo).interactive(false).sandbox(false);
        self.all
            .iter()
            .map(|host| host.run(pty, logger, &check, &opts).is_ok())
            .collect()
    }

    pub fn expand_path(&self, path: &str) -> Vec<Result<String>> {
        self.all.iter().map(|host| host.expand_path(path)).collect()
    }

    /// `cd('/')` then `run("hostname")` on every host (§10.4).
    pub fn hostname(&self) -> Vec<Result<String>> {
        let pty = &*self.pty;
        let logger = &*self.logger;
        let opts = RunOptions::new().interactive(false).sandbox(self.sandbox);
        self.all
            .iter()
            .map(|host| {
                let _cd = host.context().cd("/");
                host.run(pty, logger, "hostname", &opts).map(|out| out.trim().to_string())
            })
            .collect()
    }

    /// `cd('/')` then `run("uname -m")`, true when the output contains
    /// `x86_64` (§10.4).
    pub fn is_64_bit(&self) -> Vec<Result<bool>> {
        let pty = &*self.pty;
        let logger = &*self.logger;
        let opts = RunOptions::new().interactive(false).sandbox(self.sandbox);
        self.all
            .iter()
            .map(|host| {
                let _cd = host.context().cd("/");
                host.run(pty, logger, "uname -m", &opts).map(|out| out.contains("x86_64"))
            })
            .collect()
    }

    /// Push `command` onto every member host's prefix stack; popped from all
    /// of them together when the returned guard drops, including on an
    /// early-return or panicking error path (§4.5, §8 Scenario 6).
    pub fn prefix<'a>(&'a self, command: impl Into<String>) -> CompoundGuard<'a> {
        let command = command.into();
        let guards = self.all.iter().map(|host| ScopedGuard::Prefix(host.context().prefix(command.clone()))).collect();
        CompoundGuard { guards }
    }

    /// Push `path` onto every member host's cd stack (§4.5, §8 Scenario 6).
    pub fn cd<'a>(&'a self, path: impl Into<String>) -> CompoundGuard<'a> {
        let path = path.into();
        let guards = self.all.iter().map(|host| ScopedGuard::Cd(host.context().cd(path.clone()))).collect();
        CompoundGuard { guards }
    }

    /// Push an env frame onto every member host's env stack (§4.5, §8
    /// Scenario 6).
    pub fn env<'a>(&'a self, name: impl Into<String>, value: Option<&str>, escape: bool) -> CompoundGuard<'a> {
        let name = name.into();
        let guards = self.all.iter().map(|host| ScopedGuard::Env(host.context().env(name.clone(), value, escape))).collect();
        CompoundGuard { guards }
    }
}

enum ScopedGuard<'a> {
    Prefix(PrefixGuard<'a>),
    Cd(CdGuard<'a>),
    Env(EnvGuard<'a>),
}

/// One `cd`/`env`/`prefix` guard per member host, dropped together. Holding
/// this alive keeps the frame pushed on every host in the container at once;
/// dropping it (scope exit, early return, or unwind) pops all of them.
pub struct CompoundGuard<'a> {
    guards: Vec<ScopedGuard<'a>>,
}

/// Wraps exactly one host; forwards file-transfer and interactive-shell
/// operations that only make sense with a single target (§4.3, §4.5).
pub struct HostContainer {
    inner: HostsContainer,
}

impl HostContainer {
    pub fn new(inner: HostsContainer) -> Result<Self> {
        if inner.len() != 1 {
            return Err(FrameworkError::ConstructionError(format!(
                "HostContainer requires exactly one host, found {}",
                inner.len()
            )));
        }
        Ok(Self { inner })
    }

    fn host(&self) -> &Arc<dyn Host> {
        &self.inner.all[0]
    }

    pub fn slug(&self) -> &str {
        self.host().slug()
    }

    pub fn run(&self, command: &str, options: RunOptions) -> Result<String> {
        self.inner.run(command, options).into_iter().next().expect("exactly one host")
    }

    pub fn sudo(&self, command: &str, options: RunOptions) -> Result<String> {
        self.inner.sudo(command, options).into_iter().next().expect("exactly one host")
    }

    /// Read the full remote file into memory.
    pub fn get(&self, remote_path: &str, use_sudo: bool, sandbox: bool) -> Result<Vec<u8>> {
        let mut file = self.host().open(&*self.inner.logger, remote_path, FileMode::Read, use_sudo, sandbox)?;
        let mut data = Vec::new();
        loop {
            let chunk = file.read(8192)?;
            if chunk.is_empty() {
                break;
            }
            data.extend_from_slice(&chunk);
        }
        file.close()?;
        Ok(data)
    }

    /// Write `data` to a remote file, via the sudo temp-file dance when
    /// `use_sudo` is set (§4.3).
    pub fn put(&self, remote_path: &str, data: &[u8], use_sudo: bool, sandbox: bool) -> Result<()> {
        let mut file = self.host().open(&*self.inner.logger, remote_path, FileMode::Write, use_sudo, sandbox)?;
        file.write(data)?;
        file.close()
    }

    pub fn open(&self, remote_path: &str, mode: FileMode, use_sudo: bool, sandbox: bool) -> Result<Box<dyn crate::host::RemoteFile>> {
        self.host().open(&*self.inner.logger, remote_path, mode, use_sudo, sandbox)
    }

    pub fn expand_path(&self, path: &str) -> Result<String> {
        self.host().expand_path(path)
    }

    /// Attach the local terminal to this host's interactive shell (§10.4).
    pub fn start_interactive_shell(&self) -> Result<()> {
        self.host().start_interactive_shell(&*self.inner.pty_ref())
    }
}
