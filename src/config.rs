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

//! Programmatic configuration surface. The only *file*-based configuration
//! this crate reads is the user's `~/.ssh/config`; everything else is set up
//! through this builder.

/// How a run connects to its hosts by default.
#[derive(Clone, Debug, PartialEq)]
pub enum ConnectionMode {
    Local,
    Ssh,
}

/// Top level, consuming-builder configuration for a run.
#[derive(Clone, Debug)]
pub struct RunConfig {
    pub default_user: String,
    pub default_port: u16,
    pub connect_timeout_secs: u64,
    pub keepalive_interval_secs: u64,
    pub honor_ssh_config_file: bool,
    pub reject_unknown_hosts: bool,
    pub sandbox: bool,
    pub threads: usize,
    pub connection_mode: ConnectionMode,
    pub forward_agent: bool,
    pub login_password: Option<String>,
    pub private_key_file: Option<String>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            default_user: String::from("root"),
            default_port: 22,
            connect_timeout_secs: 30,
            keepalive_interval_secs: 30,
            honor_ssh_config_file: true,
            reject_unknown_hosts: false,
            sandbox: false,
            threads: num_threads_default(),
            connection_mode: ConnectionMode::Ssh,
            forward_agent: false,
            login_password: None,
            private_key_file: None,
        }
    }
}

fn num_threads_default() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

impl RunConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.default_user = user.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.default_port = port;
        self
    }

    pub fn connect_timeout_secs(mut self, secs: u64) -> Self {
        self.connect_timeout_secs = secs;
        self
    }

    pub fn keepalive_interval_secs(mut self, secs: u64) -> Self {
        self.keepalive_interval_secs = secs;
        self
    }

    pub fn honor_ssh_config_file(mut self, honor: bool) -> Self {
        self.honor_ssh_config_file = honor;
        self
    }

    pub fn reject_unknown_hosts(mut self, reject: bool) -> Self {
        self.reject_unknown_hosts = reject;
        self
    }

    pub fn sandbox(mut self, sandbox: bool) -> Self {
        self.sandbox = sandbox;
        self
    }

    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    pub fn connection_mode(mut self, mode: ConnectionMode) -> Self {
        self.connection_mode = mode;
        self
    }

    pub fn local(mut self) -> Self {
        self.connection_mode = ConnectionMode::Local;
        self
    }

    pub fn ssh(mut self) -> Self {
        self.connection_mode = ConnectionMode::Ssh;
        self
    }

    pub fn forward_agent(mut self, forward: bool) -> Self {
        self.forward_agent = forward;
        self
    }

    pub fn login_password(mut self, password: impl Into<String>) -> Self {
        self.login_password = Some(password.into());
        self
    }

    pub fn private_key_file(mut self, path: impl Into<String>) -> Self {
        self.private_key_file = Some(path.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = RunConfig::new();
        assert_eq!(cfg.default_port, 22);
        assert_eq!(cfg.connection_mode, ConnectionMode::Ssh);
        assert!(!cfg.reject_unknown_hosts);
        assert!(cfg.threads >= 1);
    }

    #[test]
    fn test_builder_chain() {
        let cfg = RunConfig::new().user("deploy").port(2222).sandbox(true).threads(4);
        assert_eq!(cfg.default_user, "deploy");
        assert_eq!(cfg.default_port, 2222);
        assert!(cfg.sandbox);
        assert_eq!(cfg.threads, 4);
    }

    #[test]
    fn test_local_and_ssh_switch() {
        let cfg = RunConfig::new().local();
        assert_eq!(cfg.connection_mode, ConnectionMode::Local);
        let cfg = cfg.ssh();
        assert_eq!(cfg.connection_mode, ConnectionMode::Ssh);
    }
}
