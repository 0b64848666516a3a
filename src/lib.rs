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

pub mod config;
pub mod console;
pub mod context;
pub mod error;
pub mod host;
pub mod hosts_container;
pub mod logger;
pub mod node;
pub mod pty;
pub mod role_mapping;

pub use config::{ConnectionMode, RunConfig};
pub use console::{Console, ConsoleRef, RetrySkipAbort, ScriptedConsole, StdConsole};
pub use context::HostContext;
pub use error::{FrameworkError, Result};
pub use host::{FileMode, Host, HostClassId, RemoteFile, RemoteStat, RunOptions};
pub use hosts_container::{HostContainer, HostsContainer};
pub use logger::{Logger, LoggerRef, NullLogger, TerminalLogger};
pub use node::{dispatch_action, iter_isolations, ActionOutcome, DispatchMode, IsolationId, Mapping, NodeKind, NodeSpec};
pub use pty::{DummyPty, LocalTtyPty, Pty, PtyRef};
pub use role_mapping::{DefaultRoleMapping, RoleMapping};
