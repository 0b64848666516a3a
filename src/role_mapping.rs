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

//! Defines which hosts a child `Node` inherits from its parent, and under
//! which role names (§3, §4.6).

use std::collections::HashMap;

use crate::error::Result;
use crate::hosts_container::HostsContainer;

/// What a single child role is built from: a named subset of the parent's
/// roles, or every host the parent has regardless of role.
#[derive(Debug, Clone)]
pub enum RoleSource {
    Roles(Vec<String>),
    AllHosts,
}

/// A role mapping: child role name -> where its hosts come from in the
/// parent. Equivalent to Python's `@map_roles(...)` decorator, built instead
/// as plain data attached to a `Node`.
#[derive(Debug, Clone, Default)]
pub struct RoleMapping {
    mappings: HashMap<String, RoleSource>,
}

impl RoleMapping {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `child_role` to the union of `parent_roles` in the parent container.
    pub fn map_roles(mut self, child_role: impl Into<String>, parent_roles: &[&str]) -> Self {
        self.mappings.insert(
            child_role.into(),
            RoleSource::Roles(parent_roles.iter().map(|s| s.to_string()).collect()),
        );
        self
    }

    /// Map `child_role` to every host the parent has, regardless of role.
    pub fn map_all_hosts(mut self, child_role: impl Into<String>) -> Self {
        self.mappings.insert(child_role.into(), RoleSource::AllHosts);
        self
    }

    /// Shorthand matching the common case of a single unnamed mapping,
    /// which Python calls simply `host`.
    pub fn map_default(parent_roles: &[&str]) -> Self {
        Self::new().map_roles("host", parent_roles)
    }

    pub fn apply(&self, parent: &HostsContainer) -> Result<HostsContainer> {
        let mut hosts = HashMap::new();
        for (role, source) in &self.mappings {
            let group = match source {
                RoleSource::AllHosts => parent.all_hosts(),
                RoleSource::Roles(roles) => {
                    let refs: Vec<&str> = roles.iter().map(|s| s.as_str()).collect();
                    parent.filter(&refs)?.all_hosts()
                }
            };
            hosts.insert(role.clone(), group);
        }
        HostsContainer::new(hosts, parent.pty_ref(), parent.logger_ref(), parent.is_sandbox())
    }
}

/// Take the parent's `HostsContainer` unchanged: every role and every host
/// passes straight through to the child.
#[derive(Debug, Clone, Default)]
pub struct DefaultRoleMapping;

impl DefaultRoleMapping {
    pub fn apply(&self, parent: &HostsContainer) -> HostsContainer {
        parent.clone()
    }
}
