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

//! End-to-end exercise of `HostsContainer` and the node dispatcher against
//! the fake transport in `tests/common`, mirroring the teacher's
//! `tests/connection/local.rs` integration-style layout.

mod common;

use std::collections::HashMap;
use std::sync::Arc;

use flotilla::{DispatchMode, DummyPty, HostsContainer, IsolationId, Mapping, NodeSpec, NullLogger, ScriptedConsole};

use common::FakeHost;

fn container(hosts: Vec<Arc<dyn flotilla::Host>>) -> HostsContainer {
    let mut roles = HashMap::new();
    roles.insert("host".to_string(), hosts);
    HostsContainer::new(roles, Arc::new(DummyPty::default()), Arc::new(NullLogger), false).unwrap()
}

#[test]
fn test_fleet_wide_run_reaches_every_host() {
    let parent = container(vec![FakeHost::new("web1"), FakeHost::new("web2"), FakeHost::new("db1")]);
    let outputs: Vec<String> = parent.run_default("uptime").into_iter().map(|r| r.unwrap()).collect();
    assert_eq!(outputs.len(), 3);
    assert!(outputs.contains(&"web1:uptime".to_string()));
    assert!(outputs.contains(&"db1:uptime".to_string()));
}

#[test]
fn test_per_host_array_dispatch_runs_every_isolation_independently() {
    let parent = container(vec![FakeHost::new("web1"), FakeHost::new("web2")]);
    let node = NodeSpec::per_host_array(Mapping::Default);
    let console = ScriptedConsole::new(vec![]);

    let outcomes = flotilla::dispatch_action(&node, DispatchMode::Normal, &parent, &IsolationId::root(), &console, &NullLogger, |iso| {
        iso.hosts.run_default("deploy").into_iter().next().unwrap()
    })
    .unwrap();

    let ran: Vec<String> = outcomes.into_iter().map(|o| o.into_ran()).collect();
    assert!(ran.contains(&"web1:deploy".to_string()));
    assert!(ran.contains(&"web2:deploy".to_string()));
}

#[test]
fn test_isolate_one_only_narrows_to_operator_choice() {
    let parent = container(vec![FakeHost::new("web1"), FakeHost::new("web2"), FakeHost::new("web3")]);
    let node = NodeSpec::per_host_array(Mapping::Default);
    let console = ScriptedConsole::new(vec!["3"]);

    let outcomes = flotilla::dispatch_action(
        &node,
        DispatchMode::IsolateOneOnly,
        &parent,
        &IsolationId::root(),
        &console,
        &NullLogger,
        |iso| iso.hosts.run_default("deploy").into_iter().next().unwrap(),
    )
    .unwrap();

    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes.into_iter().next().unwrap().into_ran(), "web3:deploy");
}

#[test]
fn test_failed_isolation_aborts_whole_dispatch_on_noninteractive_pty() {
    let parent = container(vec![FakeHost::flaky("web1", 99)]);
    let node = NodeSpec::per_host_array(Mapping::Default);
    let console = ScriptedConsole::new(vec![]);

    let result = flotilla::dispatch_action(&node, DispatchMode::Normal, &parent, &IsolationId::root(), &console, &NullLogger, |iso| {
        iso.hosts.run_default("deploy").into_iter().next().unwrap()
    });

    assert!(result.is_err());
}
