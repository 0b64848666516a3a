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

//! Isolation expansion and the action dispatcher (§4.6, §4.7): turning a
//! per-host node into one `HostsContainer` per host, then running a closure
//! over every isolation with Retry/Skip/Abort on failure.

use std::collections::HashMap;
use std::sync::Arc;

use rayon::prelude::*;

use crate::console::{Console, RetrySkipAbort};
use crate::error::{FrameworkError, Result};
use crate::host::Host;
use crate::hosts_container::HostsContainer;
use crate::logger::Logger;
use crate::role_mapping::{DefaultRoleMapping, RoleMapping};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// Runs once against whatever `HostsContainer` it's handed.
    Normal,
    /// Isolates into one instance per host, indexed by position.
    PerHostArray,
    /// Like `PerHostArray`, but requires exactly one host.
    PerHostOne,
}

/// How a node turns its parent's `HostsContainer` into its own.
pub enum Mapping {
    Default,
    Custom(RoleMapping),
}

impl Mapping {
    fn apply(&self, parent: &HostsContainer) -> Result<HostsContainer> {
        match self {
            Mapping::Default => Ok(DefaultRoleMapping.apply(parent)),
            Mapping::Custom(m) => m.apply(parent),
        }
    }
}

pub struct NodeSpec {
    pub kind: NodeKind,
    pub mapping: Mapping,
    /// The role name holding the host(s) to isolate over; `"host"` unless
    /// the node was built with a custom mapping naming something else.
    pub host_role: String,
}

impl NodeSpec {
    pub fn normal(mapping: Mapping) -> Self {
        Self { kind: NodeKind::Normal, mapping, host_role: "host".to_string() }
    }
    pub fn per_host_array(mapping: Mapping) -> Self {
        Self { kind: NodeKind::PerHostArray, mapping, host_role: "host".to_string() }
    }
    pub fn per_host_one(mapping: Mapping) -> Self {
        Self { kind: NodeKind::PerHostOne, mapping, host_role: "host".to_string() }
    }
}

/// Identifies one isolated instance for display (`node.path[slug]`, §4.6).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct IsolationId(Vec<String>);

impl IsolationId {
    pub fn root() -> Self {
        IsolationId(Vec::new())
    }

    pub fn push(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.0.clone();
        segments.push(segment.into());
        IsolationId(segments)
    }

    pub fn display(&self) -> String {
        self.0.join("/")
    }
}

#[derive(Clone)]
pub struct Isolation {
    pub id: IsolationId,
    pub hosts: HostsContainer,
}

/// Expand `node` against `parent_hosts`, nested under `parent_id` (§4.6).
///
/// - `Normal`: one isolation, the mapped container unchanged, identifier
///   inherited from the parent.
/// - `PerHostArray` / `PerHostOne`: one isolation per host in `host_role`, in
///   declaration order, each a fresh container with that role narrowed to
///   exactly that host and every other role passed through unchanged.
pub fn iter_isolations(node: &NodeSpec, parent_hosts: &HostsContainer, parent_id: &IsolationId) -> Result<Vec<Isolation>> {
    let mapped = node.mapping.apply(parent_hosts)?;

    match node.kind {
        NodeKind::Normal => Ok(vec![Isolation { id: parent_id.clone(), hosts: mapped }]),

        NodeKind::PerHostArray | NodeKind::PerHostOne => {
            let host_group = mapped.filter(&[node.host_role.as_str()])?;
            let hosts = host_group.all_hosts();

            if node.kind == NodeKind::PerHostOne && hosts.len() != 1 {
                return Err(FrameworkError::ConstructionError(format!(
                    "PER_HOST_ONE node requires exactly one host in role '{}', found {}",
                    node.host_role,
                    hosts.len()
                )));
            }

            let mut out = Vec::with_capacity(hosts.len());
            for (index, host) in hosts.iter().enumerate() {
                out.push(isolate_single_host(&mapped, node, host, parent_id, index)?);
            }
            Ok(out)
        }
    }
}

fn isolate_single_host(
    mapped: &HostsContainer,
    node: &NodeSpec,
    host: &Arc<dyn Host>,
    parent_id: &IsolationId,
    index: usize,
) -> Result<Isolation> {
    let mut roles: HashMap<String, Vec<Arc<dyn Host>>> = HashMap::new();
    for role in mapped.roles() {
        if role == node.host_role {
            roles.insert(role, vec![Arc::clone(host)]);
        } else {
            roles.insert(role.clone(), mapped.filter(&[role.as_str()])?.all_hosts());
        }
    }
    let hosts = HostsContainer::new(roles, mapped.pty_ref(), mapped.logger_ref(), mapped.is_sandbox())?;
    let id = match node.kind {
        NodeKind::PerHostOne => parent_id.push(host.slug()),
        _ => parent_id.push(index.to_string()),
    };
    Ok(Isolation { id, hosts })
}

/// Governs how the dispatcher treats a node with more than one isolation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// Fan out to every isolation.
    Normal,
    /// Prompt the console to pick exactly one isolation to run.
    IsolateOneOnly,
    /// Skip isolation expansion entirely; run the mapped container as-is.
    DontIsolateYet,
}

/// A per-isolation action result: either it ran, or the operator chose to
/// skip it after a `CommandFailed`. Accessing the value of a skipped result
/// panics — matching the "raises on any attribute access" sentinel from the
/// original design, so a silently-missing value can never leak downstream.
pub enum ActionOutcome<T> {
    Ran(T),
    Skipped,
}

impl<T> ActionOutcome<T> {
    pub fn is_skipped(&self) -> bool {
        matches!(self, ActionOutcome::Skipped)
    }

    pub fn into_ran(self) -> T {
        match self {
            ActionOutcome::Ran(v) => v,
            ActionOutcome::Skipped => panic!("accessed the result of a skipped isolation"),
        }
    }
}

/// Dispatch `action` over every isolation of `node`, per §4.7.
pub fn dispatch_action<F, T>(
    node: &NodeSpec,
    mode: DispatchMode,
    parent_hosts: &HostsContainer,
    parent_id: &IsolationId,
    console: &dyn Console,
    logger: &dyn Logger,
    action: F,
) -> Result<Vec<ActionOutcome<T>>>
where
    F: Fn(&Isolation) -> Result<T> + Sync,
    T: Send,
{
    let isolations = if node.kind != NodeKind::Normal && mode != DispatchMode::DontIsolateYet {
        iter_isolations(node, parent_hosts, parent_id)?
    } else {
        vec![Isolation { id: parent_id.clone(), hosts: node.mapping.apply(parent_hosts)? }]
    };

    if isolations.is_empty() {
        logger.info("nothing to do");
        return Ok(Vec::new());
    }

    if isolations.len() == 1 {
        return Ok(vec![run_isolation_with_retry(&isolations[0], console, logger, &action)?]);
    }

    if mode == DispatchMode::IsolateOneOnly {
        let labels: Vec<String> = isolations.iter().map(|iso| iso.id.display()).collect();
        let picked = console.choice("Select isolation", &labels, 0, true);
        return Ok(vec![run_isolation_with_retry(&isolations[picked], console, logger, &action)?]);
    }

    let can_fan_out = isolations[0].hosts.pty_ref().auxiliary_ptys_are_available();
    if can_fan_out {
        isolations.par_iter().map(|iso| run_isolation_with_retry(iso, console, logger, &action)).collect()
    } else {
        isolations.iter().map(|iso| run_isolation_with_retry(iso, console, logger, &action)).collect()
    }
}

fn run_isolation_with_retry<F, T>(iso: &Isolation, console: &dyn Console, logger: &dyn Logger, action: &F) -> Result<ActionOutcome<T>>
where
    F: Fn(&Isolation) -> Result<T>,
{
    let interactive = iso.hosts.pty_ref().is_interactive();
    loop {
        match action(iso) {
            Ok(v) => return Ok(ActionOutcome::Ran(v)),
            Err(e) if e.is_command_failed() && interactive => match console.retry_skip_abort(&e.to_string()) {
                RetrySkipAbort::Retry => continue,
                RetrySkipAbort::Skip => return Ok(ActionOutcome::Skipped),
                RetrySkipAbort::Abort => {
                    logger.log_exception(&e.to_string());
                    return Err(FrameworkError::ActionException(e.to_string()));
                }
            },
            Err(e) => {
                logger.log_exception(&e.to_string());
                return Err(FrameworkError::ActionException(e.to_string()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::console::ScriptedConsole;
    use crate::context::HostContext;
    use crate::host::{FileMode, HostClassId, RemoteFile, RunOptions};
    use crate::logger::NullLogger;
    use crate::pty::DummyPty;

    struct FakeHost {
        slug: String,
        class: HostClassId,
        context: HostContext,
        fail_times: std::sync::atomic::AtomicUsize,
    }

    impl FakeHost {
        fn new(slug: &str) -> Arc<dyn Host> {
            Arc::new(FakeHost {
                slug: slug.to_string(),
                class: HostClassId::new(slug),
                context: HostContext::new(),
                fail_times: std::sync::atomic::AtomicUsize::new(0),
            })
        }

        fn flaky(slug: &str, fail_times: usize) -> Arc<dyn Host> {
            Arc::new(FakeHost {
                slug: slug.to_string(),
                class: HostClassId::new(slug),
                context: HostContext::new(),
                fail_times: std::sync::atomic::AtomicUsize::new(fail_times),
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
        fn run(&self, _pty: &dyn crate::pty::Pty, _logger: &dyn Logger, command: &str, _options: &RunOptions) -> Result<String> {
            use std::sync::atomic::Ordering;
            let remaining = self.fail_times.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_times.store(remaining - 1, Ordering::SeqCst);
                return Err(crate::host::command_failed(command, &self.slug, 1, ""));
            }
            Ok(format!("{}:{}", self.slug, command))
        }
        fn open(&self, _logger: &dyn Logger, _remote_path: &str, _mode: FileMode, _use_sudo: bool, _sandbox: bool) -> Result<Box<dyn RemoteFile>> {
            Err(FrameworkError::Other("unsupported".to_string()))
        }
    }

    /// A pty that reports itself as interactive but never offers auxiliary
    /// ptys, so isolation fan-out in these tests stays deterministically
    /// sequential while still exercising the Retry/Skip/Abort prompt path.
    struct InteractiveNoFanoutPty;
    impl crate::pty::Pty for InteractiveNoFanoutPty {
        fn size(&self) -> (u16, u16) {
            (80, 24)
        }
        fn term(&self) -> &str {
            "xterm"
        }
        fn auxiliary_ptys_are_available(&self) -> bool {
            false
        }
        fn is_interactive(&self) -> bool {
            true
        }
    }

    fn container_with(hosts: Vec<Arc<dyn Host>>, interactive_pty: bool) -> HostsContainer {
        let mut map = HashMap::new();
        map.insert("host".to_string(), hosts);
        let pty: Arc<dyn crate::pty::Pty> = if interactive_pty { Arc::new(InteractiveNoFanoutPty) } else { Arc::new(DummyPty::default()) };
        HostsContainer::new(map, pty, Arc::new(NullLogger), false).unwrap()
    }

    #[test]
    fn test_per_host_array_isolates_one_per_host() {
        let parent = container_with(vec![FakeHost::new("web1"), FakeHost::new("web2")], false);
        let node = NodeSpec::per_host_array(Mapping::Default);
        let isolations = iter_isolations(&node, &parent, &IsolationId::root()).unwrap();
        assert_eq!(isolations.len(), 2);
        assert_eq!(isolations[0].id.display(), "0");
        assert_eq!(isolations[1].id.display(), "1");
    }

    #[test]
    fn test_per_host_one_rejects_multiple_hosts() {
        let parent = container_with(vec![FakeHost::new("web1"), FakeHost::new("web2")], false);
        let node = NodeSpec::per_host_one(Mapping::Default);
        let result = iter_isolations(&node, &parent, &IsolationId::root());
        assert!(result.is_err());
    }

    #[test]
    fn test_per_host_one_accepts_single_host() {
        let parent = container_with(vec![FakeHost::new("db1")], false);
        let node = NodeSpec::per_host_one(Mapping::Default);
        let isolations = iter_isolations(&node, &parent, &IsolationId::root()).unwrap();
        assert_eq!(isolations.len(), 1);
        assert_eq!(isolations[0].id.display(), "db1");
    }

    #[test]
    fn test_normal_node_does_not_isolate() {
        let parent = container_with(vec![FakeHost::new("web1"), FakeHost::new("web2")], false);
        let node = NodeSpec::normal(Mapping::Default);
        let isolations = iter_isolations(&node, &parent, &IsolationId::root()).unwrap();
        assert_eq!(isolations.len(), 1);
        assert_eq!(isolations[0].hosts.len(), 2);
    }

    #[test]
    fn test_dispatch_empty_isolations_returns_empty() {
        let parent = container_with(vec![], false);
        let node = NodeSpec::per_host_array(Mapping::Default);
        let console = ScriptedConsole::new(vec![]);
        let result = dispatch_action(&node, DispatchMode::Normal, &parent, &IsolationId::root(), &console, &NullLogger, |iso| {
            iso.hosts.run_default("echo hi").into_iter().next().unwrap()
        })
        .unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn test_dispatch_single_isolation_runs_in_place() {
        let parent = container_with(vec![FakeHost::new("web1")], false);
        let node = NodeSpec::per_host_array(Mapping::Default);
        let console = ScriptedConsole::new(vec![]);
        let outcomes = dispatch_action(&node, DispatchMode::Normal, &parent, &IsolationId::root(), &console, &NullLogger, |iso| {
            iso.hosts.run_default("echo hi").into_iter().next().unwrap()
        })
        .unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes.into_iter().next().unwrap().into_ran(), "web1:echo hi");
    }

    #[test]
    fn test_dispatch_retry_then_succeed() {
        let parent = container_with(vec![FakeHost::flaky("web1", 1)], true);
        let node = NodeSpec::per_host_array(Mapping::Default);
        let console = ScriptedConsole::new(vec!["r"]);
        let outcomes = dispatch_action(&node, DispatchMode::Normal, &parent, &IsolationId::root(), &console, &NullLogger, |iso| {
            iso.hosts.run_default("flaky").into_iter().next().unwrap()
        })
        .unwrap();
        assert_eq!(outcomes.into_iter().next().unwrap().into_ran(), "web1:flaky");
    }

    #[test]
    fn test_dispatch_skip_produces_skipped_outcome() {
        let parent = container_with(vec![FakeHost::flaky("web1", 99)], true);
        let node = NodeSpec::per_host_array(Mapping::Default);
        let console = ScriptedConsole::new(vec!["s"]);
        let outcomes = dispatch_action(&node, DispatchMode::Normal, &parent, &IsolationId::root(), &console, &NullLogger, |iso| {
            iso.hosts.run_default("flaky").into_iter().next().unwrap()
        })
        .unwrap();
        assert!(outcomes.into_iter().next().unwrap().is_skipped());
    }

    #[test]
    fn test_dispatch_abort_on_noninteractive_pty_returns_error_immediately() {
        let parent = container_with(vec![FakeHost::flaky("web1", 99)], false);
        let node = NodeSpec::per_host_array(Mapping::Default);
        let console = ScriptedConsole::new(vec![]);
        let result = dispatch_action(&node, DispatchMode::Normal, &parent, &IsolationId::root(), &console, &NullLogger, |iso| {
            iso.hosts.run_default("flaky").into_iter().next().unwrap()
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_isolate_one_only_prompts_and_runs_chosen() {
        let parent = container_with(vec![FakeHost::new("web1"), FakeHost::new("web2")], false);
        let node = NodeSpec::per_host_array(Mapping::Default);
        let console = ScriptedConsole::new(vec!["2"]);
        let outcomes = dispatch_action(&node, DispatchMode::IsolateOneOnly, &parent, &IsolationId::root(), &console, &NullLogger, |iso| {
            iso.hosts.run_default("echo hi").into_iter().next().unwrap()
        })
        .unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes.into_iter().next().unwrap().into_ran(), "web2:echo hi");
    }
}
