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

//! Per-host stack of `cwd`/`env`/`prefix` frames applied to every shaped
//! command (§3, §4.1). Not thread-safe by design: each isolation clones its
//! own `HostContext` before it is handed to a worker thread.

use std::cell::RefCell;

/// Single-quote a value for safe embedding in a shell command, replacing
/// each `'` with `'\''` so the shell sees it as an escaped literal quote.
pub fn esc1(value: &str) -> String {
    value.replace('\'', "'\\''")
}

/// Join path components the way `os.path.join` does: a later absolute
/// component discards everything joined before it.
fn path_join(components: &[&str]) -> String {
    let mut result = String::new();
    for component in components {
        if component.starts_with('/') {
            result = component.to_string();
        } else if result.is_empty() {
            result = component.to_string();
        } else {
            if !result.ends_with('/') {
                result.push('/');
            }
            result.push_str(component);
        }
    }
    if result.is_empty() {
        result.push('/');
    }
    result
}

fn normalize_path(path: &str) -> String {
    let absolute = path.starts_with('/');
    let mut stack: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                if stack.last().map(|s| *s != "..").unwrap_or(false) {
                    stack.pop();
                } else if !absolute {
                    stack.push("..");
                }
            }
            other => stack.push(other),
        }
    }
    let joined = stack.join("/");
    if absolute {
        format!("/{}", joined)
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}

#[derive(Default, Debug, Clone)]
struct HostContextState {
    prefixes: Vec<String>,
    paths: Vec<String>,
    env: Vec<(String, String)>,
}

/// The push/pop stack described in §4.1. Uses interior mutability so guard
/// values can be held concurrently with shared access to the context, while
/// still enforcing (at runtime, via `RefCell`) that only one mutation is in
/// flight at a time.
#[derive(Default)]
pub struct HostContext {
    state: RefCell<HostContextState>,
}

impl HostContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deep-clone this context's stacks. Used when a `HostsContainer` forks
    /// isolations onto separate worker threads (§5): each isolation owns an
    /// independent copy rather than sharing the parent's.
    pub fn clone_context(&self) -> HostContext {
        HostContext { state: RefCell::new(self.state.borrow().clone()) }
    }

    pub fn prefix<'a>(&'a self, command: impl Into<String>) -> PrefixGuard<'a> {
        self.state.borrow_mut().prefixes.push(command.into());
        PrefixGuard { ctx: self }
    }

    pub fn cd<'a>(&'a self, path: impl Into<String>) -> CdGuard<'a> {
        self.state.borrow_mut().paths.push(path.into());
        CdGuard { ctx: self }
    }

    /// `value = None` is treated as an empty string, matching §4.1's env()
    /// null handling.
    pub fn env<'a>(&'a self, name: impl Into<String>, value: Option<&str>, escape: bool) -> EnvGuard<'a> {
        let raw = value.unwrap_or("");
        let shaped = if escape { format!("'{}'", esc1(raw)) } else { raw.to_string() };
        self.state.borrow_mut().env.push((name.into(), shaped));
        EnvGuard { ctx: self }
    }

    /// The current working directory: the host's start path joined with
    /// every entry pushed onto the path stack, in push order.
    pub fn cwd(&self, start_path: &str) -> String {
        let state = self.state.borrow();
        let mut components: Vec<&str> = vec![start_path];
        components.extend(state.paths.iter().map(|s| s.as_str()));
        normalize_path(&path_join(&components))
    }

    /// Join the prefix stack with `&&` ahead of `user_command`, per §4.1.
    pub fn with_prefixes(&self, user_command: &str) -> String {
        let state = self.state.borrow();
        if state.prefixes.is_empty() {
            user_command.to_string()
        } else {
            format!("{} && {}", state.prefixes.join(" && "), user_command)
        }
    }

    /// Apply the cd/export wrapping described in §4.1: a directory guard
    /// (plain `cd` normally, an `if [ -d ... ]` guard in sandbox mode),
    /// followed by one `export NAME=VALUE &&` per env frame in push order,
    /// followed by the literal, parenthesized command.
    pub fn shape(&self, start_path: &str, command: &str, sandbox: bool) -> String {
        let cwd = self.cwd(start_path);
        let mut out = String::new();
        if sandbox {
            out.push_str(&format!("if [ -d {cwd} ]; then cd {cwd}; fi && "));
        } else {
            out.push_str(&format!("cd {cwd} && "));
        }
        for (name, value) in self.state.borrow().env.iter() {
            out.push_str(&format!("export {name}={value} && "));
        }
        out.push('(');
        out.push_str(command);
        out.push(')');
        out
    }

    #[cfg(test)]
    fn prefix_count(&self) -> usize {
        self.state.borrow().prefixes.len()
    }
    #[cfg(test)]
    fn path_count(&self) -> usize {
        self.state.borrow().paths.len()
    }
    #[cfg(test)]
    fn env_count(&self) -> usize {
        self.state.borrow().env.len()
    }
}

pub struct PrefixGuard<'a> {
    ctx: &'a HostContext,
}
impl<'a> Drop for PrefixGuard<'a> {
    fn drop(&mut self) {
        self.ctx.state.borrow_mut().prefixes.pop();
    }
}

pub struct CdGuard<'a> {
    ctx: &'a HostContext,
}
impl<'a> Drop for CdGuard<'a> {
    fn drop(&mut self) {
        self.ctx.state.borrow_mut().paths.pop();
    }
}

pub struct EnvGuard<'a> {
    ctx: &'a HostContext,
}
impl<'a> Drop for EnvGuard<'a> {
    fn drop(&mut self) {
        self.ctx.state.borrow_mut().env.pop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_esc1_escapes_single_quotes() {
        assert_eq!(esc1("it's"), "it'\\''s");
        assert_eq!(esc1("plain"), "plain");
    }

    #[test]
    fn test_cwd_joins_start_path_and_stack() {
        let ctx = HostContext::new();
        assert_eq!(ctx.cwd("/home/deploy"), "/home/deploy");
        let _g = ctx.cd("project");
        assert_eq!(ctx.cwd("/home/deploy"), "/home/deploy/project");
    }

    #[test]
    fn test_cd_absolute_anchors() {
        let ctx = HostContext::new();
        let _g1 = ctx.cd("project");
        let _g2 = ctx.cd("/etc");
        assert_eq!(ctx.cwd("/home/deploy"), "/etc");
    }

    #[test]
    fn test_context_balance_after_nested_scopes() {
        let ctx = HostContext::new();
        assert_eq!(ctx.prefix_count(), 0);
        assert_eq!(ctx.path_count(), 0);
        assert_eq!(ctx.env_count(), 0);
        {
            let _p = ctx.prefix("workon venv");
            let _c = ctx.cd("/srv/app");
            let _e = ctx.env("DEBUG", Some("1"), true);
            assert_eq!(ctx.prefix_count(), 1);
            assert_eq!(ctx.path_count(), 1);
            assert_eq!(ctx.env_count(), 1);
        }
        assert_eq!(ctx.prefix_count(), 0);
        assert_eq!(ctx.path_count(), 0);
        assert_eq!(ctx.env_count(), 0);
    }

    #[test]
    fn test_context_balance_survives_panic_unwind() {
        use std::panic;
        let ctx = HostContext::new();
        let result = panic::catch_unwind(|| {
            let _c = ctx.cd("/tmp");
            panic!("boom");
        });
        assert!(result.is_err());
        assert_eq!(ctx.path_count(), 0);
    }

    #[test]
    fn test_env_null_value_becomes_empty_string() {
        let ctx = HostContext::new();
        let _e = ctx.env("FOO", None, true);
        let shaped = ctx.shape("/home/deploy", "echo $FOO", false);
        assert!(shaped.contains("export FOO='' &&"));
    }

    #[test]
    fn test_env_escape_flag() {
        let ctx = HostContext::new();
        let _outer = ctx.env("VAR1", Some("var1"), true);
        let _inner = ctx.env("VAR2", Some("$VAR1"), false);
        let shaped = ctx.shape("/home/deploy", "echo $VAR2", false);
        assert!(shaped.contains("export VAR2=$VAR1 &&"));
        let _inner_escaped = ctx.env("VAR3", Some("$VAR1"), true);
        let shaped2 = ctx.shape("/home/deploy", "echo $VAR3", false);
        assert!(shaped2.contains("export VAR3='$VAR1' &&"));
    }

    #[test]
    fn test_shape_command_order() {
        let ctx = HostContext::new();
        let _e1 = ctx.env("A", Some("1"), true);
        let _e2 = ctx.env("B", Some("2"), true);
        let shaped = ctx.shape("/home/deploy", "echo hi", false);
        let cd_pos = shaped.find("cd /home/deploy").unwrap();
        let a_pos = shaped.find("export A='1'").unwrap();
        let b_pos = shaped.find("export B='2'").unwrap();
        let cmd_pos = shaped.find("(echo hi)").unwrap();
        assert!(cd_pos < a_pos);
        assert!(a_pos < b_pos);
        assert!(b_pos < cmd_pos);
    }

    #[test]
    fn test_shape_command_sandbox_guard() {
        let ctx = HostContext::new();
        let shaped = ctx.shape("/home/deploy", "echo hi", true);
        assert!(shaped.starts_with("if [ -d /home/deploy ]; then cd /home/deploy; fi && "));
    }

    #[test]
    fn test_with_prefixes_joins_in_push_order() {
        let ctx = HostContext::new();
        let _p1 = ctx.prefix("workon venv");
        let _p2 = ctx.prefix("export FOO=bar");
        assert_eq!(ctx.with_prefixes("echo hi"), "workon venv && export FOO=bar && echo hi");
    }

    #[test]
    fn test_clone_context_is_independent() {
        let ctx = HostContext::new();
        let _c = ctx.cd("/tmp");
        let cloned = ctx.clone_context();
        assert_eq!(cloned.path_count(), 1);
        let _c2 = ctx.cd("/var");
        assert_eq!(ctx.path_count(), 2);
        assert_eq!(cloned.path_count(), 1);
    }
}
