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

use std::sync::Arc;
use inline_colorization::{color_red, color_green, color_yellow, color_reset};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

/// A single logged run of a command, scoped to its lifetime.
pub trait RunLogEntry: Send {
    fn log_io(&mut self, bytes: &[u8]);
    fn set_status_code(&mut self, code: i32);
}

/// A single logged file transfer, scoped to its lifetime.
pub trait FileLogEntry: Send {
    fn complete(&mut self, success: bool);
}

/// A single logged fork (one isolation's worker), scoped to its lifetime.
pub trait ForkLogEntry: Send {
    fn set_succeeded(&mut self);
    fn set_failed(&mut self, err: &str);
}

/// The sink every host/dispatcher call reports activity through. Mirrors the
/// shape the rest of this corpus uses for output handlers: required hooks for
/// the things that happen on every call, default no-ops for the rest.
pub trait Logger: Send + Sync {
    fn log_run(&self, host: &str, command: &str, use_sudo: bool, sandboxing: bool, interactive: bool) -> Box<dyn RunLogEntry>;
    fn log_file(&self, host: &str, mode: &str, remote_path: &str, use_sudo: bool, sandboxing: bool) -> Box<dyn FileLogEntry>;
    fn log_fork(&self, label: &str) -> Box<dyn ForkLogEntry>;
    fn log_exception(&self, err: &str);

    fn log(&self, level: LogLevel, message: &str);
    fn debug(&self, message: &str) { self.log(LogLevel::Debug, message); }
    fn info(&self, message: &str) { self.log(LogLevel::Info, message); }
    fn warning(&self, message: &str) { self.log(LogLevel::Warning, message); }
    fn error(&self, message: &str) { self.log(LogLevel::Error, message); }
}

pub type LoggerRef = Arc<dyn Logger>;

/// A no-op logger satisfying the full contract. Used by default in sandbox
/// mode and by tests that don't care about output.
pub struct NullLogger;

struct NullEntry;
impl RunLogEntry for NullEntry {
    fn log_io(&mut self, _bytes: &[u8]) {}
    fn set_status_code(&mut self, _code: i32) {}
}
impl FileLogEntry for NullEntry {
    fn complete(&mut self, _success: bool) {}
}
impl ForkLogEntry for NullEntry {
    fn set_succeeded(&mut self) {}
    fn set_failed(&mut self, _err: &str) {}
}

impl Logger for NullLogger {
    fn log_run(&self, _host: &str, _command: &str, _use_sudo: bool, _sandboxing: bool, _interactive: bool) -> Box<dyn RunLogEntry> {
        Box::new(NullEntry)
    }
    fn log_file(&self, _host: &str, _mode: &str, _remote_path: &str, _use_sudo: bool, _sandboxing: bool) -> Box<dyn FileLogEntry> {
        Box::new(NullEntry)
    }
    fn log_fork(&self, _label: &str) -> Box<dyn ForkLogEntry> {
        Box::new(NullEntry)
    }
    fn log_exception(&self, _err: &str) {}
    fn log(&self, _level: LogLevel, _message: &str) {}
}

/// Terminal logger: banners via the same markdown-terminal renderer the rest
/// of the crate uses, color-coded status lines.
pub struct TerminalLogger {
    pub verbosity: u32,
}

impl TerminalLogger {
    pub fn new(verbosity: u32) -> Self {
        Self { verbosity }
    }
}

struct TerminalRunEntry {
    host: String,
    command: String,
    status_code: Option<i32>,
}

impl RunLogEntry for TerminalRunEntry {
    fn log_io(&mut self, bytes: &[u8]) {
        use std::io::Write;
        let _ = std::io::stdout().write_all(bytes);
    }
    fn set_status_code(&mut self, code: i32) {
        self.status_code = Some(code);
    }
}

impl Drop for TerminalRunEntry {
    fn drop(&mut self) {
        match self.status_code {
            Some(0) => println!("{color_green}[ok]{color_reset} {}: {}", self.host, self.command),
            Some(n) => println!("{color_red}[exit {n}]{color_reset} {}: {}", self.host, self.command),
            None => {}
        }
    }
}

struct TerminalFileEntry {
    host: String,
    remote_path: String,
}

impl FileLogEntry for TerminalFileEntry {
    fn complete(&mut self, success: bool) {
        if success {
            println!("{color_green}[ok]{color_reset} {}: {}", self.host, self.remote_path);
        } else {
            println!("{color_red}[failed]{color_reset} {}: {}", self.host, self.remote_path);
        }
    }
}

struct TerminalForkEntry {
    label: String,
}

impl ForkLogEntry for TerminalForkEntry {
    fn set_succeeded(&mut self) {
        println!("{color_green}[fork ok]{color_reset} {}", self.label);
    }
    fn set_failed(&mut self, err: &str) {
        println!("{color_red}[fork failed]{color_reset} {}: {}", self.label, err);
    }
}

impl Logger for TerminalLogger {
    fn log_run(&self, host: &str, command: &str, use_sudo: bool, sandboxing: bool, _interactive: bool) -> Box<dyn RunLogEntry> {
        if self.verbosity > 0 {
            let tag = if use_sudo { " (sudo)" } else { "" };
            let sbx = if sandboxing { " [sandbox]" } else { "" };
            println!("running on {}{}{}: {}", host, tag, sbx, command);
        }
        Box::new(TerminalRunEntry { host: host.to_string(), command: command.to_string(), status_code: None })
    }

    fn log_file(&self, host: &str, mode: &str, remote_path: &str, _use_sudo: bool, _sandboxing: bool) -> Box<dyn FileLogEntry> {
        if self.verbosity > 0 {
            println!("opening {} on {} ({})", remote_path, host, mode);
        }
        Box::new(TerminalFileEntry { host: host.to_string(), remote_path: remote_path.to_string() })
    }

    fn log_fork(&self, label: &str) -> Box<dyn ForkLogEntry> {
        Box::new(TerminalForkEntry { label: label.to_string() })
    }

    fn log_exception(&self, err: &str) {
        println!("{color_red}[exception]{color_reset} {}", err);
    }

    fn log(&self, level: LogLevel, message: &str) {
        let stamp = chrono::Local::now().format("%H:%M:%S");
        match level {
            LogLevel::Debug if self.verbosity >= 3 => println!("{stamp} DEBUG: {}", message),
            LogLevel::Info if self.verbosity >= 1 => println!("{stamp} INFO: {}", message),
            LogLevel::Warning => println!("{stamp} {color_yellow}WARNING{color_reset}: {}", message),
            LogLevel::Error => eprintln!("{stamp} {color_red}ERROR{color_reset}: {}", message),
            _ => {}
        }
    }
}
