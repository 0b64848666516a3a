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

use std::fmt;
use std::error::Error as StdError;
use std::io;

/// Main error type for flotilla operations
#[derive(Debug)]
pub enum FrameworkError {
    /// A remote command returned a nonzero exit status.
    CommandFailed {
        command: String,
        host: String,
        status_code: i32,
        partial_output: String,
    },

    /// Connect / handshake / auth failed. The connection cache drops the
    /// entry so the next call reconnects from scratch.
    ConnectionFailed(String),

    /// The LocalHost sudo password validation (`sudo ls`) failed three times.
    SudoPasswordRejected,

    /// Wraps any error raised inside an action body.
    ActionException(String),

    /// Wraps a failure inside an opaque query callable.
    QueryException(String),

    /// Invalid Host definition, role mapping, duplicate slug, illegal node
    /// nesting, or wrong host count for a PER_HOST_ONE node. Raised at
    /// construction time, never at execution time.
    ConstructionError(String),

    /// IO errors
    Io(io::Error),

    /// SSH transport errors
    Ssh(String),

    /// Other errors
    Other(String),
}

impl fmt::Display for FrameworkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameworkError::CommandFailed { command, host, status_code, .. } =>
                write!(f, "command failed on {}: `{}` exited {}", host, command, status_code),
            FrameworkError::ConnectionFailed(msg) => write!(f, "connection failed: {}", msg),
            FrameworkError::SudoPasswordRejected => write!(f, "sudo password rejected"),
            FrameworkError::ActionException(msg) => write!(f, "action failed: {}", msg),
            FrameworkError::QueryException(msg) => write!(f, "query failed: {}", msg),
            FrameworkError::ConstructionError(msg) => write!(f, "construction error: {}", msg),
            FrameworkError::Io(err) => write!(f, "IO error: {}", err),
            FrameworkError::Ssh(msg) => write!(f, "SSH error: {}", msg),
            FrameworkError::Other(msg) => write!(f, "error: {}", msg),
        }
    }
}

impl StdError for FrameworkError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            FrameworkError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl FrameworkError {
    /// Partial output captured before a `CommandFailed`, if any.
    pub fn partial_output(&self) -> Option<&str> {
        match self {
            FrameworkError::CommandFailed { partial_output, .. } => Some(partial_output),
            _ => None,
        }
    }

    pub fn is_command_failed(&self) -> bool {
        matches!(self, FrameworkError::CommandFailed { .. })
    }
}

impl From<io::Error> for FrameworkError {
    fn from(err: io::Error) -> Self {
        FrameworkError::Io(err)
    }
}

impl From<russh::Error> for FrameworkError {
    fn from(err: russh::Error) -> Self {
        FrameworkError::Ssh(err.to_string())
    }
}

impl From<String> for FrameworkError {
    fn from(err: String) -> Self {
        FrameworkError::Other(err)
    }
}

impl From<&str> for FrameworkError {
    fn from(err: &str) -> Self {
        FrameworkError::Other(err.to_string())
    }
}

/// Result type alias for flotilla operations
pub type Result<T> = std::result::Result<T, FrameworkError>;

/// Helper trait to attach context to a bare String error.
pub trait ErrorContext<T> {
    fn context(self, context: &str) -> Result<T>;
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ErrorContext<T> for std::result::Result<T, String> {
    fn context(self, context: &str) -> Result<T> {
        self.map_err(|e| FrameworkError::Other(format!("{}: {}", context, e)))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| FrameworkError::Other(format!("{}: {}", f(), e)))
    }
}

impl<T> ErrorContext<T> for std::result::Result<T, io::Error> {
    fn context(self, context: &str) -> Result<T> {
        self.map_err(|e| FrameworkError::Other(format!("{}: {}", context, e)))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| FrameworkError::Other(format!("{}: {}", f(), e)))
    }
}
