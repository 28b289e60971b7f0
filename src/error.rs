/*
 * linpama - Package transaction engine for Arch Linux front ends.
 * Copyright (C) 2025  linpama contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! Error types shared by the search and transaction halves of the engine.

use std::fmt;
use thiserror::Error;

/// Main error type for linpama operations
#[derive(Debug, Error)]
pub enum LinpamaError {
    /// A child process could not be started
    #[error("Failed to start '{program}': {reason}")]
    SpawnFailed { program: String, reason: String },

    /// A child process ran but exited unsuccessfully
    #[error("'{program}' exited with {}", describe_exit(.code))]
    NonZeroExit { program: String, code: Option<i32> },

    /// AUR clone failed or produced no build recipe
    #[error("Failed to fetch sources for '{package}': {reason}")]
    SourceFetchFailed { package: String, reason: String },

    /// Operator declined the build recipe
    #[error("Build recipe for '{package}' was rejected during review")]
    ReviewRejected { package: String },

    /// Credential missing, rejected or escalation setup failed
    #[error("Authentication failed: {reason}")]
    AuthenticationFailed { reason: String },

    /// Remote lookup did not answer in time
    #[error("Request to {url} timed out after {timeout_secs}s")]
    NetworkTimeout { url: String, timeout_secs: u64 },

    /// Remote lookup failed for another reason
    #[error("Network error for {url}: {message}")]
    Network {
        url: String,
        message: String,
        #[source]
        source: Option<reqwest::Error>,
    },

    /// Malformed line in package index output
    #[error("Unparseable index line {line}: '{content}'")]
    ParseError { line: usize, content: String },

    /// An intent was submitted while another transaction is active
    #[error("Another transaction is active ({active})")]
    TransactionBusy { active: String },

    /// A supervisor action that does not apply to the current state
    #[error("Cannot {action} while {state}")]
    InvalidTransition { action: &'static str, state: String },

    /// Package name that is not a valid pacman package name
    #[error("Invalid package name '{name}'")]
    InvalidPackageName { name: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    /// File system errors
    #[error("File system error for '{path}': {message}")]
    FileSystem {
        path: String,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {}", code),
        None => "a signal".to_string(),
    }
}

/// Coarse classification of [`LinpamaError`], cheap to copy into snapshots and events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    SpawnFailed,
    NonZeroExit,
    SourceFetchFailed,
    ReviewRejected,
    AuthenticationFailed,
    NetworkTimeout,
    Network,
    ParseError,
    TransactionBusy,
    InvalidTransition,
    InvalidPackageName,
    Config,
    FileSystem,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::SpawnFailed => "spawn failed",
            ErrorKind::NonZeroExit => "non-zero exit",
            ErrorKind::SourceFetchFailed => "source fetch failed",
            ErrorKind::ReviewRejected => "review rejected",
            ErrorKind::AuthenticationFailed => "authentication failed",
            ErrorKind::NetworkTimeout => "network timeout",
            ErrorKind::Network => "network error",
            ErrorKind::ParseError => "parse error",
            ErrorKind::TransactionBusy => "transaction busy",
            ErrorKind::InvalidTransition => "invalid transition",
            ErrorKind::InvalidPackageName => "invalid package name",
            ErrorKind::Config => "configuration error",
            ErrorKind::FileSystem => "file system error",
        };
        f.write_str(name)
    }
}

impl LinpamaError {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            LinpamaError::SpawnFailed { .. } => ErrorKind::SpawnFailed,
            LinpamaError::NonZeroExit { .. } => ErrorKind::NonZeroExit,
            LinpamaError::SourceFetchFailed { .. } => ErrorKind::SourceFetchFailed,
            LinpamaError::ReviewRejected { .. } => ErrorKind::ReviewRejected,
            LinpamaError::AuthenticationFailed { .. } => ErrorKind::AuthenticationFailed,
            LinpamaError::NetworkTimeout { .. } => ErrorKind::NetworkTimeout,
            LinpamaError::Network { .. } => ErrorKind::Network,
            LinpamaError::ParseError { .. } => ErrorKind::ParseError,
            LinpamaError::TransactionBusy { .. } => ErrorKind::TransactionBusy,
            LinpamaError::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            LinpamaError::InvalidPackageName { .. } => ErrorKind::InvalidPackageName,
            LinpamaError::ConfigError { .. } => ErrorKind::Config,
            LinpamaError::FileSystem { .. } => ErrorKind::FileSystem,
        }
    }

    /// Whether this error moves an active transaction to `Failed`.
    ///
    /// Search-side kinds degrade the result set instead, and rejected
    /// requests leave the running transaction untouched.
    pub fn is_transaction_fatal(&self) -> bool {
        !matches!(
            self.kind(),
            ErrorKind::NetworkTimeout
                | ErrorKind::Network
                | ErrorKind::ParseError
                | ErrorKind::TransactionBusy
                | ErrorKind::InvalidTransition
                | ErrorKind::InvalidPackageName
        )
    }

    /// Create a spawn error
    pub fn spawn(program: impl Into<String>, reason: impl fmt::Display) -> Self {
        LinpamaError::SpawnFailed {
            program: program.into(),
            reason: reason.to_string(),
        }
    }

    /// Create a network error
    pub fn network(url: impl Into<String>, message: impl Into<String>) -> Self {
        LinpamaError::Network {
            url: url.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create a filesystem error
    pub fn filesystem<E: Into<std::io::Error>>(
        path: impl Into<String>,
        message: impl Into<String>,
        source: E,
    ) -> Self {
        LinpamaError::FileSystem {
            path: path.into(),
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Create an authentication error
    pub fn auth(reason: impl Into<String>) -> Self {
        LinpamaError::AuthenticationFailed {
            reason: reason.into(),
        }
    }
}

/// Result type alias for linpama operations
pub type LinpamaResult<T> = std::result::Result<T, LinpamaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = LinpamaError::ReviewRejected {
            package: "yay".to_string(),
        };
        assert_eq!(
            format!("{}", err),
            "Build recipe for 'yay' was rejected during review"
        );
    }

    #[test]
    fn test_non_zero_exit_display() {
        let err = LinpamaError::NonZeroExit {
            program: "pacman".to_string(),
            code: Some(1),
        };
        assert_eq!(format!("{}", err), "'pacman' exited with exit code 1");

        let err = LinpamaError::NonZeroExit {
            program: "makepkg".to_string(),
            code: None,
        };
        assert_eq!(format!("{}", err), "'makepkg' exited with a signal");
    }

    #[test]
    fn test_fatality() {
        assert!(LinpamaError::auth("empty password").is_transaction_fatal());
        assert!(LinpamaError::spawn("git", "not found").is_transaction_fatal());
        assert!(!LinpamaError::network("http://test", "refused").is_transaction_fatal());
        assert!(!LinpamaError::NetworkTimeout {
            url: "http://test".to_string(),
            timeout_secs: 5
        }
        .is_transaction_fatal());
        assert!(!LinpamaError::TransactionBusy {
            active: "install vim".to_string()
        }
        .is_transaction_fatal());
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(ErrorKind::SourceFetchFailed.to_string(), "source fetch failed");
        assert_eq!(
            LinpamaError::auth("x").kind(),
            ErrorKind::AuthenticationFailed
        );
    }
}
