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

//! Package transactions: intents, states and the supervisor that runs them.

pub mod process;
pub mod supervisor;

use chrono::{DateTime, Local};
use std::fmt;

pub use process::{signal_group, spawn_streaming, ProcessSpec, WorkerMessage};
pub use supervisor::Supervisor;

use crate::error::{ErrorKind, LinpamaError, LinpamaResult};

/// What a transaction does
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionKind {
    Install,
    Remove,
    AurBuild,
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionKind::Install => write!(f, "install"),
            TransactionKind::Remove => write!(f, "remove"),
            TransactionKind::AurBuild => write!(f, "AUR build"),
        }
    }
}

/// A request to change the system
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionIntent {
    pub kind: TransactionKind,
    pub package_name: String,
    pub requires_privilege: bool,
}

impl TransactionIntent {
    pub fn install(package: impl Into<String>) -> Self {
        Self::new(TransactionKind::Install, package)
    }

    pub fn remove(package: impl Into<String>) -> Self {
        Self::new(TransactionKind::Remove, package)
    }

    pub fn aur_build(package: impl Into<String>) -> Self {
        Self::new(TransactionKind::AurBuild, package)
    }

    fn new(kind: TransactionKind, package: impl Into<String>) -> Self {
        Self {
            kind,
            package_name: package.into(),
            requires_privilege: true,
        }
    }

    /// Run without the credential (for tools that handle elevation themselves)
    pub fn unprivileged(mut self) -> Self {
        self.requires_privilege = false;
        self
    }
}

impl fmt::Display for TransactionIntent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.package_name)
    }
}

/// Supervisor state machine positions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Idle,
    AwaitingCredential,
    Running,
    AwaitingReview,
    Cancelling,
    Succeeded,
    Failed,
}

impl TransactionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransactionState::Succeeded | TransactionState::Failed)
    }

    /// Whether a child process may be alive in this state
    pub fn has_child(&self) -> bool {
        matches!(self, TransactionState::Running | TransactionState::Cancelling)
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransactionState::Idle => "idle",
            TransactionState::AwaitingCredential => "awaiting credential",
            TransactionState::Running => "running",
            TransactionState::AwaitingReview => "awaiting review",
            TransactionState::Cancelling => "cancelling",
            TransactionState::Succeeded => "succeeded",
            TransactionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Stage of the running transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Cloning the AUR recipe repository
    Fetch,
    /// makepkg building and installing
    Build,
    /// pacman install or removal
    Package,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Fetch => write!(f, "fetch"),
            Phase::Build => write!(f, "build"),
            Phase::Package => write!(f, "package"),
        }
    }
}

/// Read-only projection of the supervisor for observers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionSnapshot {
    pub state: TransactionState,
    pub intent: Option<TransactionIntent>,
    pub phase: Option<Phase>,
    pub failure: Option<ErrorKind>,
    pub cancel_requested: bool,
}

/// Answer to a credential request
#[derive(Debug, Clone)]
pub enum CredentialResponse {
    Provided(String),
    Cancelled,
}

/// Operator verdict on a build recipe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewDecision {
    Proceed,
    Cancel,
}

#[derive(Debug, Clone)]
pub struct LogLine {
    pub timestamp: DateTime<Local>,
    pub text: String,
}

/// Captured output of the current transaction, in arrival order
#[derive(Debug, Default)]
pub struct LogBuffer {
    lines: Vec<LogLine>,
}

impl LogBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, text: impl Into<String>) {
        self.lines.push(LogLine {
            timestamp: Local::now(),
            text: text.into(),
        });
    }

    pub fn clear(&mut self) {
        self.lines.clear();
    }

    pub fn lines(&self) -> &[LogLine] {
        &self.lines
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn last(&self) -> Option<&str> {
        self.lines.last().map(|l| l.text.as_str())
    }

    /// The whole log as newline-separated text
    pub fn text(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            out.push_str(&line.text);
            out.push('\n');
        }
        out
    }
}

/// Check that `name` is something pacman would accept as a package name
pub fn validate_package_name(name: &str) -> LinpamaResult<()> {
    let valid = !name.is_empty()
        && !name.starts_with('-')
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '@' | '.' | '_' | '+' | '-'));

    if valid {
        Ok(())
    } else {
        Err(LinpamaError::InvalidPackageName {
            name: name.to_string(),
        })
    }
}
