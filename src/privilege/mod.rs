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

//! Session credential handling and privilege escalation.

pub mod askpass;

use std::fmt;

pub use askpass::{prepare_elevation, ElevationHandle};

use crate::config::PrivilegeConfig;
use crate::error::{LinpamaError, LinpamaResult};

/// The privileged password. Kept in memory only.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    /// The secret itself; only the escalation bridge should need this
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

/// Lines sudo (or doas) print when the askpass answer was refused
const REJECTION_MARKERS: &[&str] = &[
    "incorrect password attempt",
    "a password is required",
    "no password was provided",
    "authentication failed",
    "authentication failure",
];

/// Whether an output line from an elevated child says the password was refused
pub fn is_rejection_line(line: &str) -> bool {
    let line = line.to_lowercase();
    REJECTION_MARKERS.iter().any(|marker| line.contains(marker))
}

/// Holds the session credential after the first successful prompt
#[derive(Debug, Default)]
pub struct CredentialStore {
    cached: Option<Credential>,
}

impl CredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept a prompted secret. Empty secrets are rejected and never cached.
    pub fn accept(&mut self, secret: impl Into<String>) -> LinpamaResult<&Credential> {
        let credential = Credential::new(secret);
        if credential.is_empty() {
            return Err(LinpamaError::auth("empty password"));
        }
        let stored: &Credential = self.cached.insert(credential);
        Ok(stored)
    }

    pub fn cached(&self) -> Option<&Credential> {
        self.cached.as_ref()
    }

    pub fn is_cached(&self) -> bool {
        self.cached.is_some()
    }

    /// Forget the credential, e.g. after sudo rejected it
    pub fn clear(&mut self) {
        self.cached = None;
    }
}

/// Per-process session context handed to the supervisor
#[derive(Debug)]
pub struct Session {
    credentials: CredentialStore,
    privilege: PrivilegeConfig,
}

impl Session {
    pub fn new(privilege: PrivilegeConfig) -> Self {
        Self {
            credentials: CredentialStore::new(),
            privilege,
        }
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    pub fn credentials_mut(&mut self) -> &mut CredentialStore {
        &mut self.credentials
    }

    pub fn privilege(&self) -> &PrivilegeConfig {
        &self.privilege
    }

    /// Write the helpers for the cached credential
    pub fn elevate(&self) -> LinpamaResult<ElevationHandle> {
        let credential = self
            .credentials
            .cached()
            .ok_or_else(|| LinpamaError::auth("no credential available"))?;
        prepare_elevation(credential, &self.privilege)
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new(PrivilegeConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_debug_is_redacted() {
        let credential = Credential::new("hunter2");
        assert!(!format!("{:?}", credential).contains("hunter2"));
        assert_eq!(credential.expose(), "hunter2");
    }

    #[test]
    fn test_empty_secret_is_rejected_and_not_cached() {
        let mut store = CredentialStore::new();
        let err = store.accept("").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AuthenticationFailed);
        assert!(!store.is_cached());
    }

    #[test]
    fn test_accepted_secret_is_cached() {
        let mut store = CredentialStore::new();
        store.accept("hunter2").unwrap();
        assert_eq!(store.cached().map(Credential::expose), Some("hunter2"));

        store.clear();
        assert!(store.cached().is_none());
    }

    #[test]
    fn test_rejection_lines() {
        assert!(is_rejection_line("sudo: 3 incorrect password attempts"));
        assert!(is_rejection_line("sudo: 1 incorrect password attempt"));
        assert!(is_rejection_line("sudo: a password is required"));
        assert!(is_rejection_line("doas: Authentication failed"));
        assert!(!is_rejection_line("error: target not found: vim"));
        assert!(!is_rejection_line("Sorry, try again."));
    }

    #[test]
    fn test_elevate_requires_credential() {
        let session = Session::default();
        assert_eq!(
            session.elevate().unwrap_err().kind(),
            ErrorKind::AuthenticationFailed
        );
    }
}
