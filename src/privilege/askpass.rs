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

//! Transient askpass helper and escalation wrapper.
//!
//! The helper prints the credential from an environment variable set on the
//! child only, so the secret never touches the filesystem. Both scripts live
//! in a private temporary directory that is removed with the handle.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::debug;

use super::Credential;
use crate::config::PrivilegeConfig;
use crate::error::{LinpamaError, LinpamaResult};
use crate::transaction::ProcessSpec;

const SCRIPT_MODE: u32 = 0o500;

/// Live helper scripts for one privileged command
pub struct ElevationHandle {
    dir: TempDir,
    askpass: PathBuf,
    wrapper: PathBuf,
    password_env: String,
    credential: Credential,
}

/// Write the askpass helper and escalation wrapper for `credential`
pub fn prepare_elevation(
    credential: &Credential,
    privilege: &PrivilegeConfig,
) -> LinpamaResult<ElevationHandle> {
    if credential.is_empty() {
        return Err(LinpamaError::auth("empty password"));
    }

    let escalation = privilege
        .escalation
        .first()
        .ok_or_else(|| LinpamaError::auth("no escalation program configured"))?;
    which::which(escalation)
        .map_err(|e| LinpamaError::auth(format!("cannot use '{}': {}", escalation, e)))?;

    let dir = tempfile::Builder::new()
        .prefix("linpama-askpass-")
        .tempdir()
        .map_err(|e| LinpamaError::auth(format!("cannot create helper directory: {}", e)))?;
    fs::set_permissions(dir.path(), fs::Permissions::from_mode(0o700))
        .map_err(|e| LinpamaError::auth(format!("cannot secure helper directory: {}", e)))?;

    let askpass = dir.path().join("askpass");
    let wrapper = dir.path().join("elevate");

    write_script(
        &askpass,
        &format!(
            "#!/bin/sh\nprintf '%s\\n' \"${}\"\n",
            privilege.password_env
        ),
    )?;

    let escalate: Vec<String> = privilege.escalation.iter().map(|a| shell_quote(a)).collect();
    write_script(
        &wrapper,
        &format!(
            "#!/bin/sh\nSUDO_ASKPASS={}\nexport SUDO_ASKPASS\nexec {} \"$@\"\n",
            shell_quote(&askpass.to_string_lossy()),
            escalate.join(" ")
        ),
    )?;

    debug!("elevation helpers written to {}", dir.path().display());

    Ok(ElevationHandle {
        dir,
        askpass,
        wrapper,
        password_env: privilege.password_env.clone(),
        credential: credential.clone(),
    })
}

impl ElevationHandle {
    /// Run `spec` through the escalation wrapper
    pub fn wrap(&self, spec: ProcessSpec) -> ProcessSpec {
        spec.prefixed(&["sh".to_string(), self.wrapper.to_string_lossy().into_owned()])
            .env(&self.password_env, self.credential.expose())
    }

    /// Run `spec` unprivileged, letting any sudo it starts use the helper
    pub fn with_askpass(&self, spec: ProcessSpec) -> ProcessSpec {
        spec.env("SUDO_ASKPASS", self.askpass.to_string_lossy())
            .env(&self.password_env, self.credential.expose())
    }

    pub fn askpass_path(&self) -> &Path {
        &self.askpass
    }

    pub fn wrapper_path(&self) -> &Path {
        &self.wrapper
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// Remove the helpers now instead of on drop
    pub fn close(self) -> LinpamaResult<()> {
        let path = self.dir.path().display().to_string();
        self.dir
            .close()
            .map_err(|e| LinpamaError::filesystem(path, "cannot remove elevation helpers", e))
    }
}

impl std::fmt::Debug for ElevationHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ElevationHandle")
            .field("dir", &self.dir.path())
            .finish_non_exhaustive()
    }
}

fn write_script(path: &Path, content: &str) -> LinpamaResult<()> {
    let fail = |e: std::io::Error| LinpamaError::auth(format!("cannot write {}: {}", path.display(), e));

    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o700)
        .open(path)
        .map_err(fail)?;
    file.write_all(content.as_bytes()).map_err(fail)?;
    file.sync_all().map_err(fail)?;
    drop(file);

    fs::set_permissions(path, fs::Permissions::from_mode(SCRIPT_MODE)).map_err(fail)
}

/// Single-quote `value` for POSIX sh
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn privilege() -> PrivilegeConfig {
        PrivilegeConfig {
            escalation: vec!["env".to_string()],
            password_env: "LINPAMA_SUDO_PW".to_string(),
        }
    }

    #[test]
    fn test_scripts_are_owner_only_and_hold_no_secret() {
        let handle = prepare_elevation(&Credential::new("s3cr3t-pw"), &privilege()).unwrap();

        for path in [handle.askpass_path(), handle.wrapper_path()] {
            let mode = fs::metadata(path).unwrap().permissions().mode() & 0o777;
            assert_eq!(mode, 0o500);
            let content = fs::read_to_string(path).unwrap();
            assert!(!content.contains("s3cr3t-pw"));
        }
        let dir_mode = fs::metadata(handle.dir()).unwrap().permissions().mode() & 0o777;
        assert_eq!(dir_mode, 0o700);
    }

    #[test]
    fn test_askpass_prints_secret_from_environment() {
        let handle = prepare_elevation(&Credential::new("pa ss'word"), &privilege()).unwrap();

        let output = std::process::Command::new("sh")
            .arg(handle.askpass_path())
            .env("LINPAMA_SUDO_PW", "pa ss'word")
            .output()
            .unwrap();
        assert_eq!(String::from_utf8_lossy(&output.stdout), "pa ss'word\n");
    }

    #[test]
    fn test_wrapper_exports_askpass_and_runs_command() {
        let handle = prepare_elevation(&Credential::new("pw"), &privilege()).unwrap();
        let spec = handle.wrap(ProcessSpec::new(vec!["printenv".into(), "SUDO_ASKPASS".into()]));

        assert_eq!(spec.argv()[0], "sh");
        assert_eq!(spec.env_value("LINPAMA_SUDO_PW"), Some("pw"));

        let output = std::process::Command::new(&spec.argv()[0])
            .args(&spec.argv()[1..])
            .output()
            .unwrap();
        assert_eq!(
            String::from_utf8_lossy(&output.stdout).trim(),
            handle.askpass_path().to_string_lossy()
        );
    }

    #[test]
    fn test_helpers_removed_on_drop() {
        let handle = prepare_elevation(&Credential::new("pw"), &privilege()).unwrap();
        let dir = handle.dir().to_path_buf();
        assert!(dir.exists());
        drop(handle);
        assert!(!dir.exists());
    }

    #[test]
    fn test_missing_escalation_program_fails_authentication() {
        let mut config = privilege();
        config.escalation = vec!["linpama-no-such-sudo".to_string()];
        let err = prepare_elevation(&Credential::new("pw"), &config).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::AuthenticationFailed);
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }
}
