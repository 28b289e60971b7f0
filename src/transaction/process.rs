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

//! Child process execution with combined, line-streamed output.
//!
//! Each child runs in its own process group so a signal sent to the group
//! reaches everything it started (sudo, pacman, makepkg and the build).

use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_stream::wrappers::SplitStream;
use tokio_stream::StreamExt;
use tracing::{debug, warn};

use crate::error::{LinpamaError, LinpamaResult};

/// Merges the child's stderr into stdout so both share one ordered pipe
const COMBINE_OUTPUT: &str = "exec \"$@\" 2>&1";

/// A command to run: argv, extra environment and working directory
#[derive(Clone, Default)]
pub struct ProcessSpec {
    argv: Vec<String>,
    env: Vec<(String, String)>,
    cwd: Option<PathBuf>,
}

impl ProcessSpec {
    pub fn new(argv: Vec<String>) -> Self {
        Self {
            argv,
            ..Default::default()
        }
    }

    /// `prefix` (program plus leading arguments) followed by `args`
    pub fn from_prefix<I, S>(prefix: &[String], args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut argv = prefix.to_vec();
        argv.extend(args.into_iter().map(Into::into));
        Self::new(argv)
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Run this command behind `prefix`, keeping environment and directory
    pub fn prefixed(mut self, prefix: &[String]) -> Self {
        let mut argv = prefix.to_vec();
        argv.append(&mut self.argv);
        self.argv = argv;
        self
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    pub fn program(&self) -> &str {
        self.argv.first().map(String::as_str).unwrap_or("")
    }

    pub fn cwd(&self) -> Option<&Path> {
        self.cwd.as_deref()
    }

    pub fn env_value(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Printable command line. Environment values are never included.
    pub fn command_line(&self) -> String {
        self.argv.join(" ")
    }
}

// Environment may carry the credential.
impl std::fmt::Debug for ProcessSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let keys: Vec<&str> = self.env.iter().map(|(k, _)| k.as_str()).collect();
        f.debug_struct("ProcessSpec")
            .field("argv", &self.argv)
            .field("env", &keys)
            .field("cwd", &self.cwd)
            .finish()
    }
}

/// Messages posted by worker tasks to the supervisor
#[derive(Debug)]
pub enum WorkerMessage {
    /// One line of combined child output
    Output { generation: u64, line: String },
    /// The child exited; `None` when terminated by a signal
    Exited { generation: u64, code: Option<i32> },
    /// Cancellation grace period ran out
    GraceElapsed { generation: u64 },
    /// Progress pulse
    Tick,
}

/// Spawn `spec` and stream its output as [`WorkerMessage`]s tagged with `generation`.
///
/// Returns the process group id. The worker sends exactly one `Exited` after
/// the last `Output`.
pub fn spawn_streaming(
    spec: &ProcessSpec,
    generation: u64,
    tx: mpsc::UnboundedSender<WorkerMessage>,
) -> LinpamaResult<u32> {
    let program = spec.program();
    if program.is_empty() {
        return Err(LinpamaError::spawn("<empty>", "empty command line"));
    }
    which::which(program).map_err(|e| LinpamaError::spawn(program, e))?;

    let mut command = Command::new("sh");
    command
        .arg("-c")
        .arg(COMBINE_OUTPUT)
        .arg(crate::config::APP_NAME)
        .args(spec.argv())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .process_group(0);

    for (key, value) in &spec.env {
        command.env(key, value);
    }
    if let Some(dir) = spec.cwd() {
        command.current_dir(dir);
    }

    let mut child = command
        .spawn()
        .map_err(|e| LinpamaError::spawn(program, e))?;

    let pgid = child
        .id()
        .ok_or_else(|| LinpamaError::spawn(program, "child exited before it could be tracked"))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| LinpamaError::spawn(program, "no output pipe"))?;

    debug!("spawned '{}' in process group {}", spec.command_line(), pgid);

    tokio::spawn(async move {
        let mut lines = SplitStream::new(BufReader::new(stdout).split(b'\n'));

        while let Some(segment) = lines.next().await {
            match segment {
                Ok(bytes) => {
                    let text = String::from_utf8_lossy(&bytes);
                    let line = text.strip_suffix('\r').unwrap_or(&text).to_string();
                    if tx.send(WorkerMessage::Output { generation, line }).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("output stream of process group {} failed: {}", pgid, e);
                    break;
                }
            }
        }

        let code = match child.wait().await {
            Ok(status) => status.code(),
            Err(e) => {
                warn!("waiting for process group {} failed: {}", pgid, e);
                None
            }
        };
        let _ = tx.send(WorkerMessage::Exited { generation, code });
    });

    Ok(pgid)
}

/// Send `signal` to every process in group `pgid`
pub fn signal_group(pgid: u32, signal: libc::c_int) -> bool {
    let Ok(pgid) = i32::try_from(pgid) else {
        return false;
    };
    // SAFETY: kill(2) has no memory-safety preconditions; a negative pid addresses the group.
    unsafe { libc::kill(-pgid, signal) == 0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn collect(spec: ProcessSpec) -> (Vec<String>, Option<i32>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        spawn_streaming(&spec, 7, tx).unwrap();

        let mut lines = Vec::new();
        while let Some(message) = rx.recv().await {
            match message {
                WorkerMessage::Output { generation, line } => {
                    assert_eq!(generation, 7);
                    lines.push(line);
                }
                WorkerMessage::Exited { code, .. } => return (lines, code),
                other => panic!("unexpected {:?}", other),
            }
        }
        panic!("worker ended without Exited");
    }

    #[tokio::test]
    async fn test_stdout_and_stderr_share_one_ordered_stream() {
        let spec = ProcessSpec::new(vec![
            "sh".into(),
            "-c".into(),
            "echo one; echo two >&2; printf 'three\\r\\n'; echo four".into(),
        ]);
        let (lines, code) = collect(spec).await;
        assert_eq!(lines, vec!["one", "two", "three", "four"]);
        assert_eq!(code, Some(0));
    }

    #[tokio::test]
    async fn test_exit_code_env_and_cwd() {
        let dir = tempfile::tempdir().unwrap();
        let spec = ProcessSpec::new(vec![
            "sh".into(),
            "-c".into(),
            "echo \"$GREETING\"; pwd; exit 3".into(),
        ])
        .env("GREETING", "hello")
        .current_dir(dir.path());

        let (lines, code) = collect(spec).await;
        assert_eq!(lines[0], "hello");
        assert!(lines[1].ends_with(dir.path().file_name().unwrap().to_str().unwrap()));
        assert_eq!(code, Some(3));
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_failure() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let spec = ProcessSpec::new(vec!["linpama-definitely-missing-tool".into()]);
        let err = spawn_streaming(&spec, 1, tx).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::SpawnFailed);
    }

    #[tokio::test]
    async fn test_group_signal_interrupts_child() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let spec = ProcessSpec::new(vec!["sh".into(), "-c".into(), "echo ready; sleep 30".into()]);
        let pgid = spawn_streaming(&spec, 1, tx).unwrap();

        match rx.recv().await {
            Some(WorkerMessage::Output { line, .. }) => assert_eq!(line, "ready"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(signal_group(pgid, libc::SIGINT));

        match rx.recv().await {
            Some(WorkerMessage::Exited { code, .. }) => assert_ne!(code, Some(0)),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_debug_hides_environment_values() {
        let spec = ProcessSpec::from_prefix(&["pacman".to_string()], ["-S", "vim"])
            .env("LINPAMA_SUDO_PW", "hunter2");
        let rendered = format!("{:?}", spec);
        assert!(rendered.contains("LINPAMA_SUDO_PW"));
        assert!(!rendered.contains("hunter2"));
        assert_eq!(spec.command_line(), "pacman -S vim");
        assert_eq!(spec.env_value("LINPAMA_SUDO_PW"), Some("hunter2"));
    }

    #[test]
    fn test_prefixed_keeps_env_and_cwd() {
        let spec = ProcessSpec::new(vec!["makepkg".into(), "-si".into()])
            .env("A", "1")
            .current_dir("/tmp")
            .prefixed(&["sh".to_string(), "/x/wrapper".to_string()]);
        assert_eq!(spec.argv(), ["sh", "/x/wrapper", "makepkg", "-si"]);
        assert_eq!(spec.cwd(), Some(Path::new("/tmp")));
        assert_eq!(spec.env_value("A"), Some("1"));
    }
}
