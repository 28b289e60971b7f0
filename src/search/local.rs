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

//! Local repository index lookup through `pacman -Ss`.

use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{PackageRecord, Repository};
use crate::error::{LinpamaError, LinpamaResult};

/// Records parsed from index output plus the lines that could not be used
#[derive(Debug, Default)]
pub struct ParsedIndex {
    pub records: Vec<PackageRecord>,
    pub skipped: Vec<LinpamaError>,
}

/// Runs the package tool's search against the synced repositories
#[derive(Debug, Clone)]
pub struct LocalIndex {
    command: Vec<String>,
}

impl LocalIndex {
    /// `command` is the program plus any leading arguments, e.g. `["pacman"]`
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }

    /// Query the index. pacman exits 1 with no output when nothing matches.
    pub async fn search(&self, query: &str) -> LinpamaResult<ParsedIndex> {
        let (program, leading) = self
            .command
            .split_first()
            .ok_or_else(|| LinpamaError::spawn("<empty>", "no package tool configured"))?;

        which::which(program).map_err(|e| LinpamaError::spawn(program.as_str(), e))?;

        let output = Command::new(program)
            .args(leading)
            .args(["-Ss", "--", query])
            .env("LC_ALL", "C")
            .stdin(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| LinpamaError::spawn(program.as_str(), e))?;

        if output.status.success() {
            let text = String::from_utf8_lossy(&output.stdout);
            let parsed = parse_search_output(&text);
            if !parsed.skipped.is_empty() {
                debug!("skipped {} malformed index line(s)", parsed.skipped.len());
            }
            return Ok(parsed);
        }

        if output.status.code() == Some(1) && output.stdout.is_empty() {
            return Ok(ParsedIndex::default());
        }

        warn!(
            "{} -Ss failed: {}",
            program,
            String::from_utf8_lossy(&output.stderr).trim()
        );
        Err(LinpamaError::NonZeroExit {
            program: program.clone(),
            code: output.status.code(),
        })
    }
}

/// A record whose description lines are still being collected
struct PendingRecord {
    name: String,
    repository: Repository,
    version: String,
    installed: bool,
    description: Vec<String>,
}

impl PendingRecord {
    fn finish(self) -> PackageRecord {
        PackageRecord::new(
            self.name,
            self.repository,
            self.version,
            self.installed,
            self.description.join(" "),
        )
    }
}

/// Parse `pacman -Ss` output.
///
/// A non-indented line opens a record (`repo/name version [group] [installed]`),
/// indented lines after it form its description. Lines that fit neither shape
/// are reported in `skipped` and do not affect neighbouring records.
pub fn parse_search_output(text: &str) -> ParsedIndex {
    let mut parsed = ParsedIndex::default();
    let mut current: Option<PendingRecord> = None;

    for (idx, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }

        if line.starts_with(char::is_whitespace) {
            match current.as_mut() {
                Some(pending) => pending.description.push(line.trim().to_string()),
                None => parsed.skipped.push(LinpamaError::ParseError {
                    line: idx + 1,
                    content: line.to_string(),
                }),
            }
            continue;
        }

        if let Some(done) = current.take() {
            parsed.records.push(done.finish());
        }

        match parse_header(line) {
            Some(pending) => current = Some(pending),
            None => parsed.skipped.push(LinpamaError::ParseError {
                line: idx + 1,
                content: line.to_string(),
            }),
        }
    }

    if let Some(done) = current {
        parsed.records.push(done.finish());
    }

    parsed
}

fn parse_header(line: &str) -> Option<PendingRecord> {
    let mut tokens = line.split_whitespace();
    let full_name = tokens.next()?;
    let version = tokens.next()?;

    let (repository, name) = match full_name.split_once('/') {
        Some((repo, name)) => {
            if repo.is_empty() || name.is_empty() {
                return None;
            }
            (Repository::from_index_name(repo), name)
        }
        None => (Repository::Local, full_name),
    };

    Some(PendingRecord {
        name: name.to_string(),
        repository,
        version: version.to_string(),
        installed: line.contains("[installed"),
        description: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_with_description() {
        let parsed = parse_search_output(
            "extra/vim 9.1.0-1 [installed]\n    Vi Improved, a highly configurable text editor\n",
        );

        assert_eq!(parsed.records.len(), 1);
        assert!(parsed.skipped.is_empty());
        let vim = &parsed.records[0];
        assert_eq!(vim.name(), "vim");
        assert_eq!(vim.repository(), &Repository::Remote("extra".to_string()));
        assert_eq!(vim.version(), "9.1.0-1");
        assert!(vim.installed());
        assert_eq!(
            vim.description(),
            "Vi Improved, a highly configurable text editor"
        );
    }

    #[test]
    fn test_consecutive_headers_have_empty_descriptions() {
        let parsed = parse_search_output("core/bash 5.2-1\nextra/zsh 5.9-5\n");

        assert_eq!(parsed.records.len(), 2);
        assert_eq!(parsed.records[0].name(), "bash");
        assert_eq!(parsed.records[0].description(), "");
        assert_eq!(parsed.records[1].name(), "zsh");
        assert_eq!(parsed.records[1].description(), "");
        assert!(!parsed.records[1].installed());
    }

    #[test]
    fn test_group_and_installed_version_markers() {
        let parsed = parse_search_output(
            "extra/gvim 9.1.0-1 (gui) [installed: 9.0.0-1]\n    GUI flavour\n",
        );
        let gvim = &parsed.records[0];
        assert!(gvim.installed());
        assert_eq!(gvim.version(), "9.1.0-1");
    }

    #[test]
    fn test_malformed_lines_are_skipped() {
        let text = "    orphan description\n\
                    justonetoken\n\
                    extra/ripgrep 14.1.0-1\n    \
                    Fast grep\n\
                    /broken 1.0\n\
                    core/sed 4.9-3\n";
        let parsed = parse_search_output(text);

        let names: Vec<&str> = parsed.records.iter().map(|r| r.name()).collect();
        assert_eq!(names, vec!["ripgrep", "sed"]);
        assert_eq!(parsed.records[0].description(), "Fast grep");
        assert_eq!(parsed.skipped.len(), 3);
        assert!(matches!(
            parsed.skipped[0],
            LinpamaError::ParseError { line: 1, .. }
        ));
    }

    #[test]
    fn test_unqualified_and_local_names() {
        let parsed = parse_search_output("mypkg 1.0-1\nlocal/other 2.0-1\n");
        assert_eq!(parsed.records[0].repository(), &Repository::Local);
        assert_eq!(parsed.records[1].repository(), &Repository::Local);
    }

    #[test]
    fn test_multiline_description_is_joined() {
        let parsed = parse_search_output("extra/foo 1-1\n    first part\n    second part\n");
        assert_eq!(parsed.records[0].description(), "first part second part");
    }
}
