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

//! Engine configuration and persisted user preferences.
//!
//! Two files live under `$XDG_CONFIG_HOME/linpama/`:
//! - `linpama.toml`: engine tuning, layered over `/etc/linpama/linpama.toml`
//! - `config.json`: the front end's persisted first-run warning flag

use serde::Deserialize;
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{LinpamaError, LinpamaResult};

pub const APP_NAME: &str = "linpama";

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Search aggregation settings
    pub search: SearchConfig,

    /// AUR-specific configuration
    pub aur: AurConfig,

    /// Transaction supervisor settings
    pub transaction: TransactionConfig,

    /// Privilege escalation settings
    pub privilege: PrivilegeConfig,

    /// External program names
    pub tools: ToolsConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            search: SearchConfig::default(),
            aur: AurConfig::default(),
            transaction: TransactionConfig::default(),
            privilege: PrivilegeConfig::default(),
            tools: ToolsConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Trailing debounce window for keystroke-driven searches
    pub debounce_ms: u64,

    /// Results handed to the renderer per page
    pub batch_size: usize,

    /// Queries shorter than this clear the results instead of searching
    pub min_query_len: usize,

    /// Upper bound on the remote AUR lookup
    pub aur_timeout_secs: u64,

    /// Number of AUR queries kept in the response cache
    pub aur_cache_size: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 400,
            batch_size: 30,
            min_query_len: 2,
            aur_timeout_secs: 5,
            aur_cache_size: 128,
        }
    }
}

impl SearchConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn aur_timeout(&self) -> Duration {
        Duration::from_secs(self.aur_timeout_secs)
    }
}

/// AUR-specific configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AurConfig {
    /// AUR RPC base URL
    pub rpc_url: String,

    /// Base URL that `<name>.git` is appended to when cloning
    pub clone_base_url: String,

    /// Arguments passed to makepkg in the checkout directory
    pub makepkg_args: Vec<String>,

    /// Parent directory for per-transaction checkouts (system temp dir when unset)
    pub build_root: Option<PathBuf>,
}

impl Default for AurConfig {
    fn default() -> Self {
        Self {
            rpc_url: "https://aur.archlinux.org/rpc/".to_string(),
            clone_base_url: "https://aur.archlinux.org".to_string(),
            makepkg_args: vec!["-si".to_string(), "--noconfirm".to_string()],
            build_root: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransactionConfig {
    /// Interval of the indeterminate progress tick
    pub tick_ms: u64,

    /// Seconds to wait after an interrupt before sending SIGTERM (0 = never)
    pub cancel_grace_secs: u64,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            tick_ms: 100,
            cancel_grace_secs: 15,
        }
    }
}

impl TransactionConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn cancel_grace(&self) -> Option<Duration> {
        (self.cancel_grace_secs > 0).then(|| Duration::from_secs(self.cancel_grace_secs))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PrivilegeConfig {
    /// Escalation front, invoked as `<escalation...> <command...>`
    pub escalation: Vec<String>,

    /// Environment variable that carries the credential to the askpass helper
    pub password_env: String,
}

impl Default for PrivilegeConfig {
    fn default() -> Self {
        Self {
            escalation: vec!["sudo".to_string(), "-A".to_string()],
            password_env: "LINPAMA_SUDO_PW".to_string(),
        }
    }
}

/// External programs, each given as a command prefix (program plus leading arguments)
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub pacman: Vec<String>,
    pub git: Vec<String>,
    pub makepkg: Vec<String>,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            pacman: vec!["pacman".to_string()],
            git: vec!["git".to_string()],
            makepkg: vec!["makepkg".to_string()],
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log file path (empty = no file logging)
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            file: None,
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with precedence:
    /// 1. /etc/linpama/linpama.toml (system-wide)
    /// 2. ~/.config/linpama/linpama.toml (user)
    /// 3. Environment variables (LINPAMA_*)
    pub fn load() -> Self {
        let mut config = Config::default();

        let system_config = Path::new("/etc/linpama/linpama.toml");
        if let Some(parsed) = Self::read_file(system_config) {
            config = config.merge(parsed);
        }

        if let Some(dir) = config_dir() {
            if let Some(parsed) = Self::read_file(&dir.join("linpama.toml")) {
                config = config.merge(parsed);
            }
        }

        config.apply_env_overrides()
    }

    /// Parse a configuration document
    pub fn from_toml_str(content: &str) -> LinpamaResult<Self> {
        toml::from_str(content).map_err(|e| LinpamaError::ConfigError {
            message: e.to_string(),
        })
    }

    fn read_file(path: &Path) -> Option<Config> {
        if !path.exists() {
            return None;
        }
        let content = fs::read_to_string(path).ok()?;
        match Self::from_toml_str(&content) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                tracing::warn!("ignoring {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Merge another config into this one (other takes precedence for non-default values)
    fn merge(mut self, other: Config) -> Self {
        self.search = self.search.merge(other.search);
        self.aur = self.aur.merge(other.aur);
        self.transaction = self.transaction.merge(other.transaction);
        self.privilege = self.privilege.merge(other.privilege);
        self.tools = self.tools.merge(other.tools);
        self.logging = self.logging.merge(other.logging);
        self
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(mut self) -> Self {
        if let Ok(val) = std::env::var("LINPAMA_AUR_RPC_URL") {
            self.aur.rpc_url = val;
        }

        if let Ok(val) = std::env::var("LINPAMA_AUR_TIMEOUT") {
            if let Ok(n) = val.parse() {
                self.search.aur_timeout_secs = n;
            }
        }

        if let Ok(val) = std::env::var("LINPAMA_CANCEL_GRACE") {
            if let Ok(n) = val.parse() {
                self.transaction.cancel_grace_secs = n;
            }
        }

        if let Ok(val) = std::env::var("LINPAMA_PACMAN") {
            let prefix: Vec<String> = val.split_whitespace().map(String::from).collect();
            if !prefix.is_empty() {
                self.tools.pacman = prefix;
            }
        }

        if let Ok(val) = std::env::var("LINPAMA_LOG_LEVEL") {
            self.logging.level = val;
        }

        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> LinpamaResult<()> {
        let fail = |message: &str| {
            Err(LinpamaError::ConfigError {
                message: message.to_string(),
            })
        };

        if self.search.batch_size == 0 {
            return fail("search.batch_size must be at least 1");
        }
        if self.search.min_query_len == 0 {
            return fail("search.min_query_len must be at least 1");
        }
        if self.search.aur_timeout_secs == 0 {
            return fail("search.aur_timeout_secs must be at least 1");
        }
        if self.search.aur_cache_size == 0 {
            return fail("search.aur_cache_size must be at least 1");
        }
        if self.transaction.tick_ms == 0 {
            return fail("transaction.tick_ms must be at least 1");
        }
        if self.privilege.escalation.is_empty() {
            return fail("privilege.escalation must name a program");
        }
        for (key, prefix) in [
            ("tools.pacman", &self.tools.pacman),
            ("tools.git", &self.tools.git),
            ("tools.makepkg", &self.tools.makepkg),
        ] {
            if prefix.is_empty() {
                return Err(LinpamaError::ConfigError {
                    message: format!("{} must name a program", key),
                });
            }
        }
        if !is_env_name(&self.privilege.password_env) {
            return fail("privilege.password_env must be a plain variable name");
        }
        for (key, value) in [
            ("aur.rpc_url", &self.aur.rpc_url),
            ("aur.clone_base_url", &self.aur.clone_base_url),
        ] {
            if let Err(e) = url::Url::parse(value) {
                return Err(LinpamaError::ConfigError {
                    message: format!("{} is not a valid URL: {}", key, e),
                });
            }
        }
        Ok(())
    }
}

impl SearchConfig {
    fn merge(mut self, other: SearchConfig) -> Self {
        let default = SearchConfig::default();

        if other.debounce_ms != default.debounce_ms {
            self.debounce_ms = other.debounce_ms;
        }
        if other.batch_size != default.batch_size {
            self.batch_size = other.batch_size;
        }
        if other.min_query_len != default.min_query_len {
            self.min_query_len = other.min_query_len;
        }
        if other.aur_timeout_secs != default.aur_timeout_secs {
            self.aur_timeout_secs = other.aur_timeout_secs;
        }
        if other.aur_cache_size != default.aur_cache_size {
            self.aur_cache_size = other.aur_cache_size;
        }

        self
    }
}

impl AurConfig {
    fn merge(mut self, other: AurConfig) -> Self {
        let default = AurConfig::default();

        if other.rpc_url != default.rpc_url {
            self.rpc_url = other.rpc_url;
        }
        if other.clone_base_url != default.clone_base_url {
            self.clone_base_url = other.clone_base_url;
        }
        if other.makepkg_args != default.makepkg_args {
            self.makepkg_args = other.makepkg_args;
        }
        if other.build_root.is_some() {
            self.build_root = other.build_root;
        }

        self
    }

    /// Clone URL of a package's recipe repository
    pub fn clone_url(&self, package: &str) -> String {
        format!("{}/{}.git", self.clone_base_url.trim_end_matches('/'), package)
    }
}

impl TransactionConfig {
    fn merge(mut self, other: TransactionConfig) -> Self {
        let default = TransactionConfig::default();

        if other.tick_ms != default.tick_ms {
            self.tick_ms = other.tick_ms;
        }
        if other.cancel_grace_secs != default.cancel_grace_secs {
            self.cancel_grace_secs = other.cancel_grace_secs;
        }

        self
    }
}

impl PrivilegeConfig {
    fn merge(mut self, other: PrivilegeConfig) -> Self {
        let default = PrivilegeConfig::default();

        if other.escalation != default.escalation {
            self.escalation = other.escalation;
        }
        if other.password_env != default.password_env {
            self.password_env = other.password_env;
        }

        self
    }
}

impl ToolsConfig {
    fn merge(mut self, other: ToolsConfig) -> Self {
        let default = ToolsConfig::default();

        if other.pacman != default.pacman {
            self.pacman = other.pacman;
        }
        if other.git != default.git {
            self.git = other.git;
        }
        if other.makepkg != default.makepkg {
            self.makepkg = other.makepkg;
        }

        self
    }
}

impl LoggingConfig {
    fn merge(mut self, other: LoggingConfig) -> Self {
        let default = LoggingConfig::default();

        if other.level != default.level {
            self.level = other.level;
        }
        if other.file.is_some() {
            self.file = other.file;
        }

        self
    }
}

fn is_env_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c == '_' || c.is_ascii_alphabetic())
        && chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

/// `$XDG_CONFIG_HOME/linpama`
pub fn config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(APP_NAME))
}

/// Persisted front-end preferences (`config.json`).
///
/// Only `show_warning` is interpreted; unknown keys are carried through on
/// write so other tools sharing the file keep their settings.
#[derive(Debug, Clone)]
pub struct Preferences {
    path: PathBuf,
}

impl Preferences {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Preferences at the default per-user location
    pub fn open_default() -> Option<Self> {
        config_dir().map(|dir| Self::new(dir.join("config.json")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the first-run warning should be shown.
    ///
    /// A missing or unreadable file means yes.
    pub fn show_warning(&self) -> bool {
        self.read_map()
            .ok()
            .and_then(|map| map.get("show_warning").and_then(Value::as_bool))
            .unwrap_or(true)
    }

    /// Persist the first-run warning flag
    pub fn set_show_warning(&self, show: bool) -> LinpamaResult<()> {
        // A corrupt file is replaced rather than blocking the opt-out.
        let mut map = self.read_map().unwrap_or_default();
        map.insert("show_warning".to_string(), Value::Bool(show));

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                LinpamaError::filesystem(parent.display().to_string(), "cannot create directory", e)
            })?;
        }

        let content = serde_json::to_string(&Value::Object(map)).map_err(|e| {
            LinpamaError::ConfigError {
                message: e.to_string(),
            }
        })?;
        fs::write(&self.path, content).map_err(|e| {
            LinpamaError::filesystem(self.path.display().to_string(), "cannot write preferences", e)
        })
    }

    fn read_map(&self) -> LinpamaResult<Map<String, Value>> {
        if !self.path.exists() {
            return Ok(Map::new());
        }
        let content = fs::read_to_string(&self.path).map_err(|e| {
            LinpamaError::filesystem(self.path.display().to_string(), "cannot read preferences", e)
        })?;
        match serde_json::from_str::<Value>(&content) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) => Err(LinpamaError::ConfigError {
                message: "preferences file is not a JSON object".to_string(),
            }),
            Err(e) => Err(LinpamaError::ConfigError {
                message: e.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.search.debounce_ms, 400);
        assert_eq!(config.search.batch_size, 30);
        assert_eq!(config.transaction.tick_ms, 100);
        assert_eq!(config.privilege.escalation, vec!["sudo", "-A"]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        config.search.batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.aur.rpc_url = "not a url".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.privilege.escalation.clear();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.privilege.password_env = "PW; rm -rf ~".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.tools.git.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let parsed = Config::from_toml_str(
            r#"
[transaction]
cancel_grace_secs = 0

[tools]
pacman = ["/usr/local/bin/pacman", "--config", "/etc/pacman-alt.conf"]
"#,
        )
        .unwrap();
        let merged = Config::default().merge(parsed);

        assert_eq!(merged.transaction.cancel_grace(), None);
        assert_eq!(merged.transaction.tick_ms, 100);
        assert_eq!(
            merged.tools.pacman,
            vec!["/usr/local/bin/pacman", "--config", "/etc/pacman-alt.conf"]
        );
        assert_eq!(merged.tools.git, vec!["git"]);
    }

    #[test]
    fn test_clone_url() {
        let mut aur = AurConfig::default();
        assert_eq!(aur.clone_url("yay"), "https://aur.archlinux.org/yay.git");
        aur.clone_base_url = "https://example.com/aur/".to_string();
        assert_eq!(aur.clone_url("yay"), "https://example.com/aur/yay.git");
    }

    #[test]
    fn test_preferences_default_to_showing_warning() {
        let dir = tempfile::tempdir().unwrap();
        let prefs = Preferences::new(dir.path().join("config.json"));
        assert!(prefs.show_warning());

        fs::write(prefs.path(), "{ not json").unwrap();
        assert!(prefs.show_warning());
    }

    #[test]
    fn test_preferences_opt_out_preserves_other_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, r#"{"theme": "dark"}"#).unwrap();

        let prefs = Preferences::new(&path);
        prefs.set_show_warning(false).unwrap();
        assert!(!prefs.show_warning());

        let stored: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(stored["theme"], "dark");
        assert_eq!(stored["show_warning"], false);
    }
}
