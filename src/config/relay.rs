//! Relay configuration
//!
//! Settings shared by every connection: which program to run, how to find
//! its working directory, and the optional access token. Loaded from an
//! optional TOML file, then overridden from the command line, and frozen
//! for the lifetime of the process.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Program launched when none is configured
pub const DEFAULT_COMMAND: &str = "claude";

/// `TERM` value exported to the child
pub const DEFAULT_TERM: &str = "xterm-256color";

/// Errors that can occur during config operations
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Process-wide relay settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RelayConfig {
    /// Program run inside each terminal session
    pub command: String,
    /// Fixed argument vector for `command`
    pub args: Vec<String>,
    /// Shared secret clients must present in `init`; `None` disables the check
    pub token: Option<String>,
    /// Base directories searched, in order, for a relative working directory.
    /// A leading `~` expands to `$HOME`.
    pub workdir_bases: Vec<String>,
    /// Value of `TERM` in the child's environment
    pub term: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            command: DEFAULT_COMMAND.to_string(),
            args: Vec::new(),
            token: None,
            workdir_bases: vec!["~/Github".to_string(), "~".to_string()],
            term: DEFAULT_TERM.to_string(),
        }
    }
}

impl RelayConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: RelayConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Whether clients must authenticate
    pub fn requires_token(&self) -> bool {
        self.token.is_some()
    }

    /// Check a client-supplied token against the configured one.
    ///
    /// Always true when no token is configured. The comparison does not
    /// short-circuit on the first differing byte.
    pub fn verify_token(&self, provided: Option<&str>) -> bool {
        let Some(expected) = self.token.as_deref() else {
            return true;
        };
        let Some(provided) = provided else {
            return false;
        };

        let (expected, provided) = (expected.as_bytes(), provided.as_bytes());
        if expected.len() != provided.len() {
            return false;
        }
        let mut diff: u8 = 0;
        for (a, b) in expected.iter().zip(provided.iter()) {
            diff |= a ^ b;
        }
        diff == 0
    }

    /// Resolve a requested working directory.
    ///
    /// Absolute paths are used if they exist. Relative paths are tried under
    /// each base in `workdir_bases`, then as given. When nothing matches, or
    /// nothing was requested, the relay's own current directory is used.
    pub fn resolve_workdir(&self, requested: Option<&str>) -> PathBuf {
        let requested = match requested.map(str::trim) {
            Some(dir) if !dir.is_empty() => Path::new(dir),
            _ => return current_dir(),
        };

        if requested.is_absolute() {
            return if requested.is_dir() {
                requested.to_path_buf()
            } else {
                current_dir()
            };
        }

        self.workdir_bases
            .iter()
            .map(|base| expand_home(base).join(requested))
            .chain(std::iter::once(current_dir().join(requested)))
            .find(|candidate| candidate.is_dir())
            .unwrap_or_else(current_dir)
    }
}

/// Expand a leading `~` to `$HOME`. Left untouched when `HOME` is unset.
pub fn expand_home(path: &str) -> PathBuf {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    match (path, home) {
        ("~", Some(home)) => home,
        (p, Some(home)) if p.starts_with("~/") => home.join(&p[2..]),
        (p, _) => PathBuf::from(p),
    }
}

fn current_dir() -> PathBuf {
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"))
}
