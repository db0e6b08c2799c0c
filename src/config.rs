//! Runtime configuration from an rc file.
//!
//! Shell-style assignments, one per line:
//! - `PREWARM_SOCKET_DIR="/tmp"`
//! - `PREWARM_RESPAWN_DEBOUNCE=2` (seconds; 0 disables the debounce)
//! - `PREWARM_LOG_FILE="/var/log/prewarmd.log"`
//! - `PREWARM_PRELOAD_M="libheavy.so.1 libtoolkit.so.2"`
//! - `PREWARM_PRELOAD_Q="libcore.so.6"`
//!
//! The file lives at `$PREWARM_CONFIG` or `~/.prewarmrc`. A missing file
//! means defaults.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::booster::Family;

/// Delay between a booster consuming a request and its replacement being
/// forked. Keeps the replacement from competing with the freshly launched
/// application for CPU on small machines.
pub const DEFAULT_RESPAWN_DEBOUNCE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct LauncherConfig {
    /// Directory holding the per-family listening sockets.
    pub socket_dir: PathBuf,
    /// Replacement-fork debounce.
    pub respawn_debounce: Duration,
    /// Log destination when running daemonized.
    pub log_file: PathBuf,
    /// Shared objects the main-family preload hook loads.
    pub preload_main: Vec<String>,
    /// Shared objects the quick-family preload hook loads.
    pub preload_quick: Vec<String>,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            socket_dir: PathBuf::from("/tmp"),
            respawn_debounce: DEFAULT_RESPAWN_DEBOUNCE,
            log_file: PathBuf::from("/var/log/prewarmd.log"),
            preload_main: Vec::new(),
            preload_quick: Vec::new(),
        }
    }
}

impl LauncherConfig {
    /// Load from `$PREWARM_CONFIG` or `~/.prewarmrc`, defaulting on absence.
    pub fn load() -> Self {
        Self::from_file(&Self::rc_path()).unwrap_or_default()
    }

    pub fn rc_path() -> PathBuf {
        if let Some(path) = env::var_os("PREWARM_CONFIG") {
            return PathBuf::from(path);
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".prewarmrc")
    }

    pub fn from_file(path: &Path) -> Option<Self> {
        let content = fs::read_to_string(path).ok()?;
        Some(Self::parse(&content))
    }

    pub fn parse(content: &str) -> Self {
        let mut config = LauncherConfig::default();

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let line = line.strip_prefix("export ").unwrap_or(line);

            let Some((key, value)) = parse_assignment(line) else {
                continue;
            };
            let value = unquote(&value);

            match key.as_str() {
                "PREWARM_SOCKET_DIR" => {
                    config.socket_dir = PathBuf::from(value);
                }
                "PREWARM_RESPAWN_DEBOUNCE" => {
                    if let Ok(secs) = value.parse::<u64>() {
                        config.respawn_debounce = Duration::from_secs(secs);
                    }
                }
                "PREWARM_LOG_FILE" => {
                    config.log_file = PathBuf::from(value);
                }
                "PREWARM_PRELOAD_M" => {
                    config.preload_main = split_list(&value);
                }
                "PREWARM_PRELOAD_Q" => {
                    config.preload_quick = split_list(&value);
                }
                _ => {}
            }
        }

        config
    }

    /// Preload list for a family.
    pub fn preload_libs(&self, family: Family) -> &[String] {
        match family {
            Family::Main => &self.preload_main,
            Family::Quick => &self.preload_quick,
        }
    }
}

fn split_list(value: &str) -> Vec<String> {
    value.split_whitespace().map(|s| s.to_string()).collect()
}

/// Parse a shell variable assignment (KEY=value or KEY="value").
fn parse_assignment(line: &str) -> Option<(String, String)> {
    let eq_pos = line.find('=')?;
    let key = line[..eq_pos].trim().to_string();
    let value = line[eq_pos + 1..].trim().to_string();

    if key.is_empty() || !key.chars().all(|c| c.is_alphanumeric() || c == '_') {
        return None;
    }

    Some((key, value))
}

/// Remove surrounding quotes from a value.
fn unquote(s: &str) -> String {
    let s = s.trim();

    if s.starts_with('"') && s.ends_with('"') && s.len() >= 2 {
        return s[1..s.len() - 1].to_string();
    }
    if s.starts_with('\'') && s.ends_with('\'') && s.len() >= 2 {
        return s[1..s.len() - 1].to_string();
    }

    s.to_string()
}
