//! Configuration file loading.
//!
//! Every key is optional. A missing file means defaults; a file that does
//! not parse is reported and ignored, never fatal.

use std::path::{Path, PathBuf};
use std::time::Duration;

use diffcache_core::gc::GcPolicy;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::engine::EngineConfig;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub database: String,
    pub runner: RunnerConfig,
    pub diff: DiffConfig,
    pub gc: GcConfig,
    pub highlight: HighlightConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunnerConfig {
    pub workers: usize,
    /// Seconds between scans for unfinished work while serving.
    pub rescan_secs: u64,
    pub retry_delay_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DiffConfig {
    pub fold_context_lines: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GcConfig {
    pub interval_secs: u64,
    pub content_retention_secs: i64,
    pub custom_highlight_retention_secs: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HighlightConfig {
    pub theme: String,
    /// Highlight the file versions of every changeset asked for.
    pub requested_by_default: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            database: ".diffcache/cache.db".to_owned(),
            runner: RunnerConfig::default(),
            diff: DiffConfig::default(),
            gc: GcConfig::default(),
            highlight: HighlightConfig::default(),
        }
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        RunnerConfig { workers: 4, rescan_secs: 5, retry_delay_ms: 250 }
    }
}

impl Default for DiffConfig {
    fn default() -> Self {
        DiffConfig { fold_context_lines: 1 }
    }
}

impl Default for GcConfig {
    fn default() -> Self {
        let policy = GcPolicy::default();
        GcConfig {
            interval_secs: 300,
            content_retention_secs: policy.content_retention_secs,
            custom_highlight_retention_secs: policy.custom_highlight_retention_secs,
        }
    }
}

impl Default for HighlightConfig {
    fn default() -> Self {
        HighlightConfig { theme: "base16-ocean.dark".to_owned(), requested_by_default: true }
    }
}

impl Config {
    pub fn engine(&self) -> EngineConfig {
        EngineConfig {
            workers: self.runner.workers,
            fold_context_lines: self.diff.fold_context_lines,
            theme: self.highlight.theme.clone(),
            retry_delay: Duration::from_millis(self.runner.retry_delay_ms),
        }
    }

    pub fn gc_policy(&self) -> GcPolicy {
        GcPolicy {
            content_retention_secs: self.gc.content_retention_secs,
            custom_highlight_retention_secs: self.gc.custom_highlight_retention_secs,
        }
    }
}

/// Returns the path to the diffcache config file.
///
/// Prefers `$XDG_CONFIG_HOME/diffcache/config.toml`; falls back to
/// `~/.config/diffcache/config.toml` when the env var is absent.
pub fn config_path() -> PathBuf {
    let base = std::env::var("XDG_CONFIG_HOME")
        .ok()
        .map(PathBuf::from)
        .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")))
        .unwrap_or_else(|| PathBuf::from(".config"));
    base.join("diffcache").join("config.toml")
}

/// Loads the config at `path`, or defaults when it is missing or invalid.
pub fn load(path: &Path) -> Config {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) => {
            debug!(path = %path.display(), error = %err, "no config file, using defaults");
            return Config::default();
        }
    };
    parse(&raw).unwrap_or_else(|err| {
        warn!(path = %path.display(), error = %err, "config parse error, using defaults");
        Config::default()
    })
}

pub fn parse(raw: &str) -> Result<Config, toml::de::Error> {
    toml::from_str(raw)
}
