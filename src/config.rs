//! Configuration management for svcrack.
//!
//! This module defines the structure of the `services_config.json` document
//! (registered services, named groups, autostart groups and optional tool
//! settings) and provides functionality to load, create and save it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// File name used when no `--config` path is given.
pub const DEFAULT_CONFIG_FILE: &str = "services_config.json";

/// Top-level document corresponding to `services_config.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServicesConfig {
    /// Registered script paths, in display order.
    #[serde(default, deserialize_with = "de::services")]
    pub services: Vec<String>,
    /// Named groups of service paths.
    #[serde(default, deserialize_with = "de::null_default")]
    pub groups: BTreeMap<String, Vec<String>>,
    /// Groups started automatically shortly after launch.
    #[serde(default, deserialize_with = "de::null_default")]
    pub autostart_groups: Vec<String>,
    /// Optional tool preferences.
    #[serde(default, skip_serializing_if = "Settings::is_empty")]
    pub settings: Settings,
}

/// Tool preferences stored alongside the registry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Interpreter command used for `.py` services (e.g. "python3" or "py -3").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub python: Option<String>,
    /// Interval between file refreshes in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_ms: Option<u64>,
    /// Maximum number of log lines kept for the log pane.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_lines: Option<usize>,
    /// Whether to use Unicode symbols in the TUI.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbols: Option<bool>,
    /// Delay between SIGTERM and SIGKILL for a forced stop.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_grace_ms: Option<u64>,
    /// How long a stop waits for the process to exit before killing it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_timeout_ms: Option<u64>,
    /// How long quitting waits for graceful exits before force-killing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shutdown_timeout_ms: Option<u64>,
    /// Delay before autostart groups are launched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub autostart_delay_ms: Option<u64>,
}

impl Settings {
    pub fn is_empty(&self) -> bool {
        self == &Settings::default()
    }
}

mod de {
    use serde::{Deserialize, Deserializer};

    pub fn null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
    where
        D: Deserializer<'de>,
        T: Default + Deserialize<'de>,
    {
        Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
    }

    // Hand-edited files sometimes carry nulls or numbers in the list; keep the strings.
    pub fn services<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Option::<Vec<serde_json::Value>>::deserialize(deserializer)?.unwrap_or_default();
        Ok(raw
            .into_iter()
            .filter_map(|value| match value {
                serde_json::Value::String(path) if !path.is_empty() => Some(path),
                _ => None,
            })
            .collect())
    }
}

/// Returns the config path to use: the explicit one, or the default file in the
/// current directory.
pub fn resolve_config_path(explicit: Option<&Path>) -> PathBuf {
    explicit
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
}

/// Parses a config document from a string.
pub fn parse_config(raw: &str) -> Result<ServicesConfig> {
    serde_json::from_str(raw).context("invalid services config")
}

/// Loads the config from `path`, creating an empty document first when the file
/// does not exist.
///
/// Creation failures are logged and an empty config is returned. A file that
/// exists but cannot be read or parsed also yields empty defaults.
pub fn load_or_create(path: &Path) -> ServicesConfig {
    if !path.exists() {
        if let Err(err) = save_config(path, &ServicesConfig::default()) {
            tracing::error!(path = %path.display(), error = %err, "failed to create config");
        } else {
            tracing::info!(path = %path.display(), "created empty config");
        }
        return ServicesConfig::default();
    }

    match load_config(path) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = ?err,
                "failed to load config, using empty defaults"
            );
            ServicesConfig::default()
        }
    }
}

/// Loads and parses the config from a file path.
pub fn load_config(path: &Path) -> Result<ServicesConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    parse_config(&raw).with_context(|| format!("failed to parse config file {}", path.display()))
}

/// Writes the whole document pretty-printed with two-space indentation.
pub fn save_config(path: &Path, config: &ServicesConfig) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let raw = serde_json::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(path, raw)
        .with_context(|| format!("failed to write config file {}", path.display()))?;
    Ok(())
}
