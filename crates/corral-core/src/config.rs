//! Configuration resolution for Corral.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/corral/settings.json)
//! 3. Project config (.corral/settings.json)
//! 4. Environment variables
//! 5. CLI arguments (highest priority, applied by the binary)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Default cap on buffered, unterminated stream input (10 MB).
pub const DEFAULT_MAX_BUFFER_BYTES: usize = 10 * 1024 * 1024;

/// Complete Corral configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            registry: RegistryConfig::default(),
            stream: StreamConfig::default(),
            log_level: default_log_level(),
        }
    }
}

/// Execution registry configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Maximum number of executions in the `Running` state.
    pub max_concurrent: usize,
    /// Per-execution timeout in seconds. `None` disables the timeout.
    pub timeout_secs: Option<u64>,
    /// Number of records kept before the retention sweep trims terminal ones.
    pub max_history: usize,
    /// Interval between retention sweeps in seconds. `0` disables the sweep.
    pub sweep_interval_secs: u64,
    /// Grace period between SIGTERM and SIGKILL when killing a subprocess.
    pub terminate_grace_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 5,
            timeout_secs: None,
            max_history: 100,
            sweep_interval_secs: 60,
            terminate_grace_secs: 5,
        }
    }
}

/// Line stream parser configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Maximum bytes held for a single unterminated line.
    pub max_buffer_bytes: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            max_buffer_bytes: DEFAULT_MAX_BUFFER_BYTES,
        }
    }
}

/// Settings file contents. Only the keys a file sets override lower layers.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ConfigOverlay {
    registry: RegistryOverlay,
    stream: StreamOverlay,
    log_level: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RegistryOverlay {
    max_concurrent: Option<usize>,
    timeout_secs: Option<u64>,
    max_history: Option<usize>,
    sweep_interval_secs: Option<u64>,
    terminate_grace_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct StreamOverlay {
    max_buffer_bytes: Option<usize>,
}

impl Config {
    /// Check values that would otherwise be rejected at use time.
    pub fn validate(&self) -> Result<()> {
        if self.registry.max_concurrent == 0 {
            return Err(Error::Config("registry.max_concurrent must be > 0".into()));
        }
        if self.stream.max_buffer_bytes == 0 {
            return Err(Error::Config("stream.max_buffer_bytes must be > 0".into()));
        }
        if self.registry.timeout_secs == Some(0) {
            return Err(Error::Config(
                "registry.timeout_secs must be > 0 when set".into(),
            ));
        }
        Ok(())
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(project_dir: Option<&Path>) -> Result<Config> {
    let mut config = Config::default();

    if let Some(global_path) = global_config_path()
        && global_path.exists()
    {
        merge_config(&mut config, read_overlay(&global_path)?);
    }

    if let Some(dir) = project_dir {
        let project_path = dir.join(".corral").join("settings.json");
        if project_path.exists() {
            merge_config(&mut config, read_overlay(&project_path)?);
        }
    }

    apply_env_overrides(&mut config);
    config.validate()?;

    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("corral").join("settings.json"))
}

/// Read and parse a single JSON settings file on top of the defaults.
pub fn load_config_file(path: &Path) -> Result<Config> {
    let mut config = Config::default();
    merge_config(&mut config, read_overlay(path)?);
    Ok(config)
}

fn read_overlay(path: &Path) -> Result<ConfigOverlay> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

fn merge_config(base: &mut Config, overlay: ConfigOverlay) {
    let registry = overlay.registry;
    if let Some(n) = registry.max_concurrent {
        base.registry.max_concurrent = n;
    }
    if let Some(n) = registry.timeout_secs {
        base.registry.timeout_secs = Some(n);
    }
    if let Some(n) = registry.max_history {
        base.registry.max_history = n;
    }
    if let Some(n) = registry.sweep_interval_secs {
        base.registry.sweep_interval_secs = n;
    }
    if let Some(n) = registry.terminate_grace_secs {
        base.registry.terminate_grace_secs = n;
    }
    if let Some(n) = overlay.stream.max_buffer_bytes {
        base.stream.max_buffer_bytes = n;
    }
    if let Some(level) = overlay.log_level {
        base.log_level = level;
    }
}

fn apply_env_overrides(config: &mut Config) {
    if let Some(n) = env_parse("CORRAL_MAX_CONCURRENT") {
        config.registry.max_concurrent = n;
    }
    if let Some(n) = env_parse("CORRAL_TIMEOUT_SECS") {
        config.registry.timeout_secs = Some(n);
    }
    if let Some(n) = env_parse("CORRAL_MAX_HISTORY") {
        config.registry.max_history = n;
    }
    if let Some(n) = env_parse("CORRAL_SWEEP_INTERVAL_SECS") {
        config.registry.sweep_interval_secs = n;
    }
    if let Some(n) = env_parse("CORRAL_MAX_BUFFER_BYTES") {
        config.stream.max_buffer_bytes = n;
    }
    if let Ok(val) = std::env::var("CORRAL_LOG_LEVEL") {
        config.log_level = val;
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.registry.max_concurrent, 5);
        assert_eq!(config.stream.max_buffer_bytes, DEFAULT_MAX_BUFFER_BYTES);
        assert!(config.registry.timeout_secs.is_none());
    }

    #[test]
    fn zero_concurrency_rejected() {
        let mut config = Config::default();
        config.registry.max_concurrent = 0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"registry":{"max_concurrent":2}}"#).unwrap();

        let config = load_config_file(&path).unwrap();
        assert_eq!(config.registry.max_concurrent, 2);
        assert_eq!(config.registry.max_history, 100);
        assert_eq!(config.stream.max_buffer_bytes, DEFAULT_MAX_BUFFER_BYTES);
    }

    #[test]
    fn project_file_overrides_only_the_keys_it_sets() {
        let dir = tempfile::TempDir::new().unwrap();
        let global = dir.path().join("global.json");
        let project = dir.path().join("project.json");
        std::fs::write(
            &global,
            r#"{"registry":{"max_concurrent":2,"timeout_secs":30},"log_level":"debug"}"#,
        )
        .unwrap();
        std::fs::write(&project, r#"{"registry":{"max_history":7}}"#).unwrap();

        let mut config = Config::default();
        merge_config(&mut config, read_overlay(&global).unwrap());
        merge_config(&mut config, read_overlay(&project).unwrap());

        assert_eq!(config.registry.max_concurrent, 2);
        assert_eq!(config.registry.timeout_secs, Some(30));
        assert_eq!(config.registry.max_history, 7);
        assert_eq!(config.registry.sweep_interval_secs, 60);
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn malformed_file_reports_path() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{ not json").unwrap();

        let err = load_config_file(&path).unwrap_err();
        assert!(err.to_string().contains("settings.json"));
    }
}
