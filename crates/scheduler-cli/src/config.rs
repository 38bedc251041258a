//! TOML configuration for the `scheduler` binary, parsed the way
//! `agentor-cli::main::AgentorConfig` parses `agentor.toml`.

use std::path::PathBuf;

use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,

    #[serde(default = "default_misfire_threshold_seconds")]
    pub misfire_threshold_seconds: i64,

    /// Descriptor file installed at startup. Overridable by `--descriptor`.
    pub descriptor_path: Option<PathBuf>,

    /// Watch `descriptor_path` for changes and install any new jobs or
    /// triggers it gains, debounced.
    #[serde(default)]
    pub hot_reload: bool,

    #[serde(default = "default_debounce_ms")]
    pub hot_reload_debounce_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: default_worker_pool_size(),
            misfire_threshold_seconds: default_misfire_threshold_seconds(),
            descriptor_path: None,
            hot_reload: false,
            hot_reload_debounce_ms: default_debounce_ms(),
        }
    }
}

fn default_worker_pool_size() -> usize {
    10
}

fn default_misfire_threshold_seconds() -> i64 {
    5
}

fn default_debounce_ms() -> u64 {
    500
}

/// Read and parse a TOML config file. A missing file is not an error —
/// the caller gets `SchedulerConfig::default()` instead, matching the
/// teacher's tolerance for an absent `agentor.toml` in local/dev runs.
pub fn load_config(path: &std::path::Path) -> anyhow::Result<SchedulerConfig> {
    if !path.exists() {
        tracing::debug!(path = %path.display(), "no config file found, using defaults");
        return Ok(SchedulerConfig::default());
    }
    let content = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read config '{}': {e}", path.display()))?;
    let config: SchedulerConfig = toml::from_str(&content)
        .map_err(|e| anyhow::anyhow!("failed to parse config '{}': {e}", path.display()))?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_config_uses_defaults() {
        let config = load_config(std::path::Path::new("/nonexistent/scheduler.toml")).unwrap();
        assert_eq!(config.worker_pool_size, 10);
        assert!(!config.hot_reload);
    }

    #[test]
    fn test_partial_config_overrides_only_given_fields() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut tmp, b"worker_pool_size = 4\nhot_reload = true\n").unwrap();
        let config = load_config(tmp.path()).unwrap();
        assert_eq!(config.worker_pool_size, 4);
        assert!(config.hot_reload);
        assert_eq!(config.misfire_threshold_seconds, 5);
    }
}
