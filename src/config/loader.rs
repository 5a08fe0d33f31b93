use std::{collections::HashMap, env, fs, path::{Path, PathBuf}};
use crate::errors::ConfigError;

use super::container_config::ContainerConfig;

pub const CONFIG_FILE_NAME: &str = "scopegraph.toml";

/// Loads container configuration from a TOML file and the environment
pub struct ConfigLoader {
    base_path: Option<PathBuf>,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    /// Look for `scopegraph.toml` in the current directory
    pub fn new() -> Self {
        Self { base_path: None }
    }

    /// Create a config loader with custom base path (for testing)
    pub fn with_base_path(base_path: PathBuf) -> Self {
        Self { base_path: Some(base_path) }
    }

    pub fn config_path(&self) -> PathBuf {
        match &self.base_path {
            Some(base) => base.join(CONFIG_FILE_NAME),
            None => PathBuf::from(CONFIG_FILE_NAME),
        }
    }

    /// File (if present) + environment overrides; a missing file means defaults
    pub fn load_config(&self) -> Result<ContainerConfig, ConfigError> {
        let path = self.config_path();
        let config = if path.exists() {
            Self::load_file(&path)?
        } else {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            ContainerConfig::default()
        };
        config.apply_env(&self.collect_env_vars())
    }

    pub fn load_file(path: &Path) -> Result<ContainerConfig, ConfigError> {
        let display = path.display().to_string();
        let content = fs::read_to_string(path).map_err(|e| ConfigError::FileRead(display.clone(), e))?;
        toml::from_str(&content).map_err(|e| ConfigError::TomlParse(display, e))
    }

    /// Collect the `SCOPEGRAPH_*` environment variables
    pub fn collect_env_vars(&self) -> HashMap<String, String> {
        env::vars().filter(|(key, _)| key.starts_with("SCOPEGRAPH_")).collect()
    }
}
