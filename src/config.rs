//! Configuration management for storch

use std::path::{Path, PathBuf};
use std::sync::Arc;

use lazy_static::lazy_static;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{StorchError, StorchResult};

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Defaults for [`crate::StorchContext::backward`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackwardConfig {
    pub retain_graph: bool,
    pub debug: bool,
    pub print_costs: bool,
}

impl Default for BackwardConfig {
    fn default() -> Self {
        Self {
            retain_graph: false,
            debug: false,
            print_costs: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SamplingConfig {
    /// Seed for the context RNG; `None` seeds from entropy
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DevelopmentConfig {
    pub log_level: String,
}

impl Default for DevelopmentConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorchConfig {
    pub backward: BackwardConfig,
    pub sampling: SamplingConfig,
    pub development: DevelopmentConfig,
}

impl StorchConfig {
    pub fn validate(&self) -> StorchResult<()> {
        if !LOG_LEVELS.contains(&self.development.log_level.as_str()) {
            return Err(StorchError::ConfigurationError(format!(
                "unknown log level '{}', expected one of {:?}",
                self.development.log_level, LOG_LEVELS
            )));
        }
        Ok(())
    }
}

/// Configuration manager backed by an optional JSON file
pub struct ConfigManager {
    config: Arc<RwLock<StorchConfig>>,
    config_file: Option<PathBuf>,
}

impl ConfigManager {
    pub fn new() -> Self {
        Self {
            config: Arc::new(RwLock::new(StorchConfig::default())),
            config_file: None,
        }
    }

    pub fn with_config_file(mut self, path: PathBuf) -> Self {
        self.config_file = Some(path);
        self
    }

    pub fn load_from_file(&mut self, path: &Path) -> StorchResult<()> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            StorchError::operation_error("config", &format!("Failed to read config file: {}", e))
        })?;

        let config: StorchConfig = serde_json::from_str(&content).map_err(|e| {
            StorchError::operation_error("config", &format!("Failed to parse config file: {}", e))
        })?;
        config.validate()?;

        *self.config.write() = config;
        self.config_file = Some(path.to_path_buf());

        tracing::info!("Configuration loaded from {:?}", path);
        Ok(())
    }

    pub fn save_to_file(&self, path: &Path) -> StorchResult<()> {
        let content = serde_json::to_string_pretty(&*self.config.read())?;
        std::fs::write(path, content).map_err(|e| {
            StorchError::operation_error("config", &format!("Failed to write config file: {}", e))
        })?;

        tracing::info!("Configuration saved to {:?}", path);
        Ok(())
    }

    pub fn get_config(&self) -> StorchConfig {
        self.config.read().clone()
    }

    /// Apply `f`, validate, and persist to the attached file if any.
    /// An invalid result leaves the previous configuration in place.
    pub fn update_config<F>(&mut self, f: F) -> StorchResult<()>
    where
        F: FnOnce(&mut StorchConfig),
    {
        let mut next = self.get_config();
        f(&mut next);
        next.validate()?;
        *self.config.write() = next;

        if let Some(path) = &self.config_file {
            self.save_to_file(path)?;
        }
        Ok(())
    }

    pub fn set_config(&mut self, config: StorchConfig) -> StorchResult<()> {
        self.update_config(|c| *c = config)
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

lazy_static! {
    static ref CONFIG_MANAGER: RwLock<ConfigManager> = RwLock::new(ConfigManager::new());
}

/// Get the global configuration
pub fn get_config() -> StorchConfig {
    CONFIG_MANAGER.read().get_config()
}

/// Update the global configuration
pub fn update_config<F>(f: F) -> StorchResult<()>
where
    F: FnOnce(&mut StorchConfig),
{
    CONFIG_MANAGER.write().update_config(f)
}

/// Load the global configuration from a JSON file
pub fn load_config_from_file(path: &Path) -> StorchResult<()> {
    CONFIG_MANAGER.write().load_from_file(path)
}

/// Builder for assembling a configuration in code
pub struct ConfigBuilder {
    config: StorchConfig,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: StorchConfig::default(),
        }
    }

    pub fn backward(mut self, f: impl FnOnce(&mut BackwardConfig)) -> Self {
        f(&mut self.config.backward);
        self
    }

    pub fn sampling(mut self, f: impl FnOnce(&mut SamplingConfig)) -> Self {
        f(&mut self.config.sampling);
        self
    }

    pub fn development(mut self, f: impl FnOnce(&mut DevelopmentConfig)) -> Self {
        f(&mut self.config.development);
        self
    }

    pub fn build(self) -> StorchResult<StorchConfig> {
        self.config.validate()?;
        Ok(self.config)
    }

    pub fn apply(self) -> StorchResult<()> {
        update_config(|config| *config = self.config)
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
