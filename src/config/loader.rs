//! Configuration Loader
//!
//! Environment-aware loading built on the `config` crate. Merges built-in
//! defaults, a base TOML file, an optional per-environment TOML file and
//! prefixed environment variables, then validates the result.

use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info};

use super::error::{ConfigResult, ConfigurationError};
use super::HarvesterConfig;

/// Base configuration file used when no explicit path is given
pub const DEFAULT_CONFIG_FILE: &str = "config/harvester.toml";

/// Prefix of environment-variable overrides, e.g. `HARVESTER__BROKER__DESTINATION`
pub const ENV_PREFIX: &str = "HARVESTER";

/// Loaded, validated configuration plus where it came from
#[derive(Debug, Clone)]
pub struct ConfigManager {
    config: HarvesterConfig,
    environment: String,
    config_file: PathBuf,
}

impl ConfigManager {
    /// Load from `config/harvester.toml` (optional) with environment auto-detection
    pub fn load() -> ConfigResult<Arc<ConfigManager>> {
        Self::load_from_path(None)
    }

    /// Load from an explicit file, which then must exist
    pub fn load_from_path(path: Option<PathBuf>) -> ConfigResult<Arc<ConfigManager>> {
        Self::load_with_env_prefix(path, ENV_PREFIX)
    }

    /// Load using a custom environment-variable prefix
    ///
    /// Useful in tests that must not see the process-wide `HARVESTER__*` variables.
    pub fn load_with_env_prefix(
        path: Option<PathBuf>,
        env_prefix: &str,
    ) -> ConfigResult<Arc<ConfigManager>> {
        let environment = Self::detect_environment();
        let required = path.is_some();
        let config_file = path.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
        let override_file = Self::environment_override_path(&config_file, &environment);

        debug!(
            environment = %environment,
            config_file = %config_file.display(),
            override_file = %override_file.display(),
            env_prefix = env_prefix,
            "Loading harvester configuration"
        );

        let defaults = config::Config::try_from(&HarvesterConfig::default())
            .map_err(|e| ConfigurationError::load_error("built-in defaults", e))?;

        let merged = config::Config::builder()
            .add_source(defaults)
            .add_source(config::File::from(config_file.as_path()).required(required))
            .add_source(config::File::from(override_file.as_path()).required(false))
            .add_source(
                config::Environment::with_prefix(env_prefix)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| ConfigurationError::load_error(config_file.display().to_string(), e))?;

        let config: HarvesterConfig = merged
            .try_deserialize()
            .map_err(ConfigurationError::deserialize_error)?;
        config.validate()?;

        info!(
            environment = %environment,
            destination = %config.broker.destination,
            completion_timeout_ms = config.node.completion_timeout_ms,
            "⚙️ Configuration loaded successfully"
        );

        Ok(Arc::new(ConfigManager {
            config,
            environment,
            config_file,
        }))
    }

    /// Wrap an already-built configuration after validating it
    pub fn from_config(config: HarvesterConfig) -> ConfigResult<ConfigManager> {
        config.validate()?;
        Ok(ConfigManager {
            config,
            environment: Self::detect_environment(),
            config_file: PathBuf::from(DEFAULT_CONFIG_FILE),
        })
    }

    pub fn config(&self) -> &HarvesterConfig {
        &self.config
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn config_file(&self) -> &Path {
        &self.config_file
    }

    /// Detect the running environment from `HARVESTER_ENV`, then `APP_ENV`
    pub fn detect_environment() -> String {
        env::var("HARVESTER_ENV")
            .or_else(|_| env::var("APP_ENV"))
            .unwrap_or_else(|_| "development".to_string())
    }

    /// `config/harvester.toml` + `test` ⇒ `config/harvester.test.toml`
    fn environment_override_path(config_file: &Path, environment: &str) -> PathBuf {
        let stem = config_file
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("harvester");
        let extension = config_file
            .extension()
            .and_then(|s| s.to_str())
            .unwrap_or("toml");
        config_file.with_file_name(format!("{stem}.{environment}.{extension}"))
    }
}
