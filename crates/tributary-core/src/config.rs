//! Configuration management for Tributary services.
//!
//! Configuration is loaded from (in priority order):
//! 1. Environment variables (TRIBUTARY_ prefix, `__` separator)
//! 2. Config file (tributary.toml, or the prefix passed on the command line)
//! 3. Defaults

use serde::de::DeserializeOwned;

/// Environment variable prefix for every section.
pub const ENV_PREFIX: &str = "TRIBUTARY";

/// Build the layered configuration for the given file prefix.
pub fn load_layered(file_prefix: &str) -> Result<config::Config, config::ConfigError> {
    config::Config::builder()
        .add_source(config::File::with_name(file_prefix).required(false))
        .add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        )
        .build()
}

/// Deserialize one section, falling back to defaults when it is absent.
///
/// A section that is present but malformed is an error, not a silent default.
pub fn section<T>(cfg: &config::Config, key: &str) -> Result<T, config::ConfigError>
where
    T: DeserializeOwned + Default,
{
    match cfg.get::<T>(key) {
        Ok(value) => Ok(value),
        Err(config::ConfigError::NotFound(_)) => Ok(T::default()),
        Err(e) => Err(e),
    }
}
