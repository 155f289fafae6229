//! Configuration module for the playground
//!
//! Configuration is a YAML document with one section per subsystem. Every
//! key is optional; command line flags may override the loaded values.

pub mod loader;
pub mod types;

pub use loader::*;
pub use types::*;

#[cfg(test)]
mod tests;

use crate::errors::ConfigError;
use std::path::Path;

/// Load a configuration from a YAML file
pub async fn load_config<P: AsRef<Path>>(path: P) -> Result<SandpitConfig, ConfigError> {
    ConfigLoader::from_file(path).await
}
