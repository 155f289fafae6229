//! Configuration loader for YAML files
//!
//! Loads the playground configuration from a YAML file or string and
//! validates it before it is handed to the rest of the service.

use crate::config::types::SandpitConfig;
use crate::errors::ConfigError;
use std::path::Path;
use tokio::fs;

/// Configuration loader with validation
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from a YAML file
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<SandpitConfig, ConfigError> {
        let path = path.as_ref();

        let content = fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.display().to_string(),
                source,
            })?;

        Self::from_str(&content)
    }

    /// Load configuration from a file if it exists, otherwise use defaults
    pub async fn from_file_or_default<P: AsRef<Path>>(
        path: P,
    ) -> Result<SandpitConfig, ConfigError> {
        let path = path.as_ref();
        if fs::try_exists(path).await.unwrap_or(false) {
            log::info!("Loading configuration from file: {}", path.display());
            Self::from_file(path).await
        } else {
            log::info!(
                "Configuration file {} not found, using defaults",
                path.display()
            );
            let config = SandpitConfig::default();
            config.validate()?;
            Ok(config)
        }
    }

    /// Load configuration from a YAML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<SandpitConfig, ConfigError> {
        // An empty document deserializes to unit, not to an empty mapping.
        let config: SandpitConfig = if content.trim().is_empty() {
            SandpitConfig::default()
        } else {
            serde_yaml::from_str(content)?
        };

        config.validate()?;

        Ok(config)
    }
}
