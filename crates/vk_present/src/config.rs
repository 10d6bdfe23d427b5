//! Configuration for GPU bring-up
//!
//! Runtime toggles consumed by the presentation layer: validation layer
//! enablement, the requested API version, and the size of the shared present
//! fence pool. Values come from a TOML/RON file, with an environment override
//! for validation so debugging can be flipped on without editing files.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Environment variable that overrides [`GpuConfig::enable_validation`].
/// Any value other than `0`, `false` or `off` enables validation.
pub const VALIDATION_ENV_VAR: &str = "VK_PRESENT_VALIDATION";

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Parse error
    #[error("Parse error: {0}")]
    Parse(String),

    /// Unsupported format
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),
}

/// Requested Vulkan API version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiVersion {
    /// Major version component
    pub major: u32,
    /// Minor version component
    pub minor: u32,
}

impl ApiVersion {
    /// Pack into the Vulkan version encoding.
    pub fn make(self) -> u32 {
        ash::vk::make_api_version(0, self.major, self.minor, 0)
    }
}

impl Default for ApiVersion {
    fn default() -> Self {
        Self { major: 1, minor: 0 }
    }
}

/// Runtime configuration for GPU bring-up.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GpuConfig {
    /// Human-readable application name passed to instance creation
    pub application_name: String,
    /// Application version packed into instance creation
    pub application_version: ApiVersion,
    /// Vulkan API version to request
    pub api_version: ApiVersion,
    /// Whether to negotiate validation layers and the debug-utils extension
    pub enable_validation: bool,
    /// Number of threads expected to present concurrently; sizes the shared
    /// fence pool
    pub present_threads: usize,
}

impl Default for GpuConfig {
    fn default() -> Self {
        Self {
            application_name: "vk_present".to_string(),
            application_version: ApiVersion { major: 1, minor: 0 },
            api_version: ApiVersion::default(),
            enable_validation: cfg!(debug_assertions),
            present_threads: 2,
        }
    }
}

impl GpuConfig {
    /// Load configuration from a `.toml` or `.ron` file.
    pub fn load_from_file(path: &str) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;

        let config: Self = if path.ends_with(".toml") {
            toml::from_str(&contents).map_err(|e| ConfigError::Parse(e.to_string()))?
        } else if path.ends_with(".ron") {
            ron::from_str(&contents).map_err(|e| ConfigError::Parse(e.to_string()))?
        } else {
            return Err(ConfigError::UnsupportedFormat(path.to_string()));
        };

        Ok(config.with_env_overrides())
    }

    /// Save configuration to a `.toml` or `.ron` file.
    pub fn save_to_file(&self, path: &str) -> Result<(), ConfigError> {
        let contents = if path.ends_with(".toml") {
            toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))?
        } else if path.ends_with(".ron") {
            ron::ser::to_string_pretty(self, Default::default())
                .map_err(|e| ConfigError::Parse(e.to_string()))?
        } else {
            return Err(ConfigError::UnsupportedFormat(path.to_string()));
        };

        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Apply environment overrides on top of the current values.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(value) = std::env::var(VALIDATION_ENV_VAR) {
            self.enable_validation = !matches!(value.as_str(), "0" | "false" | "off");
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = GpuConfig::default();
        assert_eq!(config.application_name, "vk_present");
        assert_eq!(config.present_threads, 2);
        assert_eq!(config.api_version, ApiVersion { major: 1, minor: 0 });
    }

    #[test]
    fn test_toml_round_trip() {
        let mut config = GpuConfig::default();
        config.application_name = "demo".to_string();
        config.present_threads = 4;

        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: GpuConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.application_name, "demo");
        assert_eq!(parsed.present_threads, 4);
        assert_eq!(parsed.enable_validation, config.enable_validation);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let parsed: GpuConfig = toml::from_str("present_threads = 8\n").unwrap();
        assert_eq!(parsed.present_threads, 8);
        assert_eq!(parsed.application_name, "vk_present");
    }

    #[test]
    fn test_api_version_packing() {
        let version = ApiVersion { major: 1, minor: 2 };
        assert_eq!(version.make(), ash::vk::make_api_version(0, 1, 2, 0));
    }
}
