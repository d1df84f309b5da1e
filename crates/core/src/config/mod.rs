//! Engine configuration
//!
//! A single TOML file, created with defaults on first load:
//!
//! ```toml
//! version = 1
//! debug = false
//! reject_ambiguous_signatures = false
//! check_integrity_before_revert = true
//! image_base = 0x400000
//! gamedata = "gamedata.json"
//!
//! [default_range]
//! lowest = 0x401000
//! highest = 0x5df000
//! ```

mod loader;

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::address::Address;
use crate::signature::MatchPolicy;

pub use loader::{config_path, resolve, vulpes_base_dir, DIR_ENV};

/// Configuration system errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read or write config file
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Failed to parse TOML content
    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Failed to serialize config to TOML
    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),

    /// Could not determine config directory from the host location
    #[error("Config directory not available - could not resolve host executable path")]
    NoConfigDirectory,
}

/// Result type for config operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Explicit search range, overriding the host image's code section
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeConfig {
    pub lowest: u64,
    pub highest: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Config version for future migration support
    pub version: u32,

    /// Enable debug logging
    pub debug: bool,

    /// Fail signatures that match more than once instead of taking the first match
    pub reject_ambiguous_signatures: bool,

    /// Check live bytes before reverting and warn on tampering
    pub check_integrity_before_revert: bool,

    /// Load address of the host image when it cannot be discovered
    pub image_base: u64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_range: Option<RangeConfig>,

    /// Gamedata file, relative to the config directory
    pub gamedata: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            version: 1,
            debug: false,
            reject_ambiguous_signatures: false,
            check_integrity_before_revert: true,
            image_base: 0x40_0000,
            default_range: None,
            gamedata: "gamedata.json".to_string(),
        }
    }
}

impl EngineConfig {
    /// Load config from the default path, creating it if missing
    pub fn load() -> ConfigResult<Self> {
        Self::load_from(config_path()?)
    }

    /// Save config to the default path
    pub fn save(&self) -> ConfigResult<()> {
        self.save_to(config_path()?)
    }

    /// Reload config from the default path
    pub fn reload(&mut self) -> ConfigResult<()> {
        self.reload_from(config_path()?)
    }

    /// Load config from `path`, writing defaults there if it doesn't exist
    pub fn load_from(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();

        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            tracing::debug!("Loaded config from {:?}", path);
            Ok(config)
        } else {
            let default = Self::default();
            default.save_to(path)?;
            tracing::info!("Created default config at {:?}", path);
            Ok(default)
        }
    }

    /// Save config to `path`, creating parent directories
    pub fn save_to(&self, path: impl AsRef<Path>) -> ConfigResult<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        tracing::debug!("Saved config to {:?}", path);
        Ok(())
    }

    pub fn reload_from(&mut self, path: impl AsRef<Path>) -> ConfigResult<()> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        *self = toml::from_str(&content)?;
        tracing::debug!("Reloaded config from {:?}", path);
        Ok(())
    }

    pub fn match_policy(&self) -> MatchPolicy {
        if self.reject_ambiguous_signatures {
            MatchPolicy::Unique
        } else {
            MatchPolicy::FirstMatch
        }
    }

    /// Configured default range, if any
    pub fn range(&self) -> Option<(Address, Address)> {
        let range = self.default_range?;
        let lowest = usize::try_from(range.lowest).ok()?;
        let highest = usize::try_from(range.highest).ok()?;
        Some((Address::new(lowest), Address::new(highest)))
    }

    pub fn image_base(&self) -> Option<Address> {
        usize::try_from(self.image_base)
            .ok()
            .map(Address::new)
            .filter(|a| !a.is_null())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.version, 1);
        assert!(!config.debug);
        assert!(config.check_integrity_before_revert);
        assert_eq!(config.match_policy(), MatchPolicy::FirstMatch);
        assert_eq!(config.image_base(), Some(Address::new(0x40_0000)));
        assert_eq!(config.range(), None);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: EngineConfig = toml::from_str(
            r#"
            reject_ambiguous_signatures = true

            [default_range]
            lowest = 0x401000
            highest = 0x5DF000
            "#,
        )
        .unwrap();

        assert_eq!(config.match_policy(), MatchPolicy::Unique);
        assert_eq!(
            config.range(),
            Some((Address::new(0x40_1000), Address::new(0x5D_F000)))
        );
        assert_eq!(config.gamedata, "gamedata.json");
    }

    #[test]
    fn test_load_creates_and_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vulpes").join("config.toml");

        let mut config = EngineConfig::load_from(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config, EngineConfig::default());

        config.debug = true;
        config.default_range = Some(RangeConfig {
            lowest: 0x1000,
            highest: 0x2000,
        });
        config.save_to(&path).unwrap();

        let mut other = EngineConfig::default();
        other.reload_from(&path).unwrap();
        assert_eq!(other, config);
    }
}
