//! Config path resolution
//!
//! Everything lives in one directory next to the host executable:
//! `<host exe dir>/vulpes/`. Setting `VULPES_DIR` overrides it.

use std::path::PathBuf;

use super::{ConfigError, ConfigResult};

/// Environment variable overriding the base directory
pub const DIR_ENV: &str = "VULPES_DIR";

/// Returns the vulpes base directory.
///
/// The plugin is loaded into the host process, so `current_exe` is the
/// host executable, e.g. `C:\Games\Host\host.exe` -> `C:\Games\Host\vulpes\`.
pub fn vulpes_base_dir() -> ConfigResult<PathBuf> {
    if let Some(dir) = std::env::var_os(DIR_ENV).filter(|d| !d.is_empty()) {
        return Ok(PathBuf::from(dir));
    }

    let exe = std::env::current_exe().map_err(ConfigError::IoError)?;
    exe.parent()
        .map(|dir| dir.join("vulpes"))
        .ok_or(ConfigError::NoConfigDirectory)
}

/// Path: `<base>/config.toml`
pub fn config_path() -> ConfigResult<PathBuf> {
    Ok(vulpes_base_dir()?.join("config.toml"))
}

/// Resolve a file named in the config against the base directory.
/// Absolute paths are returned unchanged.
pub fn resolve(file: &str) -> ConfigResult<PathBuf> {
    let path = PathBuf::from(file);
    if path.is_absolute() {
        Ok(path)
    } else {
        Ok(vulpes_base_dir()?.join(path))
    }
}
