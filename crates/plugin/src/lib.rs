//! vulpes loader - FFI layer
//!
//! Compiles to a cdylib (.so/.dll) that a host-side loader calls through the
//! C ABI in [`ffi`]. Load reads the config, builds the engine context,
//! declares the tick cave and applies everything; unload reverts it.

pub mod ffi;
mod logging;
pub mod tick;

use tracing::info;

use vulpes_core::EngineConfig;
use vulpes_engine::{init_engine, load_context, shutdown_engine, LoaderError};

/// Load the engine
///
/// Called from the FFI layer when the host loads the plugin.
pub fn load() -> Result<(), LoaderError> {
    let config = match EngineConfig::load() {
        Ok(config) => config,
        Err(e) => {
            logging::init(false);
            tracing::warn!("Failed to load config, using defaults: {}", e);
            EngineConfig::default()
        }
    };
    logging::init(config.debug);

    info!("vulpes loading...");

    let mut context = load_context(config)?;
    tick::install(&mut context)?;

    // A fatal error drops the context here, reverting whatever was applied
    let report = context.init_all()?;
    for (name, e) in &report.disabled {
        tracing::warn!("Feature '{}' disabled: {}", name, e);
    }

    init_engine(context)?;
    info!("vulpes loaded ({} patches applied)", report.applied);
    Ok(())
}

/// Shutdown the engine
///
/// Called from the FFI layer when the host unloads the plugin.
pub fn shutdown() -> Result<(), LoaderError> {
    info!("vulpes shutting down...");
    let failures = shutdown_engine()?;
    if failures > 0 {
        tracing::warn!("{} patches could not be reverted", failures);
    }
    Ok(())
}
