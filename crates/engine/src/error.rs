//! Error types for loading and unloading the engine

use vulpes_core::{ConfigError, EngineError, GamedataError, MemoryError};

/// Error type for engine lifecycle operations
#[derive(Debug, thiserror::Error)]
pub enum LoaderError {
    /// The host executable's code range could not be determined
    #[error("Host image not found: {0}")]
    HostImageNotFound(String),

    /// Host image headers could not be read or parsed
    #[error("Invalid host image: {0}")]
    InvalidImage(#[from] MemoryError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Gamedata(#[from] GamedataError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    /// Engine already initialized
    #[error("Engine already initialized")]
    AlreadyInitialized,

    #[error("Engine not initialized")]
    NotInitialized,
}
