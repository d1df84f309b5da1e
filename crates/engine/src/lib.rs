//! vulpes engine - host discovery and global storage
//!
//! This crate handles:
//! - Finding the host executable's code range, the default signature search range
//! - Building the [`EngineContext`](vulpes_core::EngineContext) for a load cycle
//! - Storing it in a process-global slot between load and unload
//!
//! # Thread Safety
//!
//! The context lives behind a `parking_lot::RwLock`. Hook dispatch clones the
//! shared registry out of the slot and runs callbacks without the lock held.

pub mod error;
pub mod globals;
pub mod loader;

pub use error::LoaderError;
pub use globals::{
    hooks, init_engine, is_engine_initialized, is_main_thread, shutdown_engine, with_engine,
};
pub use loader::{discover_host_image, load_context, pe_image, HostImage};
