//! Event hooks
//!
//! Ordered callback lists, one per [`HookEvent`]. Lists are filled during
//! init and drained from caves placed in the host's tick and map-load code.

pub mod list;
pub mod registry;

pub use list::{HookFn, OrderedHookList};
pub use registry::{HookEvent, HookRegistry};
