//! vulpes core - signature scanning and revertible code patching
//!
//! Locates code in a running host image by byte signature, overwrites it
//! with small machine-code patches, and restores the original bytes on
//! unload. Everything created during a load cycle is owned by an
//! [`EngineContext`].
//!
//! # Example
//!
//! ```ignore
//! use vulpes_core::{pattern, CodePatch, EngineConfig, EngineContext, PatchKind, ProcessMemory, Signature};
//!
//! let mut ctx = EngineContext::new(Box::new(ProcessMemory::new()), EngineConfig::default());
//! let frags = ctx.add_signature(Signature::new("AddFrags", true, pattern!("83 C4 10 85 C0 74 ? 8B 08")));
//! ctx.add_patch(CodePatch::at_signature("skip_frag_check", frags, 5, 2, PatchKind::Nop));
//! ctx.init_all()?;
//! ```

// Allow the crate to refer to itself as `vulpes_core` for proc macro compatibility
extern crate self as vulpes_core;

pub mod address;
pub mod behavior;
pub mod cave;
pub mod config;
pub mod context;
pub mod error;
pub mod gamedata;
pub mod hooks;
pub mod memory;
pub mod patch;
pub mod range;
pub mod signature;

pub use address::Address;
pub use behavior::{BehaviorError, BehaviorTable};
pub use cave::{AfterFn, BeforeFn, CavePolicy, CodeCave};
pub use config::{ConfigError, ConfigResult, EngineConfig};
pub use context::{CaveKey, EngineContext, InitReport, PatchKey, SignatureKey};
pub use error::{EngineError, EngineResult};
pub use gamedata::{Gamedata, GamedataError};
pub use hooks::{HookEvent, HookFn, HookRegistry, OrderedHookList};
pub use memory::{CodeMemory, ImageMemory, MemoryError, ProcessMemory};
pub use patch::{
    branch_target, retarget_branch, CodePatch, Condition, IntegrityStatus, PatchBytes, PatchKind,
    PatchTarget, Payload,
};
pub use range::AddressRange;
pub use signature::{MatchPolicy, Pattern, Signature};

// Re-export macros
pub use vulpes_macros::{event_hook, pattern};
