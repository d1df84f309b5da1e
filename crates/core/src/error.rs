//! Engine error types

use crate::address::Address;
use crate::memory::MemoryError;
use crate::patch::PatchKind;

/// Error type for signature, patch and cave operations
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Signature '{name}' not found")]
    SignatureNotFound { name: String, required: bool },

    #[error("Signature '{name}' matched more than once ({first} and {second})")]
    AmbiguousMatch {
        name: String,
        required: bool,
        first: Address,
        second: Address,
    },

    #[error("Invalid signature pattern: {0}")]
    InvalidPattern(String),

    #[error("Patch '{name}': {kind:?} needs at least {minimum} bytes, got {size}")]
    PatchSizeTooSmall {
        name: String,
        kind: PatchKind,
        size: usize,
        minimum: usize,
    },

    #[error("Patch '{name}': manual payload is {actual} bytes but patch size is {size}")]
    ManualSizeMismatch {
        name: String,
        size: usize,
        actual: usize,
    },

    #[error("Patch '{name}': {kind:?} requires a {expected} payload")]
    MissingPayload {
        name: String,
        kind: PatchKind,
        expected: &'static str,
    },

    #[error("Patch '{name}': branch from {from} to {to} is out of rel32 range")]
    DisplacementOutOfRange {
        name: String,
        from: Address,
        to: Address,
    },

    #[error("Patch '{name}': failed to read original bytes at {address}: {source}")]
    MemoryReadFailed {
        name: String,
        address: Address,
        #[source]
        source: MemoryError,
    },

    #[error("Patch '{name}': write to {address} denied: {source}")]
    MemoryWriteDenied {
        name: String,
        address: Address,
        required: bool,
        #[source]
        source: MemoryError,
    },

    #[error("Cave '{name}': failed to allocate glue block near {near}: {source}")]
    CaveAllocation {
        name: String,
        near: Address,
        #[source]
        source: MemoryError,
    },

    #[error("Patch '{name}' at {address} ({size} bytes) lies outside the permitted range")]
    OutsideRange {
        name: String,
        address: Address,
        size: usize,
        required: bool,
    },

    #[error("No rel32 call or jump at {address}")]
    NotABranch { address: Address },

    #[error("Address range is locked once signature scanning has started")]
    RangeLocked,

    #[error("Invalid address range: lowest {lowest} must be below highest {highest}")]
    InvalidRange { lowest: Address, highest: Address },

    #[error("No address range configured and no default range available")]
    RangeNotConfigured,

    #[error("Address {base} offset by {offset} leaves the address space")]
    AddressOverflow { base: Address, offset: isize },

    #[error("Unknown {0} handle")]
    UnknownHandle(&'static str),

    #[error(transparent)]
    Memory(#[from] MemoryError),
}

impl EngineError {
    /// Whether the failure must abort loading of the owning module.
    ///
    /// Only failures tied to a `required` signature or patch are fatal, as
    /// are programmer errors in patch declarations.
    pub fn is_fatal(&self) -> bool {
        match self {
            EngineError::SignatureNotFound { required, .. }
            | EngineError::AmbiguousMatch { required, .. }
            | EngineError::MemoryWriteDenied { required, .. }
            | EngineError::OutsideRange { required, .. } => *required,
            EngineError::PatchSizeTooSmall { .. }
            | EngineError::ManualSizeMismatch { .. }
            | EngineError::MissingPayload { .. }
            | EngineError::InvalidPattern(_) => true,
            _ => false,
        }
    }
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;
